//! Parsing, merging, pruning and serialization of pprof CPU profiles.
//!
//! The wire format is the gzip-compressed protobuf encoding of
//! `perftools.profiles.Profile`. The rest of the crate treats this module as
//! an opaque library: profiles go in, merged or pruned profiles come out.

pub mod proto;

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use anyhow::{bail, ensure, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use regex::Regex;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A validated, decoded profile.
#[derive(Debug, Clone)]
pub struct Profile {
    proto: proto::Profile,
}

impl Profile {
    /// Parse a profile from its wire encoding, transparently decompressing
    /// gzip input. Fails on undecodable or structurally invalid data.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let raw = if data.starts_with(&GZIP_MAGIC) {
            let mut decompressed = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut decompressed)
                .context("decompressing profile")?;
            decompressed
        } else {
            data.to_vec()
        };

        let decoded = proto::Profile::decode(raw.as_slice()).context("decoding profile")?;
        Self::from_proto(decoded)
    }

    /// Validate a decoded message and wrap it.
    pub fn from_proto(proto: proto::Profile) -> Result<Self> {
        validate(&proto)?;
        Ok(Self { proto })
    }

    pub fn as_proto(&self) -> &proto::Profile {
        &self.proto
    }

    /// Serialize to the gzip-compressed wire encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(self.proto.encoded_len());
        self.proto.encode(&mut raw).context("encoding profile")?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).context("compressing profile")?;
        encoder.finish().context("compressing profile")
    }

    fn str_of(&self, index: i64) -> &str {
        self.proto
            .string_table
            .get(index as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    fn sample_type_names(&self) -> Vec<(&str, &str)> {
        self.proto
            .sample_type
            .iter()
            .map(|vt| (self.str_of(vt.r#type), self.str_of(vt.unit)))
            .collect()
    }

    /// Function names reachable from at least one sample's stack. Used by
    /// assertions on prune behavior; entries left in the function table by
    /// pruning but no longer referenced do not appear here.
    pub fn sampled_function_names(&self) -> HashSet<String> {
        let functions: HashMap<u64, &str> = self
            .proto
            .function
            .iter()
            .map(|f| (f.id, self.str_of(f.name)))
            .collect();

        let locations: HashMap<u64, &proto::Location> =
            self.proto.location.iter().map(|l| (l.id, l)).collect();

        let mut names = HashSet::new();
        for sample in &self.proto.sample {
            for location_id in &sample.location_id {
                let Some(location) = locations.get(location_id) else {
                    continue;
                };

                for line in &location.line {
                    if let Some(name) = functions.get(&line.function_id) {
                        names.insert((*name).to_string());
                    }
                }
            }
        }

        names
    }

    /// Sum of the given value index across samples whose stack contains the
    /// named function.
    pub fn value_for(&self, function_name: &str, value_index: usize) -> i64 {
        let function_ids: HashSet<u64> = self
            .proto
            .function
            .iter()
            .filter(|f| self.str_of(f.name) == function_name)
            .map(|f| f.id)
            .collect();

        let location_ids: HashSet<u64> = self
            .proto
            .location
            .iter()
            .filter(|l| l.line.iter().any(|line| function_ids.contains(&line.function_id)))
            .map(|l| l.id)
            .collect();

        self.proto
            .sample
            .iter()
            .filter(|s| s.location_id.iter().any(|id| location_ids.contains(id)))
            .filter_map(|s| s.value.get(value_index))
            .sum()
    }

    /// Merge profiles into one: sample sets are summed for identical stacks
    /// and labels, mapping/function/location tables are unioned and
    /// re-interned. Profiles must share sample types.
    pub fn merge(profiles: Vec<Profile>) -> Result<Profile> {
        ensure!(!profiles.is_empty(), "no profiles to merge");

        let expected = profiles[0].sample_type_names();
        for profile in &profiles[1..] {
            if profile.sample_type_names() != expected {
                bail!("profiles have incompatible sample types");
            }
        }

        let mut merger = Merger::new();
        for profile in &profiles {
            merger.absorb(profile);
        }

        Profile::from_proto(merger.finish())
    }

    /// Remove call-graph nodes matching `drop` (unless they also match
    /// `keep`) along with everything beneath them. Matching follows the
    /// reference pprof implementation: locations are matched on their
    /// outermost frame first, and frames above the first retained root
    /// frame are never pruned away entirely.
    pub fn prune(&mut self, drop: Option<&Regex>, keep: Option<&Regex>) {
        let Some(drop) = drop else {
            return;
        };

        let function_names: HashMap<u64, String> = self
            .proto
            .function
            .iter()
            .map(|f| (f.id, self.str_of(f.name).to_string()))
            .collect();

        let matches = |function_id: u64| -> bool {
            let Some(name) = function_names.get(&function_id) else {
                return false;
            };

            drop.is_match(name) && !keep.is_some_and(|k| k.is_match(name))
        };

        let mut prune = HashSet::new();
        let mut prune_beneath = HashSet::new();

        for location in &mut self.proto.location {
            // Scan inline frames from the outermost caller inwards.
            let mut matched = None;
            for i in (0..location.line.len()).rev() {
                if matches(location.line[i].function_id) {
                    matched = Some(i);
                    break;
                }
            }

            if let Some(i) = matched {
                prune_beneath.insert(location.id);

                if i == location.line.len() - 1 {
                    prune.insert(location.id);
                } else {
                    location.line.drain(..=i);
                }
            }
        }

        for sample in &mut self.proto.sample {
            // Walk from the root towards the leaf; the stack below the first
            // pruned location goes, but never before a retained root frame.
            let mut found_user = false;
            for i in (0..sample.location_id.len()).rev() {
                let id = sample.location_id[i];
                if !prune.contains(&id) && !prune_beneath.contains(&id) {
                    found_user = true;
                    continue;
                }

                if !found_user {
                    continue;
                }

                if prune.contains(&id) {
                    sample.location_id.drain(..=i);
                } else {
                    sample.location_id.drain(..i);
                }

                break;
            }
        }
    }
}

fn validate(p: &proto::Profile) -> Result<()> {
    ensure!(!p.string_table.is_empty(), "profile has no string table");
    ensure!(
        p.string_table[0].is_empty(),
        "first string table entry must be empty",
    );
    ensure!(!p.sample_type.is_empty(), "profile has no sample types");

    let strings = p.string_table.len() as i64;
    let valid_string = |index: i64| index >= 0 && index < strings;

    for value_type in p.sample_type.iter().chain(p.period_type.iter()) {
        ensure!(
            valid_string(value_type.r#type) && valid_string(value_type.unit),
            "value type references an unknown string",
        );
    }

    let function_ids: HashSet<u64> = p.function.iter().map(|f| f.id).collect();
    for function in &p.function {
        ensure!(function.id != 0, "function has a zero id");
        ensure!(
            valid_string(function.name)
                && valid_string(function.system_name)
                && valid_string(function.filename),
            "function references an unknown string",
        );
    }

    let mapping_ids: HashSet<u64> = p.mapping.iter().map(|m| m.id).collect();
    for mapping in &p.mapping {
        ensure!(mapping.id != 0, "mapping has a zero id");
        ensure!(
            valid_string(mapping.filename) && valid_string(mapping.build_id),
            "mapping references an unknown string",
        );
    }

    let location_ids: HashSet<u64> = p.location.iter().map(|l| l.id).collect();
    for location in &p.location {
        ensure!(location.id != 0, "location has a zero id");
        ensure!(
            location.mapping_id == 0 || mapping_ids.contains(&location.mapping_id),
            "location {} references unknown mapping {}",
            location.id,
            location.mapping_id,
        );

        for line in &location.line {
            ensure!(
                line.function_id == 0 || function_ids.contains(&line.function_id),
                "location {} references unknown function {}",
                location.id,
                line.function_id,
            );
        }
    }

    for sample in &p.sample {
        ensure!(
            sample.value.len() == p.sample_type.len(),
            "sample has {} values, expected {}",
            sample.value.len(),
            p.sample_type.len(),
        );

        for location_id in &sample.location_id {
            ensure!(
                location_ids.contains(location_id),
                "sample references unknown location {location_id}",
            );
        }

        for label in &sample.label {
            ensure!(
                valid_string(label.key)
                    && valid_string(label.str)
                    && valid_string(label.num_unit),
                "label references an unknown string",
            );
        }
    }

    Ok(())
}

type LabelKey = (String, String, i64, String);

struct Merger {
    out: proto::Profile,
    strings: HashMap<String, i64>,
    functions: HashMap<(String, String, String, i64), u64>,
    mappings: HashMap<(String, String, u64, u64, u64), u64>,
    locations: HashMap<(u64, u64, Vec<(u64, i64, i64)>), u64>,
    samples: HashMap<(Vec<u64>, Vec<LabelKey>), usize>,
    comments: HashSet<String>,
}

impl Merger {
    fn new() -> Self {
        let mut merger = Self {
            out: proto::Profile::default(),
            strings: HashMap::new(),
            functions: HashMap::new(),
            mappings: HashMap::new(),
            locations: HashMap::new(),
            samples: HashMap::new(),
            comments: HashSet::new(),
        };

        merger.intern("");
        merger
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&index) = self.strings.get(s) {
            return index;
        }

        let index = self.out.string_table.len() as i64;
        self.out.string_table.push(s.to_string());
        self.strings.insert(s.to_string(), index);
        index
    }

    fn absorb(&mut self, profile: &Profile) {
        let p = &profile.proto;

        if self.out.sample_type.is_empty() {
            self.out.sample_type = p
                .sample_type
                .iter()
                .map(|vt| proto::ValueType {
                    r#type: self.intern(profile.str_of(vt.r#type)),
                    unit: self.intern(profile.str_of(vt.unit)),
                })
                .collect();
        }

        if self.out.period_type.is_none() {
            self.out.period_type = p.period_type.map(|vt| proto::ValueType {
                r#type: self.intern(profile.str_of(vt.r#type)),
                unit: self.intern(profile.str_of(vt.unit)),
            });
        }

        self.out.period = self.out.period.max(p.period);
        self.out.duration_nanos += p.duration_nanos;

        if p.time_nanos != 0 && (self.out.time_nanos == 0 || p.time_nanos < self.out.time_nanos) {
            self.out.time_nanos = p.time_nanos;
        }

        if self.out.drop_frames == 0 && p.drop_frames != 0 {
            self.out.drop_frames = self.intern(profile.str_of(p.drop_frames));
        }

        if self.out.keep_frames == 0 && p.keep_frames != 0 {
            self.out.keep_frames = self.intern(profile.str_of(p.keep_frames));
        }

        if self.out.default_sample_type == 0 && p.default_sample_type != 0 {
            self.out.default_sample_type =
                self.intern(profile.str_of(p.default_sample_type));
        }

        for &comment in &p.comment {
            let text = profile.str_of(comment).to_string();
            if self.comments.insert(text.clone()) {
                let index = self.intern(&text);
                self.out.comment.push(index);
            }
        }

        let mapping_ids = self.absorb_mappings(profile);
        let function_ids = self.absorb_functions(profile);
        let location_ids = self.absorb_locations(profile, &mapping_ids, &function_ids);

        for sample in &p.sample {
            let stack: Vec<u64> = sample
                .location_id
                .iter()
                .map(|id| location_ids.get(id).copied().unwrap_or(0))
                .collect();

            let mut labels: Vec<LabelKey> = sample
                .label
                .iter()
                .map(|label| {
                    (
                        profile.str_of(label.key).to_string(),
                        profile.str_of(label.str).to_string(),
                        label.num,
                        profile.str_of(label.num_unit).to_string(),
                    )
                })
                .collect();
            labels.sort();

            match self.samples.get(&(stack.clone(), labels.clone())) {
                Some(&index) => {
                    let existing = &mut self.out.sample[index];
                    for (slot, value) in existing.value.iter_mut().zip(&sample.value) {
                        *slot += value;
                    }
                }
                None => {
                    let label: Vec<proto::Label> = labels
                        .iter()
                        .map(|(key, str_value, num, num_unit)| proto::Label {
                            key: self.intern(key),
                            str: self.intern(str_value),
                            num: *num,
                            num_unit: self.intern(num_unit),
                        })
                        .collect();

                    self.samples
                        .insert((stack.clone(), labels), self.out.sample.len());
                    self.out.sample.push(proto::Sample {
                        location_id: stack,
                        value: sample.value.clone(),
                        label,
                    });
                }
            }
        }
    }

    fn absorb_mappings(&mut self, profile: &Profile) -> HashMap<u64, u64> {
        let mut ids = HashMap::new();

        for mapping in &profile.proto.mapping {
            let key = (
                profile.str_of(mapping.filename).to_string(),
                profile.str_of(mapping.build_id).to_string(),
                mapping.memory_start,
                mapping.memory_limit,
                mapping.file_offset,
            );

            let new_id = match self.mappings.get(&key) {
                Some(&id) => id,
                None => {
                    let id = self.out.mapping.len() as u64 + 1;
                    let mut merged = mapping.clone();
                    merged.id = id;
                    merged.filename = self.intern(&key.0);
                    merged.build_id = self.intern(&key.1);
                    self.out.mapping.push(merged);
                    self.mappings.insert(key, id);
                    id
                }
            };

            ids.insert(mapping.id, new_id);
        }

        ids
    }

    fn absorb_functions(&mut self, profile: &Profile) -> HashMap<u64, u64> {
        let mut ids = HashMap::new();

        for function in &profile.proto.function {
            let key = (
                profile.str_of(function.name).to_string(),
                profile.str_of(function.system_name).to_string(),
                profile.str_of(function.filename).to_string(),
                function.start_line,
            );

            let new_id = match self.functions.get(&key) {
                Some(&id) => id,
                None => {
                    let id = self.out.function.len() as u64 + 1;
                    let name = self.intern(&key.0);
                    let system_name = self.intern(&key.1);
                    let filename = self.intern(&key.2);
                    self.out.function.push(proto::Function {
                        id,
                        name,
                        system_name,
                        filename,
                        start_line: key.3,
                    });
                    self.functions.insert(key, id);
                    id
                }
            };

            ids.insert(function.id, new_id);
        }

        ids
    }

    fn absorb_locations(
        &mut self,
        profile: &Profile,
        mapping_ids: &HashMap<u64, u64>,
        function_ids: &HashMap<u64, u64>,
    ) -> HashMap<u64, u64> {
        let mut ids = HashMap::new();

        for location in &profile.proto.location {
            let mapping_id = mapping_ids.get(&location.mapping_id).copied().unwrap_or(0);
            let lines: Vec<(u64, i64, i64)> = location
                .line
                .iter()
                .map(|line| {
                    (
                        function_ids.get(&line.function_id).copied().unwrap_or(0),
                        line.line,
                        line.column,
                    )
                })
                .collect();

            let key = (mapping_id, location.address, lines.clone());

            let new_id = match self.locations.get(&key) {
                Some(&id) => id,
                None => {
                    let id = self.out.location.len() as u64 + 1;
                    self.out.location.push(proto::Location {
                        id,
                        mapping_id,
                        address: location.address,
                        line: lines
                            .into_iter()
                            .map(|(function_id, line, column)| proto::Line {
                                function_id,
                                line,
                                column,
                            })
                            .collect(),
                        is_folded: location.is_folded,
                    });
                    self.locations.insert(key, id);
                    id
                }
            };

            ids.insert(location.id, new_id);
        }

        ids
    }

    fn finish(self) -> proto::Profile {
        self.out
    }
}

/// Assembles small, valid CPU profiles. Used by the demo scrape target and
/// by tests; real profiles come from applications' pprof endpoints.
pub struct ProfileBuilder {
    profile: proto::Profile,
    strings: HashMap<String, i64>,
    functions: HashMap<String, u64>,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            profile: proto::Profile::default(),
            strings: HashMap::new(),
            functions: HashMap::new(),
        };

        builder.intern("");
        builder
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&index) = self.strings.get(s) {
            return index;
        }

        let index = self.profile.string_table.len() as i64;
        self.profile.string_table.push(s.to_string());
        self.strings.insert(s.to_string(), index);
        index
    }

    pub fn sample_type(mut self, kind: &str, unit: &str) -> Self {
        let value_type = proto::ValueType {
            r#type: self.intern(kind),
            unit: self.intern(unit),
        };

        self.profile.sample_type.push(value_type);
        self
    }

    pub fn period(mut self, kind: &str, unit: &str, period: i64) -> Self {
        self.profile.period_type = Some(proto::ValueType {
            r#type: self.intern(kind),
            unit: self.intern(unit),
        });
        self.profile.period = period;
        self
    }

    pub fn duration(mut self, duration: std::time::Duration) -> Self {
        self.profile.duration_nanos = duration.as_nanos() as i64;
        self
    }

    /// Record a sample for the given stack, leaf first. Each distinct frame
    /// name becomes one function with one location.
    pub fn sample(mut self, stack: &[&str], values: &[i64]) -> Self {
        let location_ids: Vec<u64> = stack
            .iter()
            .map(|frame| self.location_for(frame))
            .collect();

        self.profile.sample.push(proto::Sample {
            location_id: location_ids,
            value: values.to_vec(),
            label: Vec::new(),
        });

        self
    }

    fn location_for(&mut self, frame: &str) -> u64 {
        if let Some(&id) = self.functions.get(frame) {
            return id;
        }

        let name = self.intern(frame);
        let id = self.profile.function.len() as u64 + 1;

        self.profile.function.push(proto::Function {
            id,
            name,
            system_name: name,
            filename: 0,
            start_line: 0,
        });

        // One synthetic location per function, sharing the function's id.
        self.profile.location.push(proto::Location {
            id,
            mapping_id: 0,
            address: 0,
            line: vec![proto::Line {
                function_id: id,
                line: 0,
                column: 0,
            }],
            is_folded: false,
        });

        self.functions.insert(frame.to_string(), id);
        id
    }

    pub fn build(self) -> Profile {
        Profile {
            proto: self.profile,
        }
    }
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_profile() -> ProfileBuilder {
        ProfileBuilder::new()
            .sample_type("samples", "count")
            .sample_type("cpu", "nanoseconds")
            .period("cpu", "nanoseconds", 10_000_000)
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Profile::parse(b"not a profile").is_err());
        assert!(Profile::parse(b"").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_message() {
        // A zero-length protobuf decodes to a default message, which must
        // fail validation rather than pass as an empty profile.
        let empty = proto::Profile::default();
        let mut raw = Vec::new();
        empty.encode(&mut raw).expect("encode");
        assert!(Profile::parse(&raw).is_err());
    }

    #[test]
    fn test_round_trip() {
        let profile = cpu_profile()
            .sample(&["main.work", "main.main"], &[3, 30_000_000])
            .build();

        let encoded = profile.encode().expect("encode");
        assert!(encoded.starts_with(&GZIP_MAGIC));

        let decoded = Profile::parse(&encoded).expect("parse");
        assert_eq!(decoded.value_for("main.work", 0), 3);
        assert_eq!(decoded.value_for("main.work", 1), 30_000_000);
    }

    #[test]
    fn test_parse_accepts_uncompressed_input() {
        let profile = cpu_profile().sample(&["main.main"], &[1, 100]).build();

        let mut raw = Vec::new();
        profile.as_proto().encode(&mut raw).expect("encode");

        let decoded = Profile::parse(&raw).expect("parse");
        assert_eq!(decoded.value_for("main.main", 0), 1);
    }

    #[test]
    fn test_merge_sums_identical_stacks() {
        let base = cpu_profile()
            .sample(&["main.work", "main.main"], &[1, 100])
            .build();
        let upload = cpu_profile()
            .sample(&["main.work", "main.main"], &[2, 50])
            .build();

        let merged = Profile::merge(vec![base, upload]).expect("merge");
        assert_eq!(merged.as_proto().sample.len(), 1);
        assert_eq!(merged.value_for("main.work", 0), 3);
        assert_eq!(merged.value_for("main.work", 1), 150);
    }

    #[test]
    fn test_merge_unions_distinct_stacks() {
        let base = cpu_profile()
            .sample(&["main.alpha", "main.main"], &[1, 100])
            .build();
        let upload = cpu_profile()
            .sample(&["main.beta", "main.main"], &[2, 200])
            .build();

        let merged = Profile::merge(vec![base, upload]).expect("merge");
        assert_eq!(merged.as_proto().sample.len(), 2);
        assert_eq!(merged.value_for("main.alpha", 0), 1);
        assert_eq!(merged.value_for("main.beta", 0), 2);
        // main.main is interned once despite appearing in both inputs.
        let main_functions = merged
            .as_proto()
            .function
            .iter()
            .filter(|f| merged.str_of(f.name) == "main.main")
            .count();
        assert_eq!(main_functions, 1);
    }

    #[test]
    fn test_merge_single_profile_normalizes() {
        let profile = cpu_profile()
            .sample(&["main.work", "main.main"], &[5, 500])
            .sample(&["main.work", "main.main"], &[2, 200])
            .build();

        let merged = Profile::merge(vec![profile]).expect("merge");
        assert_eq!(merged.as_proto().sample.len(), 1);
        assert_eq!(merged.value_for("main.work", 0), 7);
    }

    #[test]
    fn test_merge_rejects_incompatible_sample_types() {
        let cpu = cpu_profile().sample(&["main.main"], &[1, 1]).build();
        let heap = ProfileBuilder::new()
            .sample_type("alloc_space", "bytes")
            .sample(&["main.main"], &[1])
            .build();

        assert!(Profile::merge(vec![cpu, heap]).is_err());
    }

    #[test]
    fn test_merge_sums_durations() {
        let first = cpu_profile()
            .duration(std::time::Duration::from_secs(30))
            .sample(&["main.main"], &[1, 1])
            .build();
        let second = cpu_profile()
            .duration(std::time::Duration::from_secs(30))
            .sample(&["main.main"], &[1, 1])
            .build();

        let merged = Profile::merge(vec![first, second]).expect("merge");
        assert_eq!(merged.as_proto().duration_nanos, 60_000_000_000);
    }

    #[test]
    fn test_prune_drops_matching_subtree() {
        let mut profile = cpu_profile()
            .sample(
                &["github.com/aws/aws-sdk-go.request", "main.fetch", "main.main"],
                &[4, 400],
            )
            .sample(&["main.compute", "main.main"], &[6, 600])
            .build();

        let drop = Regex::new(r"^github\.com/aws/.*").expect("regex");
        profile.prune(Some(&drop), None);

        let names = profile.sampled_function_names();
        assert!(!names.contains("github.com/aws/aws-sdk-go.request"));
        assert!(names.contains("main.fetch"));
        assert!(names.contains("main.compute"));

        // The pruned sample keeps its values, attributed to the retained
        // frames.
        assert_eq!(profile.value_for("main.fetch", 0), 4);
    }

    #[test]
    fn test_prune_keep_overrides_drop() {
        let mut profile = cpu_profile()
            .sample(&["vendor.keep_me", "main.main"], &[1, 10])
            .sample(&["vendor.drop_me", "main.main"], &[2, 20])
            .build();

        let drop = Regex::new(r"^vendor\..*").expect("regex");
        let keep = Regex::new(r"keep_me$").expect("regex");
        profile.prune(Some(&drop), Some(&keep));

        let names = profile.sampled_function_names();
        assert!(names.contains("vendor.keep_me"));
        assert!(!names.contains("vendor.drop_me"));
    }

    #[test]
    fn test_prune_without_drop_is_noop() {
        let mut profile = cpu_profile()
            .sample(&["main.work", "main.main"], &[1, 10])
            .build();

        let keep = Regex::new("anything").expect("regex");
        profile.prune(None, Some(&keep));
        assert_eq!(profile.as_proto().sample.len(), 1);
        assert_eq!(profile.as_proto().sample[0].location_id.len(), 2);
    }

    #[test]
    fn test_validate_rejects_dangling_references() {
        let mut bad = cpu_profile().sample(&["main.main"], &[1, 1]).build().proto;
        bad.sample[0].location_id.push(999);
        assert!(Profile::from_proto(bad).is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_value_arity() {
        let mut bad = cpu_profile().sample(&["main.main"], &[1, 1]).build().proto;
        bad.sample[0].value.pop();
        assert!(Profile::from_proto(bad).is_err());
    }
}
