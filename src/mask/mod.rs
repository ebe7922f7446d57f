//! TLS-aware payload masking (spec §4.4–4.6): a marker that reassembles
//! TCP streams and emits keep-ranges, and a masker that applies them.
//!
//! The source keeps the marker's output as an on-disk JSON file read
//! back by the masker; here `KeepRuleSet` is passed as an in-memory
//! value between the two passes (spec §9 design note), since both
//! halves run within the same `MaskingStage::process_file` call.

pub mod marker;
pub mod masker;
pub mod tcp_stream;

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use crate::config::{MaskerConfig, TlsMaskConfig};
use crate::error::StageError;
use crate::model::StageStats;

pub use tcp_stream::{Direction, StreamKey};

/// One contiguous span of a TCP direction's sequence space that must be
/// preserved byte-exact (spec §3 `KeepRule`).
#[derive(Debug, Clone, Copy)]
pub struct KeepRule {
    pub stream_key: StreamKey,
    pub direction: Direction,
    pub seq_start: u32,
    pub seq_end_exclusive: u32,
}

impl KeepRule {
    /// Whether sequence number `seq` falls inside this rule's range,
    /// wrap-aware (the range is `[seq_start, seq_end_exclusive)` modulo
    /// 2^32).
    pub fn contains(&self, seq: u32) -> bool {
        let len = self.seq_end_exclusive.wrapping_sub(self.seq_start);
        seq.wrapping_sub(self.seq_start) < len
    }
}

// reason_tag lives on the owning marker module's KeepRule construction
// site; stored here as a plain field for stats/debugging purposes.
#[derive(Debug, Clone)]
pub struct AnnotatedKeepRule {
    pub rule: KeepRule,
    pub reason_tag: String,
}

/// Per-file, per-`(stream_key, direction)` partition of disjoint,
/// sorted keep-ranges (spec §3 `KeepRuleSet`).
#[derive(Debug, Clone, Default)]
pub struct KeepRuleSet {
    partitions: HashMap<(StreamKey, Direction), Vec<AnnotatedKeepRule>>,
}

impl KeepRuleSet {
    pub fn new() -> Self {
        KeepRuleSet::default()
    }

    pub fn push(&mut self, rule: KeepRuleInput) {
        self.partitions
            .entry((rule.stream_key, rule.direction))
            .or_default()
            .push(AnnotatedKeepRule {
                rule: KeepRule {
                    stream_key: rule.stream_key,
                    direction: rule.direction,
                    seq_start: rule.seq_start,
                    seq_end_exclusive: rule.seq_end_exclusive,
                },
                reason_tag: rule.reason_tag,
            });
    }

    /// Merge overlapping/adjacent ranges within each partition. Relies
    /// on ranges within a partition having been pushed in non-decreasing
    /// sequence order, which holds because the marker emits them as it
    /// reassembles each direction strictly in delivery order.
    pub fn normalize(&mut self) {
        for rules in self.partitions.values_mut() {
            let mut merged: Vec<AnnotatedKeepRule> = Vec::with_capacity(rules.len());
            for rule in rules.drain(..) {
                if let Some(last) = merged.last_mut() {
                    if tcp_stream::seq_le(rule.rule.seq_start, last.rule.seq_end_exclusive) {
                        if tcp_stream::seq_lt(last.rule.seq_end_exclusive, rule.rule.seq_end_exclusive)
                        {
                            last.rule.seq_end_exclusive = rule.rule.seq_end_exclusive;
                        }
                        continue;
                    }
                }
                merged.push(rule);
            }
            *rules = merged;
        }
    }

    pub fn rules_for(&self, key: &StreamKey, direction: Direction) -> Option<&[AnnotatedKeepRule]> {
        self.partitions.get(&(*key, direction)).map(|v| v.as_slice())
    }

    pub fn rule_count(&self) -> u64 {
        self.partitions.values().map(|v| v.len() as u64).sum()
    }

    pub fn keep_bytes(&self) -> u64 {
        self.partitions
            .values()
            .flat_map(|v| v.iter())
            .map(|r| r.rule.seq_end_exclusive.wrapping_sub(r.rule.seq_start) as u64)
            .sum()
    }

    pub fn stream_count(&self) -> u64 {
        let streams: std::collections::HashSet<StreamKey> =
            self.partitions.keys().map(|(k, _)| *k).collect();
        streams.len() as u64
    }
}

/// Input to [`KeepRuleSet::push`]; kept as a plain struct (rather than
/// threading `reason_tag` through [`KeepRule`] itself) so the masker's
/// hot-path containment check stays a small `Copy` type.
pub struct KeepRuleInput {
    pub stream_key: StreamKey,
    pub direction: Direction,
    pub seq_start: u32,
    pub seq_end_exclusive: u32,
    pub reason_tag: String,
}

/// Orchestrates the marker and masker over the same input file (spec
/// §4.4).
pub struct MaskingStage {
    tls: TlsMaskConfig,
    masker: MaskerConfig,
}

impl MaskingStage {
    pub fn new(tls: TlsMaskConfig, masker: MaskerConfig) -> Self {
        MaskingStage { tls, masker }
    }

    pub fn name(&self) -> &'static str {
        "mask"
    }

    pub fn process_file(&mut self, input: &Path, output: &Path) -> Result<StageStats, StageError> {
        let start = Instant::now();

        let mut marker = marker::TlsMarker::new(
            self.tls.clone(),
            self.masker.max_out_of_order_bytes_u32() as usize,
        );
        let (rule_set, marker_stats) =
            <marker::TlsMarker as marker::Marker>::mark_file(&mut marker, input)?;

        let mut masker = masker::PayloadMasker::new(rule_set);
        let masker_stats = masker.mask_file(input, output)?;

        let combined = StageStats::new(self.name())
            .with_extra("rules_generated", masker_stats.rule_count)
            .with_extra("keep_bytes", masker_stats.keep_bytes)
            .with_extra("masked_bytes", masker_stats.masked_bytes)
            .with_extra("streams_seen", masker_stats.stream_count)
            .with_extra("marker_stats", serde_json::to_value(&marker_stats.extras).unwrap_or_default());

        Ok(StageStats {
            packets_processed: masker_stats.packets_processed,
            packets_modified: masker_stats.packets_modified,
            duration_ms: start.elapsed().as_millis() as u64,
            ..combined
        })
    }
}
