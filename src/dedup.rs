//! Exact-duplicate removal (spec §4.2): drops any packet whose bytes have
//! already been seen earlier in the same file, preserving the order of
//! first occurrences.
//!
//! Grounded in the teacher's content-addressed caching pattern (hashing a
//! byte buffer into a fixed-width digest used as a set/map key) but
//! applied to whole packets rather than HTTP bodies; `sha2::Sha256` is
//! the teacher pack's hashing crate of choice (shared with
//! `abitofhelp-adaptive_pipeline`'s content-integrity checks).

use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::capture::{CaptureReader, CaptureWriter};
use crate::error::StageError;
use crate::model::{LinkType, StageStats};

pub struct DedupStage;

impl DedupStage {
    pub fn new() -> Self {
        DedupStage
    }

    pub fn name(&self) -> &'static str {
        "dedup"
    }

    pub fn process_file(&mut self, input: &Path, output: &Path) -> Result<StageStats, StageError> {
        let start = Instant::now();
        let mut reader = CaptureReader::open(input)?;
        let format = reader.format();
        let global_link_type = reader.global_link_type().unwrap_or(LinkType::ETHERNET);
        let mut writer = CaptureWriter::create(format, global_link_type)?;

        let mut seen: HashSet<[u8; 32]> = HashSet::new();
        let mut processed = 0u64;
        let mut unique = 0u64;

        while let Some(record) = reader.next_packet() {
            let record = record?;
            processed += 1;

            let digest: [u8; 32] = Sha256::digest(&record.data).into();
            if seen.insert(digest) {
                unique += 1;
                writer.write_packet(&record)?;
            }
        }

        writer.persist(output)?;

        let removed = processed - unique;
        let stats = StageStats::new(self.name())
            .with_extra("unique_packets", unique)
            .with_extra("removed_count", removed);

        Ok(StageStats {
            packets_processed: processed,
            packets_modified: removed,
            duration_ms: start.elapsed().as_millis() as u64,
            ..stats
        })
    }
}

impl Default for DedupStage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_for_identical_bytes() {
        let a = Sha256::digest(b"packet-bytes");
        let b = Sha256::digest(b"packet-bytes");
        assert_eq!(a, b);
    }

    #[test]
    fn digest_differs_for_different_bytes() {
        let a = Sha256::digest(b"packet-one");
        let b = Sha256::digest(b"packet-two");
        assert_ne!(a, b);
    }
}
