//! Core data model shared by every stage: [`PacketRecord`], [`StageStats`],
//! [`FileResult`]. These round-trip losslessly through the capture reader
//! and writer in [`crate::capture`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Link-layer type of a packet, carried through from the capture file's
/// interface description (PCAPNG) or global header (legacy PCAP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkType(pub u32);

impl LinkType {
    pub const ETHERNET: LinkType = LinkType(1);
}

/// One packet as read from (or about to be written to) a capture file.
///
/// Opaque byte sequence with a known link-layer type; stages parse it on
/// demand into layer views and edit it in place. No state is shared
/// between packets within a stage.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub timestamp: Duration,
    pub captured_len: u32,
    pub original_len: u32,
    pub link_type: LinkType,
    pub data: Vec<u8>,
}

impl PacketRecord {
    pub fn new(timestamp: Duration, original_len: u32, link_type: LinkType, data: Vec<u8>) -> Self {
        PacketRecord {
            timestamp,
            captured_len: data.len() as u32,
            original_len,
            link_type,
            data,
        }
    }
}

/// Statistics produced once per stage per file.
#[derive(Debug, Clone)]
pub struct StageStats {
    pub stage_name: &'static str,
    pub packets_processed: u64,
    pub packets_modified: u64,
    pub duration_ms: u64,
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl StageStats {
    pub fn new(stage_name: &'static str) -> Self {
        StageStats {
            stage_name,
            packets_processed: 0,
            packets_modified: 0,
            duration_ms: 0,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extras.insert(key.to_string(), value.into());
        self
    }
}

/// Outcome of running the pipeline over a single file.
#[derive(Debug, Clone)]
pub struct FileResult {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub ok: bool,
    pub stages: Vec<StageStats>,
    pub errors: Vec<String>,
}

impl FileResult {
    pub fn new(input: PathBuf) -> Self {
        FileResult {
            input,
            output: None,
            ok: false,
            stages: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Aggregate across every file processed in a directory run.
#[derive(Debug, Clone, Default)]
pub struct DirectoryAggregate {
    pub files_total: u64,
    pub files_ok: u64,
    pub files_failed: u64,
    pub results: Vec<FileResult>,
}
