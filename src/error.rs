//! Error types for the pktmask core.
//!
//! Mirrors the shape of the error hierarchies used elsewhere in the
//! pipeline-processing world: one narrow `thiserror` enum per subsystem,
//! funneled into a top-level [`PktMaskError`] via `#[from]`. Stage-level
//! failures never panic; they are returned as data and recorded on
//! [`crate::model::FileResult`].

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("unrecognized capture format in {0}")]
    UnrecognizedFormat(PathBuf),

    #[error("pcap error reading {path}: {source}")]
    Pcap {
        path: PathBuf,
        #[source]
        source: pcap_file::PcapError,
    },

    #[error("pcapng error reading {path}: {source}")]
    PcapNg {
        path: PathBuf,
        #[source]
        source: pcap_file::PcapError,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AnonymizeError {
    #[error("address family mismatch rewriting {0}")]
    FamilyMismatch(std::net::IpAddr),

    #[error("checksum recompute failed: {0}")]
    Checksum(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error("stream buffer exhausted for {0}")]
    BufferExhausted(String),

    #[error("tls desync on {0}: {1}")]
    TlsDesync(String, String),
}

#[derive(Debug, thiserror::Error)]
pub enum MaskerError {
    #[error("checksum recompute failed: {0}")]
    Checksum(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("dedup stage failed: {0}")]
    Dedup(String),

    #[error(transparent)]
    Anonymize(#[from] AnonymizeError),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error(transparent)]
    Masker(#[from] MaskerError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum PktMaskError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T, E = PktMaskError> = std::result::Result<T, E>;
