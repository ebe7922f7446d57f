//! Core library for `pktmask`: a three-stage file-to-file pipeline that
//! deduplicates, anonymizes, and TLS-aware masks packet captures.
//!
//! The CLI (`src/main.rs`) and directory driver (`src/directory.rs`) are
//! thin collaborators around this library; everything in [`executor`],
//! [`dedup`], [`anonymize`], and [`mask`] is independently testable and
//! has no knowledge of how it is invoked.

pub mod anonymize;
pub mod capture;
pub mod config;
pub mod dedup;
pub mod directory;
pub mod error;
pub mod events;
pub mod executor;
pub mod mask;
pub mod model;
pub mod net;
pub mod stage;
