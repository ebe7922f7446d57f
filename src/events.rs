//! Progress events produced by the core and consumed by optional CLI/GUI
//! collaborators (spec §6). The core never inspects what a callback does
//! with an event; a callback that panics or errors must not abort
//! processing (spec §4.1 failure semantics), so [`PipelineExecutor`]
//! invokes callbacks through [`emit`](Self::emit) rather than calling them
//! directly.

use std::path::PathBuf;
use uuid::Uuid;

use crate::model::{FileResult, StageStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PipelineStart { run_id: Uuid, root: PathBuf },
    FileStart { path: PathBuf },
    StepStart { stage_name: &'static str, path: PathBuf },
    StepEnd { stage_name: &'static str, stats: StageStats },
    FileEnd { result: FileResult },
    PipelineEnd { run_id: Uuid, files_ok: u64, files_failed: u64 },
    Error { severity: Severity, message: String, context: String },
}

/// Type-erased progress sink. Boxed so the executor and directory driver
/// can be handed a closure, a channel sender, or a no-op.
pub type ProgressCallback = Box<dyn Fn(PipelineEvent) + Send + Sync>;

/// Invoke `cb` with `event`, swallowing any panic the callback raises.
///
/// Spec §4.1: "Progress callback exceptions must not abort processing;
/// they are logged and swallowed." Rust has no catchable exceptions for
/// ordinary control flow, so a caller-supplied closure is expected to
/// return rather than panic; `catch_unwind` is the literal translation of
/// that guarantee for the rare closure that does panic.
pub fn emit(cb: &ProgressCallback, event: PipelineEvent) {
    let cb = std::panic::AssertUnwindSafe(|| cb(event));
    if let Err(payload) = std::panic::catch_unwind(cb) {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "progress callback panicked".to_string()
        };
        tracing::warn!("progress callback panicked: {}", message);
    }
}

/// A progress callback that logs every event through `tracing`, matching
/// the teacher's practice of logging flow lifecycle transitions at
/// `info`/`debug` granularity.
pub fn tracing_progress_callback() -> ProgressCallback {
    Box::new(|event| match event {
        PipelineEvent::PipelineStart { run_id, root } => {
            tracing::info!(%run_id, root = %root.display(), "Starting pipeline run");
        }
        PipelineEvent::FileStart { path } => {
            tracing::info!(path = %path.display(), "Processing file");
        }
        PipelineEvent::StepStart { stage_name, path } => {
            tracing::debug!(stage = stage_name, path = %path.display(), "Stage starting");
        }
        PipelineEvent::StepEnd { stage_name, stats } => {
            tracing::debug!(
                stage = stage_name,
                processed = stats.packets_processed,
                modified = stats.packets_modified,
                duration_ms = stats.duration_ms,
                "Stage finished"
            );
        }
        PipelineEvent::FileEnd { result } => {
            if result.ok {
                tracing::info!(path = %result.input.display(), "File finished");
            } else {
                tracing::warn!(path = %result.input.display(), errors = ?result.errors, "File failed");
            }
        }
        PipelineEvent::PipelineEnd { run_id, files_ok, files_failed } => {
            tracing::info!(%run_id, files_ok, files_failed, "Pipeline run finished");
        }
        PipelineEvent::Error { severity, message, context } => match severity {
            Severity::Warn => tracing::warn!(context = %context, "{}", message),
            Severity::Error => tracing::error!(context = %context, "{}", message),
        },
    })
}
