//! Directory driver: a thin collaborator around the core pipeline (spec
//! §1 excludes "directory iteration" from the core proper, but the crate
//! must still be runnable end-to-end). Walks an input directory for
//! capture files, builds one directory-scoped [`IpMap`], and runs the
//! configured [`PipelineExecutor`] over every file.
//!
//! Per spec §5 ("optional parallel across files within a directory"),
//! files are processed on a `rayon` thread pool sized by `--jobs`,
//! grounded in `abitofhelp-adaptive_pipeline`'s `RayonPoolManager`
//! pattern (`infrastructure::config::rayon_config`) of building one
//! dedicated pool rather than using the global rayon pool directly. The
//! directory-scoped [`IpMap`] is the one piece of state every file's
//! anonymization stage mutates, so it is wrapped in `Arc<Mutex<_>>` and
//! shared across every spawned task (spec §5: "its mutation must be
//! serialized under a mutex").

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use tracing::warn;
use uuid::Uuid;

use crate::anonymize::IpMap;
use crate::config::PipelineConfig;
use crate::events::{emit, PipelineEvent, ProgressCallback};
use crate::executor::{CancellationToken, PipelineExecutor};
use crate::model::{DirectoryAggregate, FileResult};
use crate::stage::build_stages;

const CAPTURE_EXTENSIONS: &[&str] = &["pcap", "pcapng", "cap"];

/// Whether `path`'s extension names one of the capture formats this
/// crate reads (spec §6: PCAP and PCAPNG).
pub fn is_capture_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            CAPTURE_EXTENSIONS
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Every capture file found anywhere under `root`, recursively.
pub fn collect_capture_files(root: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_capture_file(path))
        .collect()
}

/// Mirror `input`'s position relative to `root` under `output_root`, so
/// a directory run reproduces the input tree's layout at the output.
fn output_path_for(root: &Path, input: &Path, output_root: &Path) -> PathBuf {
    match input.strip_prefix(root) {
        Ok(relative) => output_root.join(relative),
        Err(_) => output_root.join(input.file_name().unwrap_or_default()),
    }
}

/// Drives the pipeline over every capture file under a directory.
pub struct DirectoryDriver {
    config: PipelineConfig,
    jobs: usize,
}

impl DirectoryDriver {
    pub fn new(config: PipelineConfig, jobs: usize) -> Self {
        DirectoryDriver {
            config,
            jobs: jobs.max(1),
        }
    }

    pub fn run(
        &self,
        input_root: &Path,
        output_root: &Path,
        progress_cb: &ProgressCallback,
        cancel: &CancellationToken,
    ) -> DirectoryAggregate {
        let run_id = Uuid::new_v4();
        emit(
            progress_cb,
            PipelineEvent::PipelineStart {
                run_id,
                root: input_root.to_path_buf(),
            },
        );

        let files = collect_capture_files(input_root);
        let ip_map = Arc::new(Mutex::new(IpMap::new()));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .thread_name(|index| format!("pktmask-worker-{index}"))
            .build()
            .unwrap_or_else(|e| {
                warn!("failed to build {}-thread worker pool ({e}), falling back to one thread", self.jobs);
                rayon::ThreadPoolBuilder::new()
                    .num_threads(1)
                    .build()
                    .expect("single-threaded rayon pool always builds")
            });

        let results: Vec<FileResult> = pool.install(|| {
            files
                .par_iter()
                .map(|input| self.run_one(input_root, input, output_root, &ip_map, progress_cb, cancel))
                .collect()
        });

        let files_ok = results.iter().filter(|r| r.ok).count() as u64;
        let files_failed = results.len() as u64 - files_ok;

        emit(
            progress_cb,
            PipelineEvent::PipelineEnd {
                run_id,
                files_ok,
                files_failed,
            },
        );

        DirectoryAggregate {
            files_total: results.len() as u64,
            files_ok,
            files_failed,
            results,
        }
    }

    fn run_one(
        &self,
        input_root: &Path,
        input: &Path,
        output_root: &Path,
        ip_map: &Arc<Mutex<IpMap>>,
        progress_cb: &ProgressCallback,
        cancel: &CancellationToken,
    ) -> FileResult {
        let output = output_path_for(input_root, input, output_root);
        if let Some(parent) = output.parent() {
            if let Err(source) = std::fs::create_dir_all(parent) {
                let mut result = FileResult::new(input.to_path_buf());
                result
                    .errors
                    .push(format!("io error creating output directory: {source}"));
                emit(
                    progress_cb,
                    PipelineEvent::FileEnd {
                        result: result.clone(),
                    },
                );
                return result;
            }
        }

        let stages = build_stages(&self.config, Arc::clone(ip_map));
        let mut executor = PipelineExecutor::new(stages);
        executor.run(input, &output, progress_cb, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_capture_extensions_case_insensitively() {
        assert!(is_capture_file(Path::new("trace.pcap")));
        assert!(is_capture_file(Path::new("trace.PCAPNG")));
        assert!(is_capture_file(Path::new("trace.cap")));
        assert!(!is_capture_file(Path::new("trace.txt")));
        assert!(!is_capture_file(Path::new("trace")));
    }

    #[test]
    fn output_path_mirrors_input_relative_layout() {
        let root = Path::new("/in");
        let input = Path::new("/in/sub/trace.pcap");
        let output_root = Path::new("/out");
        assert_eq!(
            output_path_for(root, input, output_root),
            Path::new("/out/sub/trace.pcap")
        );
    }
}
