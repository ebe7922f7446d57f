//! Pipeline executor (spec §4.1): chains the enabled stages for one
//! input file through scoped temporary files, aggregating stats and
//! emitting progress events, stopping on the first stage error.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::error::StageError;
use crate::events::{emit, PipelineEvent, ProgressCallback};
use crate::model::FileResult;
use crate::stage::{PipelineStage, Stage};

/// Cooperative cancellation flag checked at every inter-stage boundary
/// (spec §5: "the executor must observe a cancellation token at each
/// inter-stage boundary and at each progress callback invocation").
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct PipelineExecutor {
    stages: Vec<PipelineStage>,
}

impl PipelineExecutor {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        PipelineExecutor { stages }
    }

    pub fn run(
        &mut self,
        input_path: &Path,
        output_path: &Path,
        progress_cb: &ProgressCallback,
        cancel: &CancellationToken,
    ) -> FileResult {
        let mut result = FileResult::new(input_path.to_path_buf());
        emit(
            progress_cb,
            PipelineEvent::FileStart {
                path: input_path.to_path_buf(),
            },
        );

        if self.stages.is_empty() {
            if let Err(source) = std::fs::copy(input_path, output_path) {
                result.errors.push(format!("io error copying disabled pipeline: {source}"));
                emit(
                    progress_cb,
                    PipelineEvent::FileEnd {
                        result: result.clone(),
                    },
                );
                return result;
            }
            result.ok = true;
            result.output = Some(output_path.to_path_buf());
            emit(
                progress_cb,
                PipelineEvent::FileEnd {
                    result: result.clone(),
                },
            );
            return result;
        }

        let stage_count = self.stages.len();
        let mut temps: Vec<NamedTempFile> = Vec::new();
        let mut current_in: PathBuf = input_path.to_path_buf();

        for (index, stage) in self.stages.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                result.errors.push("cancelled".to_string());
                drop(temps);
                emit(
                    progress_cb,
                    PipelineEvent::FileEnd {
                        result: result.clone(),
                    },
                );
                return result;
            }

            let is_last = index + 1 == stage_count;
            let current_out: PathBuf = if is_last {
                output_path.to_path_buf()
            } else {
                match NamedTempFile::new() {
                    Ok(tmp) => {
                        let path = tmp.path().to_path_buf();
                        temps.push(tmp);
                        path
                    }
                    Err(source) => {
                        result.errors.push(format!("io error allocating temp file: {source}"));
                        drop(temps);
                        emit(
                            progress_cb,
                            PipelineEvent::FileEnd {
                                result: result.clone(),
                            },
                        );
                        return result;
                    }
                }
            };

            let stage_name = stage.stage_name();
            emit(
                progress_cb,
                PipelineEvent::StepStart {
                    stage_name,
                    path: current_in.clone(),
                },
            );

            match stage.run(&current_in, &current_out) {
                Ok(stats) => {
                    emit(
                        progress_cb,
                        PipelineEvent::StepEnd {
                            stage_name,
                            stats: stats.clone(),
                        },
                    );
                    result.stages.push(stats);
                    current_in = current_out;
                }
                Err(err) => {
                    result.errors.push(stage_error_message(stage_name, &err));
                    drop(temps);
                    result.ok = false;
                    emit(
                        progress_cb,
                        PipelineEvent::FileEnd {
                            result: result.clone(),
                        },
                    );
                    return result;
                }
            }
        }

        result.ok = true;
        result.output = Some(output_path.to_path_buf());
        drop(temps);
        emit(
            progress_cb,
            PipelineEvent::FileEnd {
                result: result.clone(),
            },
        );
        result
    }
}

fn stage_error_message(stage_name: &str, err: &StageError) -> String {
    format!("{stage_name} stage failed: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupStage;

    #[test]
    fn cancellation_token_starts_uncancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn empty_stage_list_is_allowed() {
        let executor = PipelineExecutor::new(Vec::new());
        assert_eq!(executor.stages.len(), 0);
    }

    #[test]
    fn single_stage_pipeline_constructs() {
        let stages = vec![PipelineStage::Dedup(DedupStage::new())];
        let executor = PipelineExecutor::new(stages);
        assert_eq!(executor.stages.len(), 1);
    }
}
