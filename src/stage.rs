//! Closed enumeration of pipeline stages (spec §9 design note: the
//! source's string-keyed processor registry becomes a Rust enum
//! implementing one trait, dispatched via `enum_dispatch` rather than a
//! boxed trait object).

use std::path::Path;
use std::sync::{Arc, Mutex};

use enum_dispatch::enum_dispatch;

use crate::anonymize::{AnonymizeStage, IpMap};
use crate::config::PipelineConfig;
use crate::dedup::DedupStage;
use crate::error::StageError;
use crate::mask::MaskingStage;
use crate::model::StageStats;

#[enum_dispatch]
pub trait Stage {
    fn stage_name(&self) -> &'static str;
    fn run(&mut self, input: &Path, output: &Path) -> Result<StageStats, StageError>;
}

impl Stage for DedupStage {
    fn stage_name(&self) -> &'static str {
        self.name()
    }

    fn run(&mut self, input: &Path, output: &Path) -> Result<StageStats, StageError> {
        self.process_file(input, output)
    }
}

impl Stage for AnonymizeStage {
    fn stage_name(&self) -> &'static str {
        self.name()
    }

    fn run(&mut self, input: &Path, output: &Path) -> Result<StageStats, StageError> {
        self.process_file(input, output)
    }
}

impl Stage for MaskingStage {
    fn stage_name(&self) -> &'static str {
        self.name()
    }

    fn run(&mut self, input: &Path, output: &Path) -> Result<StageStats, StageError> {
        self.process_file(input, output)
    }
}

#[enum_dispatch(Stage)]
pub enum PipelineStage {
    Dedup(DedupStage),
    Anonymize(AnonymizeStage),
    Mask(MaskingStage),
}

/// Materialize the fixed `dedup, anonymize, mask` ordering from
/// `config`, skipping any stage whose `enabled` flag is `false` (spec
/// §4.1 step 1: "Materialize the ordered list of enabled stages").
/// `ip_map` is shared across every file in a directory run so pseudonyms
/// stay consistent (spec §4.3.1).
pub fn build_stages(config: &PipelineConfig, ip_map: Arc<Mutex<IpMap>>) -> Vec<PipelineStage> {
    let mut stages = Vec::new();
    if config.dedup.enabled {
        stages.push(PipelineStage::Dedup(DedupStage::new()));
    }
    if config.anonymize.enabled {
        stages.push(PipelineStage::Anonymize(AnonymizeStage::new(ip_map)));
    }
    if config.mask.enabled {
        stages.push(PipelineStage::Mask(MaskingStage::new(
            config.mask.tls.clone(),
            config.mask.masker.clone(),
        )));
    }
    stages
}

#[cfg(test)]
mod build_stages_tests {
    use super::*;

    #[test]
    fn disabled_stages_are_skipped() {
        let mut config = PipelineConfig::default();
        config.dedup.enabled = false;
        config.anonymize.enabled = false;
        config.mask.enabled = false;
        let stages = build_stages(&config, Arc::new(Mutex::new(IpMap::new())));
        assert!(stages.is_empty());
    }

    #[test]
    fn default_config_enables_dedup_and_anonymize_only() {
        let config = PipelineConfig::default();
        let stages = build_stages(&config, Arc::new(Mutex::new(IpMap::new())));
        assert_eq!(stages.len(), 2);
    }
}
