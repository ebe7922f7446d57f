//! Configuration surface consumed by the core (spec §6).
//!
//! Mirrors the teacher's [`Config`] (serde + serde_yaml, loaded with
//! [`PipelineConfig::load_from_file`]) and its `#[serde(default = "...")]`
//! idiom for optional fields with non-trivial defaults.

use byte_unit::{Byte, Unit};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnonymizeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AnonymizeConfig {
    fn default() -> Self {
        AnonymizeConfig { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsMaskConfig {
    #[serde(default = "default_true")]
    pub preserve_handshake: bool,
    #[serde(default)]
    pub preserve_application_data: bool,
    #[serde(default = "default_true")]
    pub preserve_alert: bool,
    #[serde(default = "default_true")]
    pub preserve_change_cipher_spec: bool,
    #[serde(default = "default_true")]
    pub preserve_heartbeat: bool,
}

impl Default for TlsMaskConfig {
    fn default() -> Self {
        TlsMaskConfig {
            preserve_handshake: true,
            preserve_application_data: false,
            preserve_alert: true,
            preserve_change_cipher_spec: true,
            preserve_heartbeat: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaskerConfig {
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
    #[serde(default = "default_max_out_of_order_bytes")]
    pub max_out_of_order_bytes: Byte,
}

impl Default for MaskerConfig {
    fn default() -> Self {
        MaskerConfig {
            verify_checksums: true,
            max_out_of_order_bytes: default_max_out_of_order_bytes(),
        }
    }
}

impl MaskerConfig {
    pub fn max_out_of_order_bytes_u32(&self) -> u32 {
        self.max_out_of_order_bytes.as_u64().min(u32::MAX as u64) as u32
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaskConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tls: TlsMaskConfig,
    #[serde(default)]
    pub masker: MaskerConfig,
}

impl Default for MaskConfig {
    fn default() -> Self {
        MaskConfig {
            enabled: false,
            tls: TlsMaskConfig::default(),
            masker: MaskerConfig::default(),
        }
    }
}

/// The in-memory configuration the library consumes, built either from a
/// loaded YAML file or from parsed CLI flags (flags take precedence over
/// a loaded file), same split as the teacher's `Config` + `Args`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub anonymize: AnonymizeConfig,
    #[serde(default)]
    pub mask: MaskConfig,
}

fn default_true() -> bool {
    true
}

fn default_max_out_of_order_bytes() -> Byte {
    Byte::from_u64_with_unit(16, Unit::MiB).unwrap()
}

impl PipelineConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<PipelineConfig> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_yaml::from_reader(reader)?)
    }
}
