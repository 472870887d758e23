// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use tracing::debug;

use crate::backend::kms::{StrategyMode, ThreadType};

pub const ENV_DEVICE: &str = "SWL_KMS_DEVICE";
pub const ENV_THREAD: &str = "SWL_KMS_THREAD";
pub const ENV_MODE: &str = "SWL_KMS_MODE";
pub const ENV_FRAMES: &str = "SWL_KMS_FRAMES";

const DEFAULT_FRAMES: u32 = 60;

/// Which DRM device to drive
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelection {
    /// Primary GPU by `boot_vga`, else the first card node
    #[default]
    Auto,
    /// In-memory device, no hardware needed
    Mock,
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsConfig {
    pub device: DeviceSelection,
    pub thread: ThreadType,
    pub mode: StrategyMode,
    /// Page flips performed by the driver binary
    pub frames: u32,
}

impl Default for KmsConfig {
    fn default() -> Self {
        KmsConfig {
            device: DeviceSelection::Auto,
            thread: ThreadType::Kernel,
            mode: StrategyMode::Auto,
            frames: DEFAULT_FRAMES,
        }
    }
}

impl KmsConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from `lookup`, which maps variable names to values
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = KmsConfig::default();

        if let Some(device) = non_empty(lookup(ENV_DEVICE)) {
            config.device = match device.as_str() {
                "mock" => DeviceSelection::Mock,
                "auto" => DeviceSelection::Auto,
                path => DeviceSelection::Path(PathBuf::from(path)),
            };
        }

        if let Some(thread) = non_empty(lookup(ENV_THREAD)) {
            config.thread = match thread.to_ascii_lowercase().as_str() {
                "kernel" => ThreadType::Kernel,
                "user" => ThreadType::User,
                other => bail!("Invalid {ENV_THREAD} value {other:?}, expected kernel or user"),
            };
        }

        if let Some(mode) = non_empty(lookup(ENV_MODE)) {
            config.mode = match mode.to_ascii_lowercase().as_str() {
                "auto" => StrategyMode::Auto,
                "atomic" => StrategyMode::Atomic,
                "simple" | "legacy" => StrategyMode::Simple,
                other => {
                    bail!("Invalid {ENV_MODE} value {other:?}, expected auto, atomic or simple")
                }
            };
        }

        if let Some(frames) = non_empty(lookup(ENV_FRAMES)) {
            config.frames = frames
                .parse()
                .with_context(|| format!("Invalid {ENV_FRAMES} value {frames:?}"))?;
        }

        debug!(?config, "Loaded KMS config");
        Ok(config)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
