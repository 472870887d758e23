// SPDX-License-Identifier: GPL-3.0-only

//! KMS/DRM display backend of the swl compositor.

pub mod backend;
pub mod config;

pub use crate::backend::kms::*;
pub use crate::config::{DeviceSelection, KmsConfig};
