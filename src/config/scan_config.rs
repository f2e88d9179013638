use serde::{Deserialize, Serialize};

use crate::core::bluetooth::ScanMode;

/// Scan settings configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Radio duty cycle requested when scanning starts
    pub mode: ScanMode,
}
