//! Tunables fixed at state construction.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Normal stack region, in value slots.
    pub stack_slots: usize,
    /// Extra slots past the normal region. Once a frame lands in here the
    /// stack counts as overflowed, but execution continues so an exception can
    /// be raised and unwound; running past the reserve too is fatal.
    pub reserve_slots: usize,
    /// Frame-count limit, hit by deep recursion before the slot stack fills.
    /// Exceeding twice this depth is fatal.
    pub max_recursion_depth: usize,
    /// Budget pushed automatically around the outermost call; zero disables
    /// the automatic budget.
    pub timeout_seconds: u64,
    /// Maximum live heap objects.
    pub heap_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            stack_slots: 4096,
            reserve_slots: 512,
            max_recursion_depth: 128,
            timeout_seconds: 0,
            heap_capacity: 16 * 1024,
        }
    }
}

impl StateConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
