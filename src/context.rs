// ============================================
// RTA Builder - context.rs
// ============================================
// What every strategy gets handed when it runs, and what it hands back.
// ============================================

use std::time::Duration;

use crate::cancel::StopFlag;
use crate::config::BuilderConfig;
use crate::error::BuildError;
use crate::mount::MountManager;
use crate::progress::Reporter;

/// Knobs the strategies read while running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// Bulk loops report progress every N files
    pub progress_every: u64,
    /// Kill an external tool that prints nothing for this long
    pub tool_idle_timeout: Option<Duration>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            progress_every: 100,
            tool_idle_timeout: None,
        }
    }
}

impl From<&BuilderConfig> for RunSettings {
    fn from(config: &BuilderConfig) -> Self {
        Self {
            progress_every: config.progress_every.max(1),
            tool_idle_timeout: config.tool_idle_timeout(),
        }
    }
}

/// Shared state for one build, passed by reference into each strategy
pub struct StepContext<'a> {
    pub reporter: Reporter<'a>,
    pub stop: StopFlag,
    pub settings: RunSettings,
    pub mounts: MountManager,
}

/// Outcome of one strategy attempt. Strategies never touch the job; they
/// only say whether they worked and, if not, why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyResult {
    pub success: bool,
    pub detail: Option<String>,
}

impl StrategyResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

impl From<Result<(), BuildError>> for StrategyResult {
    fn from(result: Result<(), BuildError>) -> Self {
        match result {
            Ok(()) => StrategyResult::ok(),
            Err(e) => StrategyResult::failed(e.to_string()),
        }
    }
}
