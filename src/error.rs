// ============================================
// RTA Builder - error.rs
// ============================================
// Error taxonomy for the image-build pipeline.
//
// Most of these never reach the caller directly. Strategies absorb their own
// failures and the controller moves on to the next tier; only an exhausted
// tier (or a deliberate stop) ends a build.
// ============================================

use std::path::Path;
use thiserror::Error;

/// Everything that can go wrong while building an image
#[derive(Error, Debug)]
pub enum BuildError {
    /// An external tool is not installed (triggers fallback)
    #[error("{tool} is not available on this host")]
    ToolUnavailable { tool: String },

    /// An external tool ran but exited non-zero (or could not be started)
    #[error("{tool} failed ({}): {detail}", exit_label(.code))]
    SubprocessFailure {
        tool: String,
        code: Option<i32>,
        detail: String,
    },

    /// The image could not be mounted, or no volume appeared for it
    #[error("failed to mount image: {reason}")]
    MountFailure { reason: String },

    /// The stop flag was observed
    #[error("stopped by user")]
    CancelledByUser,

    /// A filesystem operation failed
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid or unreadable configuration
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// Source image download failed
    #[error("download failed: {reason}")]
    Download { reason: String },
}

impl BuildError {
    /// Wrap an io::Error with a short description of what was being done
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    /// Convenience for path-centric io failures
    pub fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        BuildError::io(format!("{} {}", action, path.display()), source)
    }

    pub fn unavailable(tool: impl Into<String>) -> Self {
        BuildError::ToolUnavailable { tool: tool.into() }
    }

    /// True when this is a deliberate stop rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::CancelledByUser)
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_a_failure() {
        assert!(BuildError::CancelledByUser.is_cancelled());
        let err = BuildError::SubprocessFailure {
            tool: "oscdimg".to_string(),
            code: Some(137),
            detail: "killed".to_string(),
        };
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "oscdimg failed (exit code 137): killed");
    }

    #[test]
    fn test_io_context_in_message() {
        let err = BuildError::io_at(
            "Failed to create",
            Path::new("out"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "Failed to create out: denied");
    }
}
