// Central error handling for the renderer

use std::path::PathBuf;

// Fatal error taxonomy. Per-ray numerical failures are deliberately absent:
// they set pixel flags and never abort a run.
#[derive(thiserror::Error, Debug)]
pub enum BlacklightError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Checkpoint error in {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {0}")]
    Output(String),
}

impl BlacklightError {
    pub fn config<T: ToString>(msg: T) -> Self {
        BlacklightError::Config(msg.to_string())
    }

    pub fn geometry<T: ToString>(msg: T) -> Self {
        BlacklightError::Geometry(msg.to_string())
    }

    pub fn checkpoint<T: ToString>(path: &std::path::Path, reason: T) -> Self {
        BlacklightError::Checkpoint {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

// Result type alias for renderer operations
pub type Result<T> = std::result::Result<T, BlacklightError>;
