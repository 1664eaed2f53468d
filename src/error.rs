/// Workflow-level error taxonomy: fatal conditions surface here, recoverable
/// ones are handled as diagnostics at the call site.
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::engine::EngineError;

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed project or configuration file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive failure: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Raised when an explicit export folder override points nowhere.
    /// Clearing the override lets the workflow resolve a folder itself.
    #[error("export folder {path} does not exist; clear export_dir_override to let the workflow choose one")]
    ExportDirUnavailable { path: PathBuf },

    /// More than two enabled cameras lack a depth map. Repair only covers
    /// up to two; beyond that the operator must disable cameras by hand.
    #[error("these photos have no depth map: [{}]; disable them and run the workflow again", .cameras.join(" "))]
    MissingDepthMaps { cameras: Vec<String> },

    /// A stage ran before its dependency produced the required product.
    #[error("{product} is not present yet; earlier stages must run first")]
    ProductMissing { product: &'static str },

    #[error("web converter exited with {status}: {stderr}")]
    WebConverter { status: ExitStatus, stderr: String },
}
