//! Errors raised by the image assembly pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::actions::disk::nbd::DeviceKind;

#[derive(Error, Debug)]
pub enum BuildError {
    /// The request was rejected before any resource was touched
    #[error("Invalid build configuration: {0}")]
    Config(String),

    /// A kernel facility or an external tool is missing
    #[error("Environment not ready: {0}")]
    Environment(String),

    #[error("No available {kind} device found after {attempts} scan(s)")]
    NoDeviceAvailable { kind: DeviceKind, attempts: u32 },

    #[error("Failed to attach '{image}' to {device}: {reason}")]
    AttachFailed {
        device: PathBuf,
        image: PathBuf,
        reason: String,
    },

    #[error("Failed to detach {device}: {reason}")]
    DetachFailed { device: PathBuf, reason: String },

    #[error("Failed to create disk image '{path}': {reason}")]
    ImageCreateFailed { path: PathBuf, reason: String },

    #[error("Failed to partition {device}: {reason}")]
    PartitionFailed { device: PathBuf, reason: String },

    #[error("Failed to format {device}: {reason}")]
    FormatFailed { device: PathBuf, reason: String },

    #[error("Failed to mount {device} on '{mount_point}': {reason}")]
    MountFailed {
        device: PathBuf,
        mount_point: PathBuf,
        reason: String,
    },

    #[error("Failed to unmount '{mount_point}': {reason}")]
    UnmountFailed { mount_point: PathBuf, reason: String },

    #[error("Could not find {what} in '{dir}'")]
    ArtifactNotFound { what: String, dir: PathBuf },

    /// The image was not published. The tmp image (and possibly an attached
    /// device) is left behind for inspection.
    #[error("Failed to finalize '{tmp}' -> '{out}': {reason}")]
    FinalizeFailed {
        tmp: PathBuf,
        out: PathBuf,
        reason: String,
    },

    #[error("{tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Teardown was requested on a handle that holds no resource
    #[error("{resource} is not active")]
    NotActive { resource: String },

    #[error("Build cancelled before {stage}")]
    Cancelled { stage: String },

    /// A stage failed and releasing the resources acquired so far failed too
    #[error("{primary} (cleanup also failed: {})", format_cleanup(cleanup))]
    Cleanup {
        primary: Box<BuildError>,
        cleanup: Vec<BuildError>,
    },
}

impl BuildError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    /// Attach cleanup failures to a primary error. Returns the primary error
    /// unchanged when cleanup succeeded.
    pub fn with_cleanup(self, cleanup: Vec<BuildError>) -> Self {
        if cleanup.is_empty() {
            return self;
        }
        BuildError::Cleanup {
            primary: Box::new(self),
            cleanup,
        }
    }

    /// The error that caused the build to stop, looking through cleanup
    /// wrappers.
    pub fn primary(&self) -> &BuildError {
        match self {
            BuildError::Cleanup { primary, .. } => primary.primary(),
            other => other,
        }
    }
}

fn format_cleanup(errors: &[BuildError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
