use std::path::PathBuf;

use thiserror::Error;

/// Failure conditions of an extraction run.
///
/// Every variant carries the context needed to locate the failure: the
/// archive offset for read and parse errors, the device id and cluster
/// index for write conflicts, the output path for resource errors. Nothing
/// is recovered locally, the first error aborts the pipeline.
#[derive(Error, Debug)]
pub enum VmaError {
    #[error("I/O error at offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("format error at offset {offset}: {message}")]
    Format { offset: u64, message: String },

    #[error(
        "checksum mismatch in {region} at offset {offset}: stored {}, computed {}",
        hex::encode(.stored),
        hex::encode(.computed)
    )]
    Checksum {
        region: &'static str,
        offset: u64,
        stored: [u8; 16],
        computed: [u8; 16],
    },

    #[error("conflicting rewrite of cluster {cluster} on device {device} ({name})")]
    Conflict { device: u8, name: String, cluster: u32 },

    #[error("cannot prepare output file {path:?}: {source}")]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A writer thread died outside the normal error flow.
    #[error("write pool failure: {0}")]
    Pool(String),
}

pub type Result<T> = std::result::Result<T, VmaError>;

impl VmaError {
    pub(crate) fn format(offset: u64, message: impl Into<String>) -> Self {
        VmaError::Format {
            offset,
            message: message.into(),
        }
    }

    /// Exit code for CLI consumers: 2 checksum mismatch, 3 broken archive,
    /// 4 I/O failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmaError::Checksum { .. } => 2,
            VmaError::Format { .. } | VmaError::Conflict { .. } => 3,
            VmaError::Io { .. } | VmaError::Resource { .. } | VmaError::Pool(_) => 4,
        }
    }
}
