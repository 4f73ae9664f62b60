//! Error types for ifmgrd

use std::io;
use thiserror::Error;

/// Interface manager errors
#[derive(Error, Debug)]
pub enum IfmgrError {
    /// A lookup matched no live device
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Duplicate device class, unknown kind or missing constructor argument
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An update targeted a device that has already been removed
    #[error("Device with ifindex {0} was deleted")]
    StaleReference(u32),

    /// Netlink socket error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// A requested device never showed up in the kernel
    #[error("Device creation failed: {0}")]
    CreationFailed(String),

    /// Failed to spawn an external command
    #[error("Failed to execute command '{command}': {source}")]
    CommandSpawn {
        /// The command line that failed to start
        command: String,
        /// The underlying IO error
        #[source]
        source: io::Error,
    },

    /// External command returned a non-zero exit code
    #[error("Command failed: '{command}' (exit code {exit_code}): {output}")]
    Command {
        /// The command line
        command: String,
        /// The exit code
        exit_code: i32,
        /// Combined stdout/stderr output
        output: String,
    },

    /// Event serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl IfmgrError {
    /// Creates a not found error for an interface index.
    pub fn ifindex_not_found(ifindex: u32) -> Self {
        Self::NotFound(format!("ifindex {}", ifindex))
    }

    /// Returns true for an expected "nothing matched" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IfmgrError::NotFound(_))
    }

    /// Returns true if the error reports an update against a removed device.
    pub fn is_stale(&self) -> bool {
        matches!(self, IfmgrError::StaleReference(_))
    }
}

/// Result type for ifmgrd operations
pub type Result<T> = std::result::Result<T, IfmgrError>;
