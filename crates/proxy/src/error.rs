//! Error types for the proxy backends

use crate::urb::UrbHandle;
use protocol::{ProtocolError, UrbStatus};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`crate::UsbProxyBackend`] operations
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid USB/IP address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server rejected import of '{busid}' (status {status})")]
    ImportRejected { busid: String, status: u32 },

    #[error("Device detached")]
    Detached,

    #[error("Backend is not open")]
    NotOpen,

    #[error("Control request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown request handle {0}")]
    UnknownHandle(UrbHandle),

    #[error("Control request completed with status {0:?}")]
    TransferFailed(UrbStatus),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub(crate) fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        ProxyError::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}
