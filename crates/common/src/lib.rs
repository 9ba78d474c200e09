//! Common utilities for usbip-proxy
//!
//! This crate provides shared functionality for the proxy crates: error
//! handling, logging setup, and test utilities (a scripted USB/IP server and
//! a fragmenting non-blocking reader).

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
