//! Protocol version management

use crate::error::{ProtocolError, Result};

/// USB/IP protocol version carried by every connection-setup message (1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

/// Check that a version tag read from the wire matches ours exactly
pub fn validate_version(found: u16) -> Result<()> {
    if found != USBIP_VERSION {
        return Err(ProtocolError::VersionMismatch {
            found,
            expected: USBIP_VERSION,
        });
    }
    Ok(())
}
