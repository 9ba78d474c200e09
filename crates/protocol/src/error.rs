//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding or validating USB/IP wire data
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer too small for the structure being decoded
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The remote end speaks a different protocol version
    #[error("Protocol version mismatch: got {found:#06x}, expected {expected:#06x}")]
    VersionMismatch { found: u16, expected: u16 },

    /// Unknown operation code in a connection-setup message
    #[error("Unknown USB/IP operation code: {0:#06x}")]
    UnknownOpCode(u16),

    /// Unknown command code in a request/reply header
    #[error("Unknown USB/IP command: {0:#010x}")]
    UnknownCommand(u32),

    /// Direction field is neither IN nor OUT
    #[error("Invalid direction value: {0}")]
    InvalidDirection(u32),

    /// Bus id does not fit the fixed-size field
    #[error("Invalid bus id '{0}'")]
    InvalidBusId(String),

    /// A length read from the wire exceeds the destination buffer
    #[error("Length {length} exceeds destination capacity {capacity}")]
    LengthOutOfRange { length: usize, capacity: usize },

    /// Isochronous packet count read from the wire is not acceptable
    #[error("Too many isochronous packets: {count} (max: {max})")]
    TooManyIsoPackets { count: usize, max: usize },

    /// An isochronous packet descriptor points outside the transfer buffer
    #[error(
        "Isochronous packet {index} out of range: offset {offset}, length {length}, actual {actual_length}, buffer {buffer_len}"
    )]
    IsoDescriptorOutOfRange {
        index: usize,
        offset: u32,
        length: u32,
        actual_length: u32,
        buffer_len: usize,
    },

    /// I/O error while reading fixed-size fields
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::VersionMismatch {
            found: 0x0106,
            expected: 0x0111,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("version mismatch"));
        assert!(msg.contains("0x0106"));
        assert!(msg.contains("0x0111"));
    }

    #[test]
    fn test_iso_out_of_range_error() {
        let err = ProtocolError::IsoDescriptorOutOfRange {
            index: 2,
            offset: 900,
            length: 200,
            actual_length: 200,
            buffer_len: 1024,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("packet 2"));
        assert!(msg.contains("buffer 1024"));
    }
}
