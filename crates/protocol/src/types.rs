//! USB and protocol type definitions
//!
//! Transfer kinds, directions, completion status and the control setup
//! packet shared by the wire format and the proxy engine.

use crate::error::{ProtocolError, Result};

/// Transfer direction as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Wire value (`USBIP_DIR_OUT` = 0, `USBIP_DIR_IN` = 1)
    pub fn to_wire(self) -> u32 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }

    /// Parse the wire value
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }
}

/// USB transfer kinds understood by the virtual controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Control transfer; the data buffer starts with the 8-byte setup packet
    Control,
    /// Isochronous transfer with per-packet descriptors
    Isochronous,
    /// Bulk transfer
    Bulk,
    /// Interrupt transfer
    Interrupt,
    /// Control message; like `Control`, setup packet at the start of the buffer
    Msg,
}

impl TransferKind {
    /// Whether the data buffer begins with a setup packet
    pub fn has_setup(self) -> bool {
        matches!(self, TransferKind::Control | TransferKind::Msg)
    }
}

/// Completion status of a request, as reported to the virtual controller
///
/// Small closed set; the transport's errno values are folded into it by
/// [`UrbStatus::from_errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrbStatus {
    /// Transfer completed
    Ok,
    /// Endpoint stalled
    Stall,
    /// Device did not respond (also used for forced completions)
    #[default]
    NotResponding,
    /// CRC / bit-stuffing / protocol-level data corruption
    Crc,
    /// Less data than expected (short packet on a short-not-ok transfer)
    DataUnderrun,
    /// More data than the buffer could take
    DataOverrun,
    /// Request was unlinked before completing
    Cancelled,
}

/// Linux errno values used by the USB/IP stub in completion status fields
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENODEV: i32 = 19;
    pub const EPIPE: i32 = 32;
    pub const ETIME: i32 = 62;
    pub const EPROTO: i32 = 71;
    pub const EOVERFLOW: i32 = 75;
    pub const EILSEQ: i32 = 84;
    pub const ECONNRESET: i32 = 104;
    pub const ESHUTDOWN: i32 = 108;
    pub const EREMOTEIO: i32 = 121;
}

impl UrbStatus {
    /// Map a (negative) Linux errno status from the wire
    pub fn from_errno(status: i32) -> Self {
        match status.checked_neg().unwrap_or(i32::MAX) {
            0 => UrbStatus::Ok,
            errno::EPIPE => UrbStatus::Stall,
            errno::EILSEQ | errno::EPROTO => UrbStatus::Crc,
            errno::EREMOTEIO => UrbStatus::DataUnderrun,
            errno::EOVERFLOW => UrbStatus::DataOverrun,
            errno::ECONNRESET | errno::ENOENT => UrbStatus::Cancelled,
            _ => UrbStatus::NotResponding,
        }
    }

    /// Inverse of [`UrbStatus::from_errno`] for the canonical errno of each status
    pub fn to_errno(self) -> i32 {
        match self {
            UrbStatus::Ok => 0,
            UrbStatus::Stall => -errno::EPIPE,
            UrbStatus::NotResponding => -errno::ENODEV,
            UrbStatus::Crc => -errno::EILSEQ,
            UrbStatus::DataUnderrun => -errno::EREMOTEIO,
            UrbStatus::DataOverrun => -errno::EOVERFLOW,
            UrbStatus::Cancelled => -errno::ECONNRESET,
        }
    }
}

/// USB device speed as reported in the exported-device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// Wireless USB
    Wireless,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl DeviceSpeed {
    /// Map the kernel's `enum usb_device_speed`
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => DeviceSpeed::Low,
            2 => DeviceSpeed::Full,
            3 => DeviceSpeed::High,
            4 => DeviceSpeed::Wireless,
            5 => DeviceSpeed::Super,
            6 => DeviceSpeed::SuperPlus,
            _ => DeviceSpeed::Unknown,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            DeviceSpeed::Unknown => 0,
            DeviceSpeed::Low => 1,
            DeviceSpeed::Full => 2,
            DeviceSpeed::High => 3,
            DeviceSpeed::Wireless => 4,
            DeviceSpeed::Super => 5,
            DeviceSpeed::SuperPlus => 6,
        }
    }
}

/// Standard USB request codes used by the synchronous control operations
pub mod request {
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const SET_INTERFACE: u8 = 0x0b;

    /// Feature selector for CLEAR_FEATURE on an endpoint
    pub const ENDPOINT_HALT: u16 = 0x00;
    /// Hub port feature intercepted by the USB/IP stub to reset the device
    pub const PORT_RESET: u16 = 0x04;
}

/// 8-byte USB control setup packet
///
/// Multi-byte fields are little-endian (USB byte order); the packet is
/// embedded verbatim in USB/IP submit requests and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Direction of the data stage, from bit 7 of bmRequestType
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}
