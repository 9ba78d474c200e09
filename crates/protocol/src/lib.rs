//! USB/IP wire protocol
//!
//! This crate defines the binary messages exchanged with a USB/IP server
//! (`usbipd` or any compatible stub): the import handshake, the exported
//! device descriptor, and the submit/unlink requests and replies that carry
//! URBs once a device is imported. All integers are big-endian on the wire.
//!
//! # Example
//!
//! ```
//! use protocol::{BasicHeader, CmdUnlink, Direction, UsbIpCommand};
//!
//! let unlink = CmdUnlink {
//!     header: BasicHeader {
//!         command: UsbIpCommand::CmdUnlink,
//!         seqnum: 8,
//!         devid: 0x0001_0002,
//!         direction: Direction::Out,
//!         ep: 0,
//!     },
//!     unlink_seqnum: 7,
//! };
//!
//! let bytes = unlink.to_wire();
//! assert_eq!(bytes.len(), CmdUnlink::SIZE);
//! assert_eq!(CmdUnlink::from_wire(&bytes).unwrap(), unlink);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{
    MAX_ISO_PACKETS, MAX_TRANSFER_SIZE, check_iso_count, check_iso_descriptors, check_length,
    decode_iso_descriptors, encode_ret_submit, encode_submit, spread_iso_payload,
};
pub use error::{ProtocolError, Result};
pub use messages::{
    BUSID_SIZE, BasicHeader, CmdSubmit, CmdUnlink, ExportedDevice, IsoPacketDescriptor, OpCode,
    OpHeader, OpImportReply, OpImportRequest, PDU_BODY_SIZE, PDU_SIZE, RetSubmit, RetUnlink,
    UsbIpCommand, transfer_flags,
};
pub use types::{DeviceSpeed, Direction, SetupPacket, TransferKind, UrbStatus, errno, request};
pub use version::{USBIP_VERSION, validate_version};
