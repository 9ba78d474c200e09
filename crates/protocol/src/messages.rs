//! USB/IP message definitions
//!
//! Every structure has a pure `encode`/`to_wire` and `from_wire` pair.
//! Encoding appends big-endian fields to a [`BufMut`]; decoding reads them
//! back field by field from a slice whose length is checked up front, so no
//! native struct layout is ever relied upon.
//!
//! Layouts follow the Linux kernel's `drivers/usb/usbip/usbip_common.h`:
//!
//! ```text
//! OP_REQ_IMPORT   version:u16 code:u16 status:u32 busid:[32]          (40 bytes)
//! OP_REP_IMPORT   version:u16 code:u16 status:u32                     ( 8 bytes)
//!                 followed by usbip_usb_device on success             (312 bytes)
//! basic header    command:u32 seqnum:u32 devid:u32 direction:u32 ep:u32 (20 bytes)
//! CMD_SUBMIT      header flags length start_frame npackets interval setup[8]
//! RET_SUBMIT      header status actual start_frame npackets errors setup[8]
//! CMD_UNLINK      header unlink_seqnum pad[24]
//! RET_UNLINK      header status pad[24]
//! iso descriptor  offset:u32 length:u32 actual_length:u32 status:i32  (16 bytes)
//! ```

use crate::error::{ProtocolError, Result};
use crate::types::Direction;
use crate::version::{USBIP_VERSION, validate_version};
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Read;

/// Length of the NUL-padded bus id field
pub const BUSID_SIZE: usize = 32;
/// Length of the NUL-padded sysfs path field
pub const SYSFS_PATH_SIZE: usize = 256;

/// Connection-setup operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Request to import an exported device
    ReqImport,
    /// Reply to an import request
    RepImport,
}

impl OpCode {
    pub fn to_wire(self) -> u16 {
        match self {
            OpCode::ReqImport => 0x8003,
            OpCode::RepImport => 0x0003,
        }
    }

    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            0x8003 => Ok(OpCode::ReqImport),
            0x0003 => Ok(OpCode::RepImport),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}

/// USB/IP command codes carried in the basic header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbIpCommand {
    /// Submit a USB request (URB)
    CmdSubmit,
    /// Unlink a USB request
    CmdUnlink,
    /// Return from USB request
    RetSubmit,
    /// Return from unlink
    RetUnlink,
}

impl UsbIpCommand {
    pub fn to_wire(self) -> u32 {
        match self {
            UsbIpCommand::CmdSubmit => 0x0001,
            UsbIpCommand::CmdUnlink => 0x0002,
            UsbIpCommand::RetSubmit => 0x0003,
            UsbIpCommand::RetUnlink => 0x0004,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0x0001 => Ok(UsbIpCommand::CmdSubmit),
            0x0002 => Ok(UsbIpCommand::CmdUnlink),
            0x0003 => Ok(UsbIpCommand::RetSubmit),
            0x0004 => Ok(UsbIpCommand::RetUnlink),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Transfer flag bits in CMD_SUBMIT
pub mod transfer_flags {
    /// Short reads are an error
    pub const SHORT_NOT_OK: u32 = 0x0000_0001;
    /// Schedule isochronous transfer as soon as possible
    pub const ISO_ASAP: u32 = 0x0000_0002;
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn put_padded_str(dst: &mut impl BufMut, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    dst.put_slice(&bytes[..n]);
    dst.put_bytes(0, width - n);
}

fn read_padded_str(r: &mut &[u8], width: usize) -> Result<String> {
    let mut raw = vec![0u8; width];
    r.read_exact(&mut raw)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

fn to_bytes(size: usize, encode: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::with_capacity(size);
    encode(&mut buf);
    debug_assert_eq!(buf.len(), size);
    buf.freeze()
}

/// Common prefix of every connection-setup message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: OpCode,
    pub status: u32,
}

impl OpHeader {
    pub const SIZE: usize = 8;

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.version);
        dst.put_u16(self.code.to_wire());
        dst.put_u32(self.status);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    /// Decode without validating the version; see [`OpImportReply::check`]
    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let mut r = buf;
        let version = r.read_u16::<BigEndian>()?;
        let code = OpCode::from_wire(r.read_u16::<BigEndian>()?)?;
        let status = r.read_u32::<BigEndian>()?;
        Ok(Self {
            version,
            code,
            status,
        })
    }
}

/// OP_REQ_IMPORT: ask the server to hand over the device at `busid`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpImportRequest {
    pub busid: String,
}

impl OpImportRequest {
    pub const SIZE: usize = OpHeader::SIZE + BUSID_SIZE;

    /// Create a request; the bus id must leave room for its NUL terminator
    pub fn new(busid: &str) -> Result<Self> {
        if busid.is_empty() || busid.len() >= BUSID_SIZE || busid.contains('\0') {
            return Err(ProtocolError::InvalidBusId(busid.to_string()));
        }
        Ok(Self {
            busid: busid.to_string(),
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        OpHeader {
            version: USBIP_VERSION,
            code: OpCode::ReqImport,
            status: 0,
        }
        .encode(dst);
        put_padded_str(dst, &self.busid, BUSID_SIZE);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let header = OpHeader::from_wire(buf)?;
        validate_version(header.version)?;
        if header.code != OpCode::ReqImport {
            return Err(ProtocolError::UnknownOpCode(header.code.to_wire()));
        }
        let mut r = &buf[OpHeader::SIZE..];
        let busid = read_padded_str(&mut r, BUSID_SIZE)?;
        Self::new(&busid)
    }
}

/// OP_REP_IMPORT header; on success an [`ExportedDevice`] follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpImportReply {
    pub version: u16,
    pub status: u32,
}

impl OpImportReply {
    pub const SIZE: usize = OpHeader::SIZE;

    pub fn encode(&self, dst: &mut impl BufMut) {
        OpHeader {
            version: self.version,
            code: OpCode::RepImport,
            status: self.status,
        }
        .encode(dst);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        let header = OpHeader::from_wire(buf)?;
        if header.code != OpCode::RepImport {
            return Err(ProtocolError::UnknownOpCode(header.code.to_wire()));
        }
        Ok(Self {
            version: header.version,
            status: header.status,
        })
    }

    /// Version must match; a non-zero status is left to the caller
    pub fn check(&self) -> Result<()> {
        validate_version(self.version)
    }
}

/// Exported-device descriptor (`struct usbip_usb_device`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl ExportedDevice {
    pub const SIZE: usize = SYSFS_PATH_SIZE + BUSID_SIZE + 24;

    /// Device id used in every basic header of this session
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | (self.devnum & 0xffff)
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        put_padded_str(dst, &self.path, SYSFS_PATH_SIZE);
        put_padded_str(dst, &self.busid, BUSID_SIZE);
        dst.put_u32(self.busnum);
        dst.put_u32(self.devnum);
        dst.put_u32(self.speed);
        dst.put_u16(self.id_vendor);
        dst.put_u16(self.id_product);
        dst.put_u16(self.bcd_device);
        dst.put_u8(self.device_class);
        dst.put_u8(self.device_subclass);
        dst.put_u8(self.device_protocol);
        dst.put_u8(self.configuration_value);
        dst.put_u8(self.num_configurations);
        dst.put_u8(self.num_interfaces);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let mut r = buf;
        let path = read_padded_str(&mut r, SYSFS_PATH_SIZE)?;
        let busid = read_padded_str(&mut r, BUSID_SIZE)?;
        Ok(Self {
            path,
            busid,
            busnum: r.read_u32::<BigEndian>()?,
            devnum: r.read_u32::<BigEndian>()?,
            speed: r.read_u32::<BigEndian>()?,
            id_vendor: r.read_u16::<BigEndian>()?,
            id_product: r.read_u16::<BigEndian>()?,
            bcd_device: r.read_u16::<BigEndian>()?,
            device_class: r.read_u8()?,
            device_subclass: r.read_u8()?,
            device_protocol: r.read_u8()?,
            configuration_value: r.read_u8()?,
            num_configurations: r.read_u8()?,
            num_interfaces: r.read_u8()?,
        })
    }
}

/// Basic header preceding every request and reply after the import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicHeader {
    pub command: UsbIpCommand,
    /// Sequence tag correlating requests and replies
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    /// Endpoint number (without direction bit)
    pub ep: u32,
}

impl BasicHeader {
    pub const SIZE: usize = 20;

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.command.to_wire());
        dst.put_u32(self.seqnum);
        dst.put_u32(self.devid);
        dst.put_u32(self.direction.to_wire());
        dst.put_u32(self.ep);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let mut r = buf;
        Ok(Self {
            command: UsbIpCommand::from_wire(r.read_u32::<BigEndian>()?)?,
            seqnum: r.read_u32::<BigEndian>()?,
            devid: r.read_u32::<BigEndian>()?,
            direction: Direction::from_wire(r.read_u32::<BigEndian>()?)?,
            ep: r.read_u32::<BigEndian>()?,
        })
    }
}

/// Size of every request/reply after the import: header plus 28-byte body
pub const PDU_SIZE: usize = 48;
/// Bytes following the basic header in every request/reply
pub const PDU_BODY_SIZE: usize = PDU_SIZE - BasicHeader::SIZE;

/// CMD_SUBMIT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: BasicHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: i32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
}

impl CmdSubmit {
    pub const SIZE: usize = PDU_SIZE;

    pub fn encode(&self, dst: &mut impl BufMut) {
        self.header.encode(dst);
        dst.put_u32(self.transfer_flags);
        dst.put_u32(self.transfer_buffer_length);
        dst.put_i32(self.start_frame);
        dst.put_u32(self.number_of_packets);
        dst.put_u32(self.interval);
        dst.put_slice(&self.setup);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let header = BasicHeader::from_wire(buf)?;
        let mut r = &buf[BasicHeader::SIZE..];
        let transfer_flags = r.read_u32::<BigEndian>()?;
        let transfer_buffer_length = r.read_u32::<BigEndian>()?;
        let start_frame = r.read_i32::<BigEndian>()?;
        let number_of_packets = r.read_u32::<BigEndian>()?;
        let interval = r.read_u32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        r.read_exact(&mut setup)?;
        Ok(Self {
            header,
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
        })
    }
}

/// RET_SUBMIT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: BasicHeader,
    /// Linux errno, 0 on success
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: i32,
    pub number_of_packets: u32,
    pub error_count: u32,
    pub setup: [u8; 8],
}

impl RetSubmit {
    pub const SIZE: usize = PDU_SIZE;

    pub fn encode(&self, dst: &mut impl BufMut) {
        self.header.encode(dst);
        dst.put_i32(self.status);
        dst.put_u32(self.actual_length);
        dst.put_i32(self.start_frame);
        dst.put_u32(self.number_of_packets);
        dst.put_u32(self.error_count);
        dst.put_slice(&self.setup);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    /// Decode the 28 bytes that follow an already-parsed header
    pub fn decode_body(header: BasicHeader, body: &[u8]) -> Result<Self> {
        ensure_len(body, PDU_BODY_SIZE)?;
        let mut r = body;
        let status = r.read_i32::<BigEndian>()?;
        let actual_length = r.read_u32::<BigEndian>()?;
        let start_frame = r.read_i32::<BigEndian>()?;
        let number_of_packets = r.read_u32::<BigEndian>()?;
        let error_count = r.read_u32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        r.read_exact(&mut setup)?;
        Ok(Self {
            header,
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
            setup,
        })
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let header = BasicHeader::from_wire(buf)?;
        Self::decode_body(header, &buf[BasicHeader::SIZE..])
    }
}

/// CMD_UNLINK: cancel the request tagged `unlink_seqnum`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub header: BasicHeader,
    pub unlink_seqnum: u32,
}

impl CmdUnlink {
    pub const SIZE: usize = PDU_SIZE;

    pub fn encode(&self, dst: &mut impl BufMut) {
        self.header.encode(dst);
        dst.put_u32(self.unlink_seqnum);
        dst.put_bytes(0, PDU_BODY_SIZE - 4);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let header = BasicHeader::from_wire(buf)?;
        let mut r = &buf[BasicHeader::SIZE..];
        Ok(Self {
            header,
            unlink_seqnum: r.read_u32::<BigEndian>()?,
        })
    }
}

/// RET_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub header: BasicHeader,
    /// `-ECONNRESET` when the target was unlinked, 0 when it had already completed
    pub status: i32,
}

impl RetUnlink {
    pub const SIZE: usize = PDU_SIZE;

    pub fn encode(&self, dst: &mut impl BufMut) {
        self.header.encode(dst);
        dst.put_i32(self.status);
        dst.put_bytes(0, PDU_BODY_SIZE - 4);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    pub fn decode_body(header: BasicHeader, body: &[u8]) -> Result<Self> {
        ensure_len(body, PDU_BODY_SIZE)?;
        let mut r = body;
        Ok(Self {
            header,
            status: r.read_i32::<BigEndian>()?,
        })
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let header = BasicHeader::from_wire(buf)?;
        Self::decode_body(header, &buf[BasicHeader::SIZE..])
    }
}

/// Isochronous packet descriptor (`struct usbip_iso_packet_descriptor`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub const SIZE: usize = 16;

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.offset);
        dst.put_u32(self.length);
        dst.put_u32(self.actual_length);
        dst.put_i32(self.status);
    }

    pub fn to_wire(&self) -> Bytes {
        to_bytes(Self::SIZE, |b| self.encode(b))
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE)?;
        let mut r = buf;
        Ok(Self {
            offset: r.read_u32::<BigEndian>()?,
            length: r.read_u32::<BigEndian>()?,
            actual_length: r.read_u32::<BigEndian>()?,
            status: r.read_i32::<BigEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(command: UsbIpCommand, seqnum: u32) -> BasicHeader {
        BasicHeader {
            command,
            seqnum,
            devid: 0x0001_0002,
            direction: Direction::In,
            ep: 1,
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = header(UsbIpCommand::CmdSubmit, 42).to_wire();
        assert_eq!(bytes.len(), BasicHeader::SIZE);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 42]);
        assert_eq!(&bytes[8..12], &[0, 1, 0, 2]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 1]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut bytes = header(UsbIpCommand::RetSubmit, 1).to_wire().to_vec();
        bytes[3] = 0x09;
        assert!(matches!(
            BasicHeader::from_wire(&bytes),
            Err(ProtocolError::UnknownCommand(9))
        ));
    }

    #[test]
    fn test_pdu_sizes() {
        let h = header(UsbIpCommand::CmdUnlink, 7);
        assert_eq!(CmdUnlink { header: h, unlink_seqnum: 3 }.to_wire().len(), 48);
        assert_eq!(RetUnlink { header: h, status: 0 }.to_wire().len(), 48);
        assert_eq!(OpImportRequest::new("1-1").unwrap().to_wire().len(), 40);
        assert_eq!(ExportedDevice::SIZE, 312);
    }

    #[test]
    fn test_busid_validation() {
        assert!(OpImportRequest::new("").is_err());
        assert!(OpImportRequest::new(&"x".repeat(BUSID_SIZE)).is_err());
        assert!(OpImportRequest::new(&"x".repeat(BUSID_SIZE - 1)).is_ok());
    }

    #[test]
    fn test_short_buffer() {
        let bytes = header(UsbIpCommand::RetSubmit, 1).to_wire();
        assert!(matches!(
            RetSubmit::from_wire(&bytes),
            Err(ProtocolError::BufferTooSmall { needed: 48, available: 20 })
        ));
    }

    #[test]
    fn test_devid() {
        let dev = ExportedDevice {
            path: "/sys/devices/pci0000:00/usb3/3-2".to_string(),
            busid: "3-2".to_string(),
            busnum: 3,
            devnum: 5,
            speed: 3,
            id_vendor: 0x1234,
            id_product: 0x5678,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
        };
        assert_eq!(dev.devid(), 0x0003_0005);
    }
}
