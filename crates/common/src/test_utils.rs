//! Test utilities for usbip-proxy
//!
//! Provides a scripted USB/IP server on a loopback socket, a reader that
//! delivers bytes in caller-chosen fragments, and helpers for building
//! descriptors and setup packets.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{ChunkedReader, create_mock_bulk_data};
//! use std::io::Read;
//!
//! let mut reader = ChunkedReader::new(create_mock_bulk_data(6), vec![2, 4]);
//! let mut buf = [0u8; 8];
//! assert_eq!(reader.read(&mut buf).unwrap(), 2);
//! assert!(reader.read(&mut buf).is_err()); // WouldBlock between fragments
//! assert_eq!(reader.read(&mut buf).unwrap(), 4);
//! ```

use protocol::{
    BasicHeader, CmdSubmit, CmdUnlink, Direction, ExportedDevice, IsoPacketDescriptor,
    OpImportReply, OpImportRequest, PDU_SIZE, RetSubmit, RetUnlink, SetupPacket, USBIP_VERSION,
    UsbIpCommand, decode_iso_descriptors, encode_ret_submit,
};
use rand::Rng;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn invalid_data(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Create a mock exported-device descriptor for `busid`
pub fn create_mock_exported_device(busid: &str) -> ExportedDevice {
    ExportedDevice {
        path: format!("/sys/devices/platform/dummy_hcd.0/usb1/{}", busid),
        busid: busid.to_string(),
        busnum: 1,
        devnum: 2,
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
    }
}

/// Create a mock USB descriptor response (GET_DESCRIPTOR Device)
///
/// Returns a standard 18-byte device descriptor
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Build a control-transfer buffer: setup packet followed by `data_len` zero bytes
pub fn create_control_buffer(setup: SetupPacket, data_len: usize) -> Vec<u8> {
    let mut buf = setup.to_bytes().to_vec();
    buf.resize(SetupPacket::SIZE + data_len, 0);
    buf
}

/// Split `len` bytes into random fragment sizes (each at least one byte)
pub fn random_chunks(len: usize) -> Vec<usize> {
    let mut rng = rand::rng();
    let mut chunks = Vec::new();
    let mut left = len;
    while left > 0 {
        let n = rng.random_range(1..=left.min(97));
        chunks.push(n);
        left -= n;
    }
    chunks
}

/// Run `f` on a helper thread and give up after `duration`
pub fn with_timeout<T, F>(duration: Duration, f: F) -> Result<T, TimeoutError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(duration)
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Reader that hands out its data in fixed fragments
///
/// Each fragment is returned by one `read` call (or several, if the caller
/// asks for fewer bytes); between fragments a single `WouldBlock` is
/// returned, like a non-blocking socket whose next segment has not arrived.
/// Once drained it keeps returning `WouldBlock`, or EOF after [`Self::eof_at_end`].
pub struct ChunkedReader {
    data: Vec<u8>,
    pos: usize,
    chunks: VecDeque<usize>,
    current: usize,
    block_next: bool,
    eof: bool,
}

impl ChunkedReader {
    pub fn new(data: Vec<u8>, chunks: Vec<usize>) -> Self {
        Self {
            data,
            pos: 0,
            chunks: chunks.into(),
            current: 0,
            block_next: false,
            eof: false,
        }
    }

    /// Fragments of `size` bytes each
    pub fn uniform(data: Vec<u8>, size: usize) -> Self {
        let size = size.max(1);
        let mut chunks = vec![size; data.len() / size];
        if data.len() % size != 0 {
            chunks.push(data.len() % size);
        }
        Self::new(data, chunks)
    }

    /// Report EOF instead of `WouldBlock` once all data is consumed
    pub fn eof_at_end(mut self) -> Self {
        self.eof = true;
        self
    }

    /// Bytes not yet handed out
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.current == 0 {
            if self.block_next {
                self.block_next = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            match self.chunks.pop_front() {
                Some(n) => self.current = n.min(self.remaining()),
                None => self.current = self.remaining(),
            }
            if self.current == 0 {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
        }
        let n = buf.len().min(self.current);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        self.current -= n;
        if self.current == 0 {
            self.block_next = true;
        }
        Ok(n)
    }
}

/// A request read by the mock server
#[derive(Debug, Clone)]
pub enum ClientPdu {
    Submit {
        cmd: CmdSubmit,
        payload: Vec<u8>,
        iso: Vec<IsoPacketDescriptor>,
    },
    Unlink(CmdUnlink),
}

/// Scripted USB/IP server listening on 127.0.0.1
pub struct MockUsbIpServer {
    listener: TcpListener,
    device: ExportedDevice,
}

impl MockUsbIpServer {
    /// Bind to an ephemeral loopback port exporting `busid`
    pub fn bind(busid: &str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        Ok(Self {
            listener,
            device: create_mock_exported_device(busid),
        })
    }

    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    /// Address string understood by the proxy (`usbip://127.0.0.1:<port>:<busid>`)
    pub fn address(&self) -> String {
        format!("usbip://127.0.0.1:{}:{}", self.port(), self.device.busid)
    }

    pub fn device(&self) -> &ExportedDevice {
        &self.device
    }

    /// Accept one client and complete the import handshake successfully
    pub fn accept(&self) -> io::Result<MockConnection> {
        let (mut stream, _) = self.listener.accept()?;
        stream.set_read_timeout(Some(DEFAULT_TEST_TIMEOUT))?;
        stream.set_nodelay(true)?;

        let mut req = [0u8; OpImportRequest::SIZE];
        stream.read_exact(&mut req)?;
        let req = OpImportRequest::from_wire(&req).map_err(invalid_data)?;
        if req.busid != self.device.busid {
            return Err(invalid_data(format!("unexpected bus id {}", req.busid)));
        }

        let reply = OpImportReply {
            version: USBIP_VERSION,
            status: 0,
        };
        stream.write_all(&reply.to_wire())?;
        stream.write_all(&self.device.to_wire())?;
        stream.flush()?;

        Ok(MockConnection {
            stream,
            devid: self.device.devid(),
        })
    }

    /// Accept one client and answer its import request with `status` (no device)
    pub fn accept_and_reject(&self, status: u32) -> io::Result<()> {
        let (mut stream, _) = self.listener.accept()?;
        stream.set_read_timeout(Some(DEFAULT_TEST_TIMEOUT))?;
        let mut req = [0u8; OpImportRequest::SIZE];
        stream.read_exact(&mut req)?;
        let reply = OpImportReply {
            version: USBIP_VERSION,
            status,
        };
        stream.write_all(&reply.to_wire())?;
        stream.flush()
    }
}

/// Server side of one imported-device connection
pub struct MockConnection {
    stream: TcpStream,
    devid: u32,
}

impl MockConnection {
    pub fn devid(&self) -> u32 {
        self.devid
    }

    /// Read the next CMD_SUBMIT or CMD_UNLINK, with its trailing data
    pub fn read_pdu(&mut self) -> io::Result<ClientPdu> {
        let mut pdu = [0u8; PDU_SIZE];
        self.stream.read_exact(&mut pdu)?;
        let header = BasicHeader::from_wire(&pdu).map_err(invalid_data)?;
        match header.command {
            UsbIpCommand::CmdSubmit => {
                let cmd = CmdSubmit::from_wire(&pdu).map_err(invalid_data)?;
                let mut payload = Vec::new();
                if header.direction == Direction::Out && cmd.transfer_buffer_length > 0 {
                    payload.resize(cmd.transfer_buffer_length as usize, 0);
                    self.stream.read_exact(&mut payload)?;
                }
                let mut iso = Vec::new();
                if cmd.number_of_packets > 0 {
                    let count = cmd.number_of_packets as usize;
                    let mut raw = vec![0u8; count * IsoPacketDescriptor::SIZE];
                    self.stream.read_exact(&mut raw)?;
                    iso = decode_iso_descriptors(&raw, count).map_err(invalid_data)?;
                }
                Ok(ClientPdu::Submit { cmd, payload, iso })
            }
            UsbIpCommand::CmdUnlink => Ok(ClientPdu::Unlink(
                CmdUnlink::from_wire(&pdu).map_err(invalid_data)?,
            )),
            other => Err(invalid_data(format!("unexpected command {:?}", other))),
        }
    }

    /// Read a PDU that must be a CMD_SUBMIT
    pub fn expect_submit(&mut self) -> io::Result<(CmdSubmit, Vec<u8>, Vec<IsoPacketDescriptor>)> {
        match self.read_pdu()? {
            ClientPdu::Submit { cmd, payload, iso } => Ok((cmd, payload, iso)),
            other => Err(invalid_data(format!("expected CMD_SUBMIT, got {:?}", other))),
        }
    }

    /// Read a PDU that must be a CMD_UNLINK
    pub fn expect_unlink(&mut self) -> io::Result<CmdUnlink> {
        match self.read_pdu()? {
            ClientPdu::Unlink(cmd) => Ok(cmd),
            other => Err(invalid_data(format!("expected CMD_UNLINK, got {:?}", other))),
        }
    }

    /// Build the RET_SUBMIT for `seqnum` the way the Linux stub does
    pub fn ret_submit(&self, seqnum: u32, status: i32, actual_length: u32, packets: u32) -> RetSubmit {
        RetSubmit {
            header: BasicHeader {
                command: UsbIpCommand::RetSubmit,
                seqnum,
                devid: self.devid,
                direction: Direction::Out,
                ep: 0,
            },
            status,
            actual_length,
            start_frame: 0,
            number_of_packets: packets,
            error_count: 0,
            setup: [0; 8],
        }
    }

    /// Send a RET_SUBMIT in one write
    pub fn reply_submit(
        &mut self,
        seqnum: u32,
        status: i32,
        payload: &[u8],
        iso: &[IsoPacketDescriptor],
    ) -> io::Result<()> {
        let ret = self.ret_submit(seqnum, status, payload.len() as u32, iso.len() as u32);
        self.write_raw(&encode_ret_submit(&ret, payload, iso))
    }

    /// Send an arbitrary RET_SUBMIT split into writes of the given sizes
    pub fn reply_submit_chunked(
        &mut self,
        ret: &RetSubmit,
        payload: &[u8],
        iso: &[IsoPacketDescriptor],
        chunks: &[usize],
    ) -> io::Result<()> {
        let bytes = encode_ret_submit(ret, payload, iso);
        let mut pos = 0;
        for &n in chunks {
            let end = (pos + n).min(bytes.len());
            self.write_raw(&bytes[pos..end])?;
            pos = end;
            std::thread::sleep(Duration::from_millis(5));
        }
        if pos < bytes.len() {
            self.write_raw(&bytes[pos..])?;
        }
        Ok(())
    }

    /// Send a RET_UNLINK; `seqnum` is the unlink request's own tag
    pub fn reply_unlink(&mut self, seqnum: u32, status: i32) -> io::Result<()> {
        let ret = RetUnlink {
            header: BasicHeader {
                command: UsbIpCommand::RetUnlink,
                seqnum,
                devid: self.devid,
                direction: Direction::Out,
                ep: 0,
            },
            status,
        };
        self.write_raw(&ret.to_wire())
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    /// Drop the connection as an unplugged device would
    pub fn disconnect(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunked_reader_fragments() {
        let mut reader = ChunkedReader::new(create_mock_bulk_data(10), vec![3, 7]);
        let mut buf = [0u8; 16];

        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[0, 1, 2]);
        assert_eq!(
            reader.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        assert_eq!(reader.read(&mut buf[..2]).unwrap(), 2);
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(reader.remaining(), 0);
        assert_eq!(
            reader.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_chunked_reader_eof() {
        let mut reader = ChunkedReader::uniform(vec![1, 2], 4).eof_at_end();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert!(reader.read(&mut buf).is_err());
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_random_chunks_cover_length() {
        for len in [1usize, 17, 500] {
            let chunks = random_chunks(len);
            assert_eq!(chunks.iter().sum::<usize>(), len);
            assert!(chunks.iter().all(|&c| c > 0));
        }
    }

    #[test]
    fn test_create_control_buffer() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        let buf = create_control_buffer(setup, 18);
        assert_eq!(buf.len(), 26);
        assert_eq!(&buf[..8], &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
    }

    #[test]
    fn test_create_mock_device_descriptor() {
        let desc = create_mock_device_descriptor();

        assert_eq!(desc.len(), 18);
        assert_eq!(desc[0], 0x12); // bLength
        assert_eq!(desc[1], 0x01); // bDescriptorType
    }

    #[test]
    fn test_with_timeout() {
        assert_eq!(with_timeout(DEFAULT_TEST_TIMEOUT, || 42).unwrap(), 42);
        assert!(
            with_timeout(Duration::from_millis(10), || {
                std::thread::sleep(Duration::from_secs(1));
            })
            .is_err()
        );
    }
}
