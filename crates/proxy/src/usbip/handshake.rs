//! Connection setup: TCP connect and OP_REQ_IMPORT

use crate::address::UsbIpAddress;
use crate::error::{ProxyError, Result};
use protocol::{ExportedDevice, OpImportReply, OpImportRequest};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

/// Connect to the first resolved address that answers
pub(crate) fn connect(address: &UsbIpAddress, timeout: Duration) -> Result<TcpStream> {
    let target = address.socket_addr();
    let mut last_error = None;
    for addr in target.to_socket_addrs()? {
        debug!("connecting to {}", addr);
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) => Err(ProxyError::Io(e)),
        None => Err(ProxyError::invalid_address(
            &address.to_string(),
            format!("'{}' did not resolve", address.host),
        )),
    }
}

/// Import `busid` over a freshly connected stream
///
/// Runs in blocking mode with `timeout` on every read and write; the caller
/// switches the stream to non-blocking afterwards.
pub(crate) fn import(stream: &mut TcpStream, busid: &str, timeout: Duration) -> Result<ExportedDevice> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let request = OpImportRequest::new(busid)?;
    stream.write_all(&request.to_wire())?;

    let mut reply = [0u8; OpImportReply::SIZE];
    stream.read_exact(&mut reply)?;
    let reply = OpImportReply::from_wire(&reply)?;
    reply.check()?;
    if reply.status != 0 {
        return Err(ProxyError::ImportRejected {
            busid: busid.to_string(),
            status: reply.status,
        });
    }

    let mut device = [0u8; ExportedDevice::SIZE];
    stream.read_exact(&mut device)?;
    let device = ExportedDevice::from_wire(&device)?;
    if device.busid != busid {
        warn!("imported bus id '{}' but server reports '{}'", busid, device.busid);
    }

    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    Ok(device)
}
