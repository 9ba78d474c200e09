//! The per-device I/O thread
//!
//! One thread owns the socket and the reply parser. It sleeps in `poll(2)`
//! on the socket and the wake eventfd, writes whatever callers queued, then
//! parses every reply available. Only list operations happen under the
//! table lock; encoding, socket I/O and copying into URBs happen outside it.

use super::lifecycle::{Completion, Outgoing, RequestTable, SubmitInfo};
use super::receiver::{ReceiveError, ReceiveState, Reply, ReplyShape};
use super::wake::WakeEvent;
use crate::urb::{Urb, UrbHandle, lock_urb};
use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use protocol::{
    BasicHeader, CmdSubmit, CmdUnlink, Direction, IsoPacketDescriptor, RetSubmit, TransferKind,
    UrbStatus, UsbIpCommand, encode_submit, spread_iso_payload, transfer_flags,
};
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// State shared between the I/O thread and callers
pub(crate) struct Shared {
    table: Mutex<RequestTable>,
    /// Signalled whenever a request lands or `wakeup` is called
    pub(crate) landed: Condvar,
    pub(crate) wake: WakeEvent,
    shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            table: Mutex::new(RequestTable::new()),
            landed: Condvar::new(),
            wake: WakeEvent::new()?,
            shutdown: AtomicBool::new(false),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RequestTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a result into a request taken off its list and make it reapable
    ///
    /// The request lands even if `apply` panics, marked not responding.
    pub(crate) fn complete(&self, completion: Completion, apply: impl FnOnce(&mut Urb)) {
        let landing = Landing {
            shared: self,
            handle: completion.handle,
            urb: completion.urb,
        };
        if let Some(urb) = landing.urb.upgrade() {
            apply(&mut lock_urb(&urb));
        }
    }

    /// Complete with a status and no data
    pub(crate) fn complete_with(&self, completion: Completion, status: UrbStatus) {
        self.complete(completion, |urb| {
            urb.status = status;
            urb.actual_length = 0;
            for packet in &mut urb.iso_packets {
                packet.actual_length = 0;
                packet.status = status;
            }
        });
    }

    /// Ask the I/O thread to stop
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.signal();
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Detach and force-complete everything outstanding
    pub(crate) fn teardown(&self) {
        let completions = self.lock().detach_all();
        if !completions.is_empty() {
            info!(count = completions.len(), "completing outstanding requests as not responding");
        }
        for completion in completions {
            self.complete_with(completion, UrbStatus::NotResponding);
        }
        self.landed.notify_all();
    }
}

/// Lands a request taken off its list when dropped
struct Landing<'a> {
    shared: &'a Shared,
    handle: UrbHandle,
    urb: Weak<Mutex<Urb>>,
}

impl Drop for Landing<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            if let Some(urb) = self.urb.upgrade() {
                let mut urb = lock_urb(&urb);
                urb.status = UrbStatus::NotResponding;
                urb.actual_length = 0;
            }
        }
        self.shared.lock().land(self.handle);
        self.shared.landed.notify_all();
    }
}

/// Tears the session down when the I/O thread leaves `run`, by return or by panic
struct TeardownOnExit(Arc<Shared>);

impl Drop for TeardownOnExit {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("I/O thread panicked, detaching device");
        }
        self.0.teardown();
    }
}

#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Receive(#[from] ReceiveError),

    #[error("socket write failed: {0}")]
    Write(io::Error),

    #[error("poll failed: {0}")]
    Poll(io::Error),
}

/// The I/O thread's state
pub(crate) struct EventLoop {
    stream: TcpStream,
    shared: Arc<Shared>,
    receiver: ReceiveState,
    devid: u32,
    write_timeout: Duration,
}

impl EventLoop {
    pub(crate) fn new(
        stream: TcpStream,
        shared: Arc<Shared>,
        devid: u32,
        write_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            shared,
            receiver: ReceiveState::new(),
            devid,
            write_timeout,
        }
    }

    /// Serve until the connection fails or shutdown is requested
    pub(crate) fn run(mut self) {
        debug!("I/O thread started for devid {:#010x}", self.devid);
        let _teardown = TeardownOnExit(Arc::clone(&self.shared));
        match self.serve() {
            Ok(()) => info!("session closed"),
            Err(SessionError::Receive(ReceiveError::Disconnected)) => {
                warn!("server closed the connection, device detached")
            }
            Err(SessionError::Receive(ReceiveError::Protocol(e))) => {
                error!("protocol error, detaching device: {}", e)
            }
            Err(e) => error!("connection lost, detaching device: {}", e),
        }
        if self.receiver.in_progress() {
            debug!(phase = ?self.receiver.phase(), "discarding partially received reply");
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn serve(&mut self) -> Result<(), SessionError> {
        loop {
            if self.shared.shutdown_requested() {
                return Ok(());
            }
            let (readable, woken) = self.wait().map_err(SessionError::Poll)?;
            if woken {
                self.shared.wake.drain();
            }
            if self.shared.shutdown_requested() {
                return Ok(());
            }
            self.drain_pending()?;
            if readable {
                self.read_replies()?;
            }
        }
    }

    /// Block until the socket is readable or someone signals the eventfd
    fn wait(&self) -> io::Result<(bool, bool)> {
        let mut fds = [
            PollFd::new(self.stream.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.shared.wake.as_fd(), PollFlags::POLLIN),
        ];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let ready = |fd: &PollFd| fd.revents().is_some_and(|r| !r.is_empty());
        Ok((ready(&fds[0]), ready(&fds[1])))
    }

    /// Write every queued submit and unlink
    fn drain_pending(&mut self) -> Result<(), SessionError> {
        loop {
            let next = self.shared.lock().next_outgoing();
            let Some(next) = next else {
                return Ok(());
            };

            match next {
                Outgoing::Submit {
                    handle,
                    tag,
                    info,
                    urb,
                } => {
                    let pdu = match urb.upgrade() {
                        Some(urb) => {
                            let urb = lock_urb(&urb);
                            build_submit(self.devid, tag, &info, &urb)
                        }
                        None => None,
                    };
                    let Some(pdu) = pdu else {
                        warn!(%handle, tag, "request dropped or resized after queueing");
                        self.fail(handle);
                        continue;
                    };
                    if let Err(e) = write_all(&mut self.stream, &pdu, self.write_timeout) {
                        self.fail(handle);
                        return Err(SessionError::Write(e));
                    }
                    trace!(tag, ep = info.endpoint, len = info.shape.buffer_len, "CMD_SUBMIT sent");
                }
                Outgoing::Unlink { tag, target } => {
                    let cmd = CmdUnlink {
                        header: BasicHeader {
                            command: UsbIpCommand::CmdUnlink,
                            seqnum: tag,
                            devid: self.devid,
                            direction: Direction::Out,
                            ep: 0,
                        },
                        unlink_seqnum: target,
                    };
                    write_all(&mut self.stream, &cmd.to_wire(), self.write_timeout)
                        .map_err(SessionError::Write)?;
                    trace!(tag, target, "CMD_UNLINK sent");
                }
            }
        }
    }

    /// Complete a request whose submit never made it onto the wire
    fn fail(&self, handle: UrbHandle) {
        let completion = self.shared.lock().take_failed(handle);
        if let Some(completion) = completion {
            self.shared.complete_with(completion, UrbStatus::NotResponding);
        }
    }

    /// Parse and dispatch every complete reply available on the socket
    fn read_replies(&mut self) -> Result<(), SessionError> {
        let shared = Arc::clone(&self.shared);
        let lookup = move |seqnum: u32| -> Option<ReplyShape> { shared.lock().reply_shape(seqnum) };
        while let Some(reply) = self.receiver.poll_reply(&mut self.stream, &lookup)? {
            self.dispatch(reply);
        }
        Ok(())
    }

    fn dispatch(&self, reply: Reply) {
        match reply {
            Reply::Submit {
                ret,
                payload,
                iso,
                unmatched,
            } => {
                let tag = ret.header.seqnum;
                let completion = {
                    let mut table = self.shared.lock();
                    match table.take_in_flight(tag) {
                        Some(completion) => Some(completion),
                        None => {
                            if table.forget_orphan(tag) {
                                debug!(tag, "late RET_SUBMIT for unlinked request dropped");
                            } else {
                                warn!(tag, unmatched, "RET_SUBMIT for unknown request dropped");
                            }
                            None
                        }
                    }
                };
                if let Some(completion) = completion {
                    trace!(tag, status = ret.status, len = ret.actual_length, "RET_SUBMIT");
                    self.shared
                        .complete(completion, |urb| apply_submit_reply(urb, &ret, &payload, &iso));
                }
            }
            Reply::Unlink(ret) => {
                let tag = ret.header.seqnum;
                let completion = self.shared.lock().take_unlinked(tag);
                match completion {
                    Some(completion) => {
                        debug!(tag, target = completion.tag, status = ret.status, "unlinked");
                        self.shared.complete_with(completion, UrbStatus::Cancelled);
                    }
                    None => trace!(tag, "RET_UNLINK after completion dropped"),
                }
            }
        }
    }
}

/// Capture the wire-level shape of a request at queue time
pub(crate) fn submit_info(urb: &Urb) -> Result<SubmitInfo, String> {
    if urb.endpoint > 0x0f {
        return Err(format!("endpoint number {} out of range", urb.endpoint));
    }
    if urb.kind.has_setup() && urb.data.len() < protocol::SetupPacket::SIZE {
        return Err("control request without a setup packet".to_string());
    }
    let buffer_len = urb.data_len();
    if buffer_len > protocol::MAX_TRANSFER_SIZE {
        return Err(format!("transfer of {} bytes is too large", buffer_len));
    }

    let iso_packets = urb.iso_packets.len();
    match urb.kind {
        TransferKind::Isochronous => {
            if iso_packets == 0 || iso_packets > protocol::MAX_ISO_PACKETS {
                return Err(format!("{} isochronous packets", iso_packets));
            }
            protocol::check_iso_descriptors(&iso_descriptors(urb), buffer_len)
                .map_err(|e| e.to_string())?;
        }
        _ if iso_packets > 0 => {
            return Err("packet descriptors on a non-isochronous request".to_string());
        }
        _ => {}
    }

    Ok(SubmitInfo {
        shape: ReplyShape {
            direction: urb.direction,
            kind: urb.kind,
            buffer_len,
            iso_packets,
        },
        endpoint: urb.endpoint,
        short_ok: urb.short_ok,
        interval: urb.interval,
    })
}

fn iso_descriptors(urb: &Urb) -> Vec<IsoPacketDescriptor> {
    urb.iso_packets
        .iter()
        .map(|p| IsoPacketDescriptor {
            offset: p.offset,
            length: p.length,
            actual_length: 0,
            status: 0,
        })
        .collect()
}

/// Encode the CMD_SUBMIT for a request
///
/// `None` if the request no longer matches the shape it was queued with.
pub(crate) fn build_submit(devid: u32, tag: u32, info: &SubmitInfo, urb: &Urb) -> Option<Bytes> {
    let shape = info.shape;
    if urb.data_len() != shape.buffer_len || urb.iso_packets.len() != shape.iso_packets {
        return None;
    }

    let mut setup = [0u8; 8];
    if shape.kind.has_setup() {
        setup.copy_from_slice(urb.data.get(..8)?);
    }

    let mut flags = 0;
    if !info.short_ok && shape.direction == Direction::In {
        flags |= transfer_flags::SHORT_NOT_OK;
    }
    if shape.kind == TransferKind::Isochronous {
        flags |= transfer_flags::ISO_ASAP;
    }

    let iso = iso_descriptors(urb);
    let cmd = CmdSubmit {
        header: BasicHeader {
            command: UsbIpCommand::CmdSubmit,
            seqnum: tag,
            devid,
            direction: shape.direction,
            ep: u32::from(info.endpoint),
        },
        transfer_flags: flags,
        transfer_buffer_length: shape.buffer_len as u32,
        start_frame: 0,
        number_of_packets: iso.len() as u32,
        interval: info.interval,
        setup,
    };

    let payload = match shape.direction {
        Direction::Out => urb.payload(),
        Direction::In => &[],
    };
    Some(encode_submit(&cmd, payload, &iso))
}

/// Copy a RET_SUBMIT's results into the request
pub(crate) fn apply_submit_reply(
    urb: &mut Urb,
    ret: &RetSubmit,
    payload: &[u8],
    iso: &[IsoPacketDescriptor],
) {
    urb.status = UrbStatus::from_errno(ret.status);
    let offset = urb.data_offset();

    match urb.direction {
        Direction::In => {
            let dst = urb.data.get_mut(offset..).unwrap_or_default();
            let n = payload.len().min(dst.len());
            dst[..n].copy_from_slice(&payload[..n]);
            let mut overrun = n < payload.len();
            if urb.kind == TransferKind::Isochronous && !iso.is_empty() {
                if let Err(e) = spread_iso_payload(dst, n, iso) {
                    // The buffer shrank after the request was submitted.
                    warn!(error = %e, "Isochronous reply no longer fits the request buffer");
                    overrun = true;
                }
            }
            if overrun {
                urb.status = UrbStatus::DataOverrun;
            }
            urb.actual_length = n;
        }
        Direction::Out => {
            urb.actual_length = (ret.actual_length as usize).min(urb.data_len());
        }
    }

    for (packet, desc) in urb.iso_packets.iter_mut().zip(iso) {
        packet.actual_length = desc.actual_length;
        packet.status = UrbStatus::from_errno(desc.status);
    }
}

/// Write all of `buf` to the non-blocking socket, waiting for room as needed
fn write_all(stream: &mut TcpStream, mut buf: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "socket not writable",
                    ));
                }
                wait_writable(stream)?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn wait_writable(stream: &TcpStream) -> io::Result<()> {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
    match poll(&mut fds, PollTimeout::from(100u16)) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
