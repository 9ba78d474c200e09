//! Incremental reply parser
//!
//! Replies arrive on a non-blocking socket in arbitrary fragments. The
//! parser keeps an explicit cursor per phase so that a read returning fewer
//! bytes than needed, or nothing at all, leaves it exactly where it was:
//!
//! ```text
//! HeaderCommon (20) -> HeaderResidual (28) -> [UrbBuffer] -> [IsocPacketDescriptors] -> HeaderCommon
//! ```
//!
//! `received + remaining` always equals the size of the current phase, and
//! the phase only changes once `remaining` reaches zero. The size of every
//! later phase is derived from header fields already parsed and checked
//! against the submitted request's shape.

use protocol::{
    BasicHeader, Direction, IsoPacketDescriptor, MAX_ISO_PACKETS, MAX_TRANSFER_SIZE, PDU_BODY_SIZE,
    PDU_SIZE, ProtocolError, RetSubmit, RetUnlink, TransferKind, UsbIpCommand, check_iso_count,
    check_iso_descriptors, check_length, decode_iso_descriptors,
};
use std::io::{self, Read};
use thiserror::Error;
use tracing::trace;

/// What the parser needs to know about the request a reply belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplyShape {
    pub direction: Direction,
    pub kind: TransferKind,
    /// Capacity of the data stage
    pub buffer_len: usize,
    /// Isochronous packets submitted
    pub iso_packets: usize,
}

impl ReplyShape {
    /// Shape assumed for a reply nobody is waiting for, so its trailing
    /// data can still be consumed
    fn unknown(ret: &RetSubmit) -> Self {
        let (kind, iso_packets) = match ret.number_of_packets {
            0 => (TransferKind::Bulk, 0),
            _ => (TransferKind::Isochronous, MAX_ISO_PACKETS),
        };
        Self {
            direction: ret.header.direction,
            kind,
            buffer_len: MAX_TRANSFER_SIZE,
            iso_packets,
        }
    }
}

/// Maps a RET_SUBMIT sequence number to the shape of its request
pub(crate) trait ReplyLookup {
    fn reply_shape(&self, seqnum: u32) -> Option<ReplyShape>;
}

impl<F: Fn(u32) -> Option<ReplyShape>> ReplyLookup for F {
    fn reply_shape(&self, seqnum: u32) -> Option<ReplyShape> {
        self(seqnum)
    }
}

/// A complete reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Submit {
        ret: RetSubmit,
        payload: Vec<u8>,
        iso: Vec<IsoPacketDescriptor>,
        /// No outstanding request matched when the header was parsed
        unmatched: bool,
    },
    Unlink(RetUnlink),
}

#[derive(Debug, Error)]
pub(crate) enum ReceiveError {
    #[error("connection closed by server")]
    Disconnected,

    #[error("socket read failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvPhase {
    HeaderCommon,
    HeaderResidual,
    UrbBuffer,
    IsocPacketDescriptors,
}

/// Parser state for one connection
pub(crate) struct ReceiveState {
    phase: RecvPhase,
    received: usize,
    remaining: usize,
    pdu: [u8; PDU_SIZE],
    payload: Vec<u8>,
    iso_raw: Vec<u8>,
    ret: Option<RetSubmit>,
    iso_count: usize,
    shape: Option<ReplyShape>,
    unmatched: bool,
}

impl Default for ReceiveState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveState {
    pub(crate) fn new() -> Self {
        Self {
            phase: RecvPhase::HeaderCommon,
            received: 0,
            remaining: BasicHeader::SIZE,
            pdu: [0; PDU_SIZE],
            payload: Vec::new(),
            iso_raw: Vec::new(),
            ret: None,
            iso_count: 0,
            shape: None,
            unmatched: false,
        }
    }

    pub(crate) fn phase(&self) -> RecvPhase {
        self.phase
    }

    /// Whether a reply has been partially read
    pub(crate) fn in_progress(&self) -> bool {
        self.phase != RecvPhase::HeaderCommon || self.received > 0
    }

    fn enter(&mut self, phase: RecvPhase, size: usize) {
        trace!(?phase, size, "receive phase");
        self.phase = phase;
        self.received = 0;
        self.remaining = size;
    }

    fn reset(&mut self) {
        self.enter(RecvPhase::HeaderCommon, BasicHeader::SIZE);
        self.payload = Vec::new();
        self.iso_raw = Vec::new();
        self.ret = None;
        self.iso_count = 0;
        self.shape = None;
        self.unmatched = false;
    }

    fn phase_buffer(&mut self) -> &mut [u8] {
        match self.phase {
            RecvPhase::HeaderCommon => &mut self.pdu[..BasicHeader::SIZE],
            RecvPhase::HeaderResidual => &mut self.pdu[BasicHeader::SIZE..],
            RecvPhase::UrbBuffer => &mut self.payload,
            RecvPhase::IsocPacketDescriptors => &mut self.iso_raw,
        }
    }

    /// Read until a reply is complete or the reader has nothing more
    ///
    /// `Ok(None)` means the reader would block; the state is kept and the
    /// call can be repeated when more data arrives. EOF is reported as
    /// [`ReceiveError::Disconnected`]. After any error the connection must
    /// be torn down.
    pub(crate) fn poll_reply<R, L>(
        &mut self,
        reader: &mut R,
        lookup: &L,
    ) -> Result<Option<Reply>, ReceiveError>
    where
        R: Read + ?Sized,
        L: ReplyLookup + ?Sized,
    {
        loop {
            let start = self.received;
            let end = start + self.remaining;
            let n = match reader.read(&mut self.phase_buffer()[start..end]) {
                Ok(0) => return Err(ReceiveError::Disconnected),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReceiveError::Io(e)),
            };
            self.received += n;
            self.remaining -= n;

            if self.remaining == 0 {
                let result = self.complete_phase(lookup);
                match result {
                    Ok(Some(reply)) => return Ok(Some(reply)),
                    Ok(None) => {}
                    Err(e) => {
                        self.reset();
                        return Err(e.into());
                    }
                }
            }
        }
    }

    fn complete_phase<L: ReplyLookup + ?Sized>(
        &mut self,
        lookup: &L,
    ) -> Result<Option<Reply>, ProtocolError> {
        match self.phase {
            RecvPhase::HeaderCommon => {
                let header = BasicHeader::from_wire(&self.pdu[..BasicHeader::SIZE])?;
                match header.command {
                    UsbIpCommand::RetSubmit | UsbIpCommand::RetUnlink => {
                        self.enter(RecvPhase::HeaderResidual, PDU_BODY_SIZE);
                        Ok(None)
                    }
                    other => Err(ProtocolError::UnknownCommand(other.to_wire())),
                }
            }
            RecvPhase::HeaderResidual => {
                let header = BasicHeader::from_wire(&self.pdu[..BasicHeader::SIZE])?;
                let body = &self.pdu[BasicHeader::SIZE..];
                if header.command == UsbIpCommand::RetUnlink {
                    let ret = RetUnlink::decode_body(header, body)?;
                    self.reset();
                    return Ok(Some(Reply::Unlink(ret)));
                }

                let ret = RetSubmit::decode_body(header, body)?;
                let shape = match lookup.reply_shape(ret.header.seqnum) {
                    Some(shape) => shape,
                    None => {
                        self.unmatched = true;
                        ReplyShape::unknown(&ret)
                    }
                };

                let payload_len = match shape.direction {
                    Direction::In => check_length(ret.actual_length, shape.buffer_len)?,
                    Direction::Out => 0,
                };
                self.iso_count = match shape.kind {
                    TransferKind::Isochronous => {
                        check_iso_count(ret.number_of_packets, shape.iso_packets)?
                    }
                    _ => 0,
                };
                self.ret = Some(ret);
                self.shape = Some(shape);

                if payload_len > 0 {
                    self.payload = vec![0; payload_len];
                    self.enter(RecvPhase::UrbBuffer, payload_len);
                    Ok(None)
                } else {
                    self.after_payload()
                }
            }
            RecvPhase::UrbBuffer => self.after_payload(),
            RecvPhase::IsocPacketDescriptors => {
                let iso = decode_iso_descriptors(&self.iso_raw, self.iso_count)?;
                let buffer_len = self.shape.map(|s| s.buffer_len).unwrap_or(0);
                check_iso_descriptors(&iso, buffer_len)?;
                Ok(self.finish_submit(iso))
            }
        }
    }

    fn after_payload(&mut self) -> Result<Option<Reply>, ProtocolError> {
        if self.iso_count > 0 {
            let size = self.iso_count * IsoPacketDescriptor::SIZE;
            self.iso_raw = vec![0; size];
            self.enter(RecvPhase::IsocPacketDescriptors, size);
            Ok(None)
        } else {
            Ok(self.finish_submit(Vec::new()))
        }
    }

    fn finish_submit(&mut self, iso: Vec<IsoPacketDescriptor>) -> Option<Reply> {
        let ret = self.ret.take()?;
        let payload = std::mem::take(&mut self.payload);
        let unmatched = self.unmatched;
        self.reset();
        Some(Reply::Submit {
            ret,
            payload,
            iso,
            unmatched,
        })
    }
}
