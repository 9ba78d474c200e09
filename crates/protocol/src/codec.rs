//! PDU assembly and isochronous descriptor validation
//!
//! A submit request or reply is a fixed 48-byte PDU optionally followed by a
//! payload and an isochronous descriptor array:
//!
//! ```text
//! [CMD_SUBMIT][OUT payload][iso descriptors]
//! [RET_SUBMIT][IN payload ][iso descriptors]
//! ```
//!
//! Nothing read from the wire is trusted: every length and offset is
//! checked against the real destination buffer before it is used.

use crate::error::{ProtocolError, Result};
use crate::messages::{CmdSubmit, IsoPacketDescriptor, RetSubmit};
use bytes::{BufMut, Bytes, BytesMut};

/// Largest transfer buffer accepted in either direction (16 MiB)
pub const MAX_TRANSFER_SIZE: usize = 16 * 1024 * 1024;

/// Largest isochronous packet count accepted (`USBIP_MAX_ISO_PACKETS`)
pub const MAX_ISO_PACKETS: usize = 1024;

/// Encode a CMD_SUBMIT with its OUT payload and isochronous descriptors
pub fn encode_submit(cmd: &CmdSubmit, payload: &[u8], iso: &[IsoPacketDescriptor]) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(CmdSubmit::SIZE + payload.len() + iso.len() * IsoPacketDescriptor::SIZE);
    cmd.encode(&mut buf);
    buf.put_slice(payload);
    for desc in iso {
        desc.encode(&mut buf);
    }
    buf.freeze()
}

/// Encode a RET_SUBMIT with its IN payload and isochronous descriptors
pub fn encode_ret_submit(ret: &RetSubmit, payload: &[u8], iso: &[IsoPacketDescriptor]) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(RetSubmit::SIZE + payload.len() + iso.len() * IsoPacketDescriptor::SIZE);
    ret.encode(&mut buf);
    buf.put_slice(payload);
    for desc in iso {
        desc.encode(&mut buf);
    }
    buf.freeze()
}

/// Validate a wire-supplied payload length against the destination capacity
pub fn check_length(length: u32, capacity: usize) -> Result<usize> {
    let length = length as usize;
    if length > capacity || length > MAX_TRANSFER_SIZE {
        return Err(ProtocolError::LengthOutOfRange {
            length,
            capacity: capacity.min(MAX_TRANSFER_SIZE),
        });
    }
    Ok(length)
}

/// Validate a wire-supplied isochronous packet count against what was submitted
pub fn check_iso_count(count: u32, submitted: usize) -> Result<usize> {
    let count = count as usize;
    let max = submitted.min(MAX_ISO_PACKETS);
    if count > max {
        return Err(ProtocolError::TooManyIsoPackets { count, max });
    }
    Ok(count)
}

/// Decode `count` consecutive isochronous descriptors
pub fn decode_iso_descriptors(buf: &[u8], count: usize) -> Result<Vec<IsoPacketDescriptor>> {
    let needed = count * IsoPacketDescriptor::SIZE;
    if buf.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    buf[..needed]
        .chunks_exact(IsoPacketDescriptor::SIZE)
        .map(IsoPacketDescriptor::from_wire)
        .collect()
}

/// Every descriptor must lie inside a buffer of `buffer_len` bytes
///
/// `offset + length` must not pass the end of the buffer and the actual
/// length must not exceed the packet length. Out-of-range descriptors are a
/// protocol error, never truncated.
pub fn check_iso_descriptors(descs: &[IsoPacketDescriptor], buffer_len: usize) -> Result<()> {
    for (index, desc) in descs.iter().enumerate() {
        let end = (desc.offset as usize).checked_add(desc.length as usize);
        let in_range = matches!(end, Some(end) if end <= buffer_len);
        if !in_range || desc.actual_length > desc.length {
            return Err(ProtocolError::IsoDescriptorOutOfRange {
                index,
                offset: desc.offset,
                length: desc.length,
                actual_length: desc.actual_length,
                buffer_len,
            });
        }
    }
    Ok(())
}

/// Move a packed isochronous IN payload to each packet's offset
///
/// The stub sends only the `actual_length` bytes of each packet, back to
/// back. `buf` holds that packed data at its start; afterwards each packet's
/// data sits at its descriptor's offset.
///
/// Every packet must fit inside `buf` as it is now, which may be shorter than
/// the length the descriptors were first checked against. A packet that does
/// not fit is an error and `buf` is left untouched. Returns `Ok(false)`, also
/// leaving `buf` untouched, when the packed sizes do not add up to
/// `packed_len`; the payload is then taken as already laid out.
pub fn spread_iso_payload(
    buf: &mut [u8],
    packed_len: usize,
    descs: &[IsoPacketDescriptor],
) -> Result<bool> {
    let mut total = 0usize;
    let mut ascending = true;
    let mut prev_end = 0usize;
    for (index, desc) in descs.iter().enumerate() {
        let start = desc.offset as usize;
        let end = match start.checked_add(desc.actual_length as usize) {
            Some(end) if end <= buf.len() => end,
            _ => {
                return Err(ProtocolError::IsoDescriptorOutOfRange {
                    index,
                    offset: desc.offset,
                    length: desc.length,
                    actual_length: desc.actual_length,
                    buffer_len: buf.len(),
                });
            }
        };
        ascending &= start >= prev_end;
        prev_end = end;
        total += desc.actual_length as usize;
    }
    if total != packed_len || packed_len > buf.len() {
        return Ok(false);
    }

    if ascending {
        // Walk backwards so no packet overwrites packed data not yet moved.
        let mut src_end = packed_len;
        for desc in descs.iter().rev() {
            let src = src_end - desc.actual_length as usize;
            buf.copy_within(src..src_end, desc.offset as usize);
            src_end = src;
        }
    } else {
        let packed = buf[..packed_len].to_vec();
        let mut src = 0;
        for desc in descs {
            let len = desc.actual_length as usize;
            let dst = desc.offset as usize;
            buf[dst..dst + len].copy_from_slice(&packed[src..src + len]);
            src += len;
        }
    }
    Ok(true)
}
