//! The request (URB) shared between the virtual controller and a backend
//!
//! The virtual controller owns every [`Urb`]; a backend only keeps a weak
//! reference while the request is outstanding and writes the result back
//! into it before the request becomes reapable.

use protocol::{Direction, SetupPacket, TransferKind, UrbStatus};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A request shared with the backend
pub type SharedUrb = Arc<Mutex<Urb>>;

/// Opaque handle naming one queued request
///
/// Returned by [`crate::UsbProxyBackend::queue`] and accepted by
/// [`crate::UsbProxyBackend::cancel`]. Handles are never reused within a
/// backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UrbHandle(pub(crate) u64);

impl fmt::Display for UrbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One isochronous packet of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    /// Offset of the packet in the data buffer
    pub offset: u32,
    /// Packet length
    pub length: u32,
    /// Bytes transferred (set on completion)
    pub actual_length: u32,
    /// Packet status (set on completion)
    pub status: UrbStatus,
}

impl IsoPacket {
    pub fn new(offset: u32, length: u32) -> Self {
        Self {
            offset,
            length,
            actual_length: 0,
            status: UrbStatus::NotResponding,
        }
    }
}

/// A USB request block
///
/// For [`TransferKind::Control`] and [`TransferKind::Msg`] the data buffer
/// starts with the 8-byte setup packet; the data stage follows it.
#[derive(Debug, Clone)]
pub struct Urb {
    /// Endpoint number (0..=15, without the direction bit)
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    /// Short transfers are acceptable (clears `SHORT_NOT_OK` on the wire)
    pub short_ok: bool,
    /// Polling interval for interrupt and isochronous endpoints
    pub interval: u32,
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
    /// Completion status
    pub status: UrbStatus,
    /// Bytes transferred in the data stage
    pub actual_length: usize,
}

impl Urb {
    pub fn new(endpoint: u8, direction: Direction, kind: TransferKind, data: Vec<u8>) -> Self {
        Self {
            endpoint,
            direction,
            kind,
            short_ok: true,
            interval: 0,
            data,
            iso_packets: Vec::new(),
            status: UrbStatus::NotResponding,
            actual_length: 0,
        }
    }

    /// Control transfer on endpoint 0 with room for `data_len` bytes after the setup packet
    pub fn control(setup: SetupPacket, data_len: usize) -> Self {
        let mut data = setup.to_bytes().to_vec();
        data.resize(SetupPacket::SIZE + data_len, 0);
        Self::new(0, setup.direction(), TransferKind::Msg, data)
    }

    pub fn bulk_in(endpoint: u8, len: usize) -> Self {
        Self::new(endpoint, Direction::In, TransferKind::Bulk, vec![0; len])
    }

    pub fn bulk_out(endpoint: u8, data: Vec<u8>) -> Self {
        Self::new(endpoint, Direction::Out, TransferKind::Bulk, data)
    }

    pub fn interrupt_in(endpoint: u8, len: usize, interval: u32) -> Self {
        let mut urb = Self::new(endpoint, Direction::In, TransferKind::Interrupt, vec![0; len]);
        urb.interval = interval;
        urb
    }

    /// Isochronous transfer with back-to-back packets of the given lengths
    pub fn isochronous(endpoint: u8, direction: Direction, packet_lengths: &[u32]) -> Self {
        let mut offset = 0u32;
        let iso_packets = packet_lengths
            .iter()
            .map(|&len| {
                let packet = IsoPacket::new(offset, len);
                offset = offset.saturating_add(len);
                packet
            })
            .collect();
        let mut urb = Self::new(
            endpoint,
            direction,
            TransferKind::Isochronous,
            vec![0; offset as usize],
        );
        urb.iso_packets = iso_packets;
        urb.interval = 1;
        urb
    }

    /// Offset of the data stage in [`Self::data`]
    pub fn data_offset(&self) -> usize {
        if self.kind.has_setup() {
            SetupPacket::SIZE
        } else {
            0
        }
    }

    /// Length of the data stage
    pub fn data_len(&self) -> usize {
        self.data.len().saturating_sub(self.data_offset())
    }

    /// The setup packet of a control transfer
    pub fn setup(&self) -> Option<SetupPacket> {
        if !self.kind.has_setup() {
            return None;
        }
        let bytes: [u8; SetupPacket::SIZE] = self.data.get(..SetupPacket::SIZE)?.try_into().ok()?;
        Some(SetupPacket::from_bytes(bytes))
    }

    /// The data stage
    pub fn payload(&self) -> &[u8] {
        &self.data[self.data_offset().min(self.data.len())..]
    }

    /// Bytes actually transferred in the data stage
    pub fn transferred(&self) -> &[u8] {
        let payload = self.payload();
        &payload[..self.actual_length.min(payload.len())]
    }

    pub fn into_shared(self) -> SharedUrb {
        Arc::new(Mutex::new(self))
    }
}

/// Lock a shared request, ignoring poisoning
pub fn lock_urb(urb: &Mutex<Urb>) -> MutexGuard<'_, Urb> {
    urb.lock().unwrap_or_else(PoisonError::into_inner)
}
