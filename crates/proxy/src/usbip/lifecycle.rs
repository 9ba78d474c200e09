//! Request bookkeeping for one USB/IP session
//!
//! Every outstanding request is tracked by its [`UrbHandle`] and sits in
//! exactly one of three ordered lists:
//!
//! ```text
//! queue ─> pending ─(written)─> in_flight ─(reply parsed)─> landed ─(reaped)─> freed
//!             │                     │
//!             └──(cancel)───────────┴──(unlink reply / teardown)──> landed
//! ```
//!
//! A request taken off `pending` or `in_flight` for completion is in the
//! `Completing` state until its result has been written into the URB and
//! [`RequestTable::land`] is called. Only the thread that took it off a list
//! may land it, so no request can be completed twice.
//!
//! The table itself does no I/O and holds no URB lock; the caller guards it
//! with a single mutex.

use super::receiver::ReplyShape;
use crate::error::{ProxyError, Result};
use crate::urb::{Urb, UrbHandle};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, Weak};
use tracing::{debug, trace};

/// Replies completed through an unlink whose RET_SUBMIT may still arrive
const MAX_ORPHANS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    PendingSend,
    InFlight,
    Completing,
    Landed,
}

/// Wire-level description of a queued request, captured at queue time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubmitInfo {
    pub shape: ReplyShape,
    pub endpoint: u8,
    pub short_ok: bool,
    pub interval: u32,
}

#[derive(Debug)]
struct TrackedRequest {
    tag: u32,
    info: SubmitInfo,
    state: EntryState,
    /// Tag of the CMD_UNLINK sent for this request
    unlink_tag: Option<u32>,
    cancelled: bool,
    /// Waited for by a synchronous control operation, not reaped
    sync: bool,
    /// The synchronous waiter gave up; free on landing
    abandoned: bool,
    urb: Weak<Mutex<Urb>>,
}

/// Work queued for the I/O thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Submit(UrbHandle),
    Unlink { tag: u32, target: u32 },
}

/// Next thing the I/O thread must write
#[derive(Debug)]
pub(crate) enum Outgoing {
    Submit {
        handle: UrbHandle,
        tag: u32,
        info: SubmitInfo,
        urb: Weak<Mutex<Urb>>,
    },
    Unlink {
        tag: u32,
        target: u32,
    },
}

/// A request removed from its list for completion
#[derive(Debug)]
pub(crate) struct Completion {
    pub handle: UrbHandle,
    pub tag: u32,
    pub info: SubmitInfo,
    pub urb: Weak<Mutex<Urb>>,
}

/// Result of a cancel request
#[derive(Debug)]
pub(crate) enum CancelAction {
    /// Already completed or already being unlinked
    Nothing,
    /// A CMD_UNLINK was queued with this tag
    Unlink(u32),
    /// Never sent; complete locally as cancelled
    Local(Completion),
}

#[derive(Debug)]
pub(crate) struct RequestTable {
    entries: HashMap<UrbHandle, TrackedRequest>,
    pending: VecDeque<PendingOp>,
    in_flight: Vec<UrbHandle>,
    landed: VecDeque<UrbHandle>,
    /// Shapes of requests completed by an unlink, by submit tag
    orphans: HashMap<u32, ReplyShape>,
    orphan_order: VecDeque<u32>,
    next_tag: u32,
    next_handle: u64,
    detached: bool,
    wakeup: bool,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        Self::with_first_tag(1)
    }

    /// Start tag numbering at `first` (zero is still never issued)
    pub(crate) fn with_first_tag(first: u32) -> Self {
        Self {
            entries: HashMap::new(),
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            landed: VecDeque::new(),
            orphans: HashMap::new(),
            orphan_order: VecDeque::new(),
            next_tag: first.wrapping_sub(1),
            next_handle: 0,
            detached: false,
            wakeup: false,
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }

    fn tag_in_use(&self, tag: u32) -> bool {
        self.entries
            .values()
            .any(|e| e.tag == tag || e.unlink_tag == Some(tag))
            || self.orphans.contains_key(&tag)
    }

    /// Next sequence tag: never zero, never one still outstanding
    pub(crate) fn alloc_tag(&mut self) -> u32 {
        loop {
            self.next_tag = self.next_tag.wrapping_add(1);
            if self.next_tag != 0 && !self.tag_in_use(self.next_tag) {
                return self.next_tag;
            }
        }
    }

    /// Track a new request and queue it for sending
    pub(crate) fn submit(
        &mut self,
        info: SubmitInfo,
        urb: Weak<Mutex<Urb>>,
        sync: bool,
    ) -> Result<(UrbHandle, u32)> {
        if self.detached {
            return Err(ProxyError::Detached);
        }
        let tag = self.alloc_tag();
        self.next_handle += 1;
        let handle = UrbHandle(self.next_handle);
        self.entries.insert(
            handle,
            TrackedRequest {
                tag,
                info,
                state: EntryState::PendingSend,
                unlink_tag: None,
                cancelled: false,
                sync,
                abandoned: false,
                urb,
            },
        );
        self.pending.push_back(PendingOp::Submit(handle));
        trace!(%handle, tag, "queued");
        Ok((handle, tag))
    }

    fn completion(&mut self, handle: UrbHandle) -> Option<Completion> {
        let entry = self.entries.get_mut(&handle)?;
        entry.state = EntryState::Completing;
        Some(Completion {
            handle,
            tag: entry.tag,
            info: entry.info,
            urb: entry.urb.clone(),
        })
    }

    /// Cancel a queued request
    pub(crate) fn cancel(&mut self, handle: UrbHandle) -> Result<CancelAction> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(ProxyError::UnknownHandle(handle))?;

        match entry.state {
            EntryState::PendingSend => {
                entry.cancelled = true;
                self.pending.retain(|op| *op != PendingOp::Submit(handle));
                debug!(%handle, "cancelled before sending");
                Ok(self
                    .completion(handle)
                    .map_or(CancelAction::Nothing, CancelAction::Local))
            }
            EntryState::InFlight if entry.unlink_tag.is_none() => {
                entry.cancelled = true;
                let target = entry.tag;
                let tag = self.alloc_tag();
                if let Some(entry) = self.entries.get_mut(&handle) {
                    entry.unlink_tag = Some(tag);
                }
                self.pending.push_back(PendingOp::Unlink { tag, target });
                debug!(%handle, target, unlink = tag, "unlink queued");
                Ok(CancelAction::Unlink(tag))
            }
            _ => Ok(CancelAction::Nothing),
        }
    }

    /// Take the next operation to write
    ///
    /// A submit moves to `in_flight` before it is written, so a cancel racing
    /// with the write sees it in flight and unlinks it. Unlinks whose target
    /// has meanwhile completed are dropped.
    pub(crate) fn next_outgoing(&mut self) -> Option<Outgoing> {
        while let Some(op) = self.pending.pop_front() {
            match op {
                PendingOp::Submit(handle) => {
                    let Some(entry) = self.entries.get_mut(&handle) else {
                        continue;
                    };
                    entry.state = EntryState::InFlight;
                    self.in_flight.push(handle);
                    return Some(Outgoing::Submit {
                        handle,
                        tag: entry.tag,
                        info: entry.info,
                        urb: entry.urb.clone(),
                    });
                }
                PendingOp::Unlink { tag, target } => {
                    let live = self.in_flight.iter().any(|h| {
                        self.entries
                            .get(h)
                            .is_some_and(|e| e.unlink_tag == Some(tag))
                    });
                    if live {
                        return Some(Outgoing::Unlink { tag, target });
                    }
                    trace!(tag, target, "unlink no longer needed");
                }
            }
        }
        None
    }

    fn find_in_flight(&self, pred: impl Fn(&TrackedRequest) -> bool) -> Option<usize> {
        self.in_flight
            .iter()
            .position(|h| self.entries.get(h).is_some_and(&pred))
    }

    /// Shape of the request a RET_SUBMIT with `tag` belongs to
    pub(crate) fn reply_shape(&self, tag: u32) -> Option<ReplyShape> {
        match self.find_in_flight(|e| e.tag == tag) {
            Some(index) => self
                .entries
                .get(&self.in_flight[index])
                .map(|e| e.info.shape),
            None => self.orphans.get(&tag).copied(),
        }
    }

    /// Remove the in-flight request a RET_SUBMIT answers
    pub(crate) fn take_in_flight(&mut self, tag: u32) -> Option<Completion> {
        let index = self.find_in_flight(|e| e.tag == tag)?;
        let handle = self.in_flight.remove(index);
        self.completion(handle)
    }

    /// Remove the in-flight request a RET_UNLINK answers
    ///
    /// The target completes as cancelled. Its tag is remembered so a late
    /// RET_SUBMIT can still be parsed and dropped.
    pub(crate) fn take_unlinked(&mut self, unlink_tag: u32) -> Option<Completion> {
        let index = self.find_in_flight(|e| e.unlink_tag == Some(unlink_tag))?;
        let handle = self.in_flight.remove(index);
        let completion = self.completion(handle)?;
        self.remember_orphan(completion.tag, completion.info.shape);
        Some(completion)
    }

    /// Remove an in-flight request whose submit could not be written
    pub(crate) fn take_failed(&mut self, handle: UrbHandle) -> Option<Completion> {
        let index = self.in_flight.iter().position(|h| *h == handle)?;
        self.in_flight.remove(index);
        self.completion(handle)
    }

    fn remember_orphan(&mut self, tag: u32, shape: ReplyShape) {
        if self.orphan_order.len() >= MAX_ORPHANS {
            if let Some(old) = self.orphan_order.pop_front() {
                self.orphans.remove(&old);
            }
        }
        self.orphans.insert(tag, shape);
        self.orphan_order.push_back(tag);
    }

    /// Forget the orphan entry once its late RET_SUBMIT has been consumed
    pub(crate) fn forget_orphan(&mut self, tag: u32) -> bool {
        if self.orphans.remove(&tag).is_some() {
            self.orphan_order.retain(|t| *t != tag);
            true
        } else {
            false
        }
    }

    /// Mark the session detached and take every request still outstanding
    pub(crate) fn detach_all(&mut self) -> Vec<Completion> {
        self.detached = true;
        let mut handles: Vec<UrbHandle> = self
            .pending
            .drain(..)
            .filter_map(|op| match op {
                PendingOp::Submit(handle) => Some(handle),
                PendingOp::Unlink { .. } => None,
            })
            .collect();
        handles.append(&mut self.in_flight);
        self.orphans.clear();
        self.orphan_order.clear();
        handles
            .into_iter()
            .filter_map(|h| self.completion(h))
            .collect()
    }

    /// Make a completed request reapable
    pub(crate) fn land(&mut self, handle: UrbHandle) {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return;
        };
        debug_assert_eq!(entry.state, EntryState::Completing);
        if entry.abandoned {
            trace!(%handle, "abandoned request freed");
            self.entries.remove(&handle);
            return;
        }
        entry.state = EntryState::Landed;
        trace!(%handle, cancelled = entry.cancelled, "landed");
        self.landed.push_back(handle);
    }

    /// Whether a request landed and was flagged cancelled before completing
    #[cfg(test)]
    fn was_cancelled(&self, handle: UrbHandle) -> bool {
        self.entries.get(&handle).is_some_and(|e| e.cancelled)
    }

    pub(crate) fn has_reapable(&self) -> bool {
        self.landed
            .iter()
            .any(|h| self.entries.get(h).is_some_and(|e| !e.sync))
    }

    /// Remove and return the oldest landed request that is not a synchronous one
    pub(crate) fn pop_landed(&mut self) -> Option<(UrbHandle, Weak<Mutex<Urb>>)> {
        let index = self
            .landed
            .iter()
            .position(|h| self.entries.get(h).is_some_and(|e| !e.sync))?;
        let handle = self.landed.remove(index)?;
        let entry = self.entries.remove(&handle)?;
        Some((handle, entry.urb))
    }

    pub(crate) fn is_landed(&self, handle: UrbHandle) -> bool {
        self.entries
            .get(&handle)
            .is_some_and(|e| e.state == EntryState::Landed)
    }

    /// Free a landed synchronous request
    pub(crate) fn take_landed(&mut self, handle: UrbHandle) -> bool {
        if !self.is_landed(handle) {
            return false;
        }
        self.landed.retain(|h| *h != handle);
        self.entries.remove(&handle);
        true
    }

    /// The synchronous waiter gave up on `handle`
    pub(crate) fn abandon(&mut self, handle: UrbHandle) {
        if self.take_landed(handle) {
            return;
        }
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.abandoned = true;
        }
    }

    pub(crate) fn request_wakeup(&mut self) {
        self.wakeup = true;
    }

    pub(crate) fn wakeup_requested(&self) -> bool {
        self.wakeup
    }

    pub(crate) fn take_wakeup(&mut self) -> bool {
        std::mem::take(&mut self.wakeup)
    }

    #[cfg(test)]
    fn state(&self, handle: UrbHandle) -> Option<EntryState> {
        self.entries.get(&handle).map(|e| e.state)
    }

    /// Requests tracked in any state
    pub(crate) fn outstanding(&self) -> usize {
        self.entries.len()
    }

    /// Every entry is in exactly the list its state names
    #[cfg(test)]
    fn check_invariants(&self) {
        let pending: Vec<UrbHandle> = self
            .pending
            .iter()
            .filter_map(|op| match op {
                PendingOp::Submit(h) => Some(*h),
                PendingOp::Unlink { .. } => None,
            })
            .collect();
        for (handle, entry) in &self.entries {
            let in_pending = pending.iter().filter(|h| *h == handle).count();
            let in_flight = self.in_flight.iter().filter(|h| *h == handle).count();
            let in_landed = self.landed.iter().filter(|h| *h == handle).count();
            let expected = match entry.state {
                EntryState::PendingSend => (1, 0, 0),
                EntryState::InFlight => (0, 1, 0),
                EntryState::Landed => (0, 0, 1),
                EntryState::Completing => (0, 0, 0),
            };
            assert_eq!(
                (in_pending, in_flight, in_landed),
                expected,
                "{} in {:?}",
                handle,
                entry.state
            );
        }
    }
}
