//! USB/IP transport
//!
//! Imports one device from a remote `usbipd` and proxies every request to it
//! over TCP. Requests are tagged with a sequence number, written by a
//! dedicated I/O thread, and matched with their replies by that number.
//!
//! # Architecture
//!
//! ```text
//! caller threads                     I/O thread ("usbip-<busid>")
//!   queue() ──> pending ──wake──>    write CMD_SUBMIT / CMD_UNLINK
//!   cancel() ─> pending ──wake──>          │
//!                                    poll(socket, eventfd)
//!                                          │
//!   reap() <── landed <──────────    parse RET_SUBMIT / RET_UNLINK
//! ```

mod handshake;
mod lifecycle;
mod receiver;
mod session;
mod wake;

use crate::address::UsbIpAddress;
use crate::backend::UsbProxyBackend;
use crate::config::TransportConfig;
use crate::error::{ProxyError, Result};
use crate::urb::{SharedUrb, Urb, UrbHandle, lock_urb};
use lifecycle::{CancelAction, RequestTable};
use protocol::{DeviceSpeed, ExportedDevice, SetupPacket, UrbStatus, request};
use session::{EventLoop, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A device imported from a USB/IP server
pub struct UsbIpProxy {
    address: UsbIpAddress,
    device: ExportedDevice,
    shared: Arc<Shared>,
    control_timeout: Duration,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl UsbIpProxy {
    /// The server's description of the imported device
    pub fn device(&self) -> &ExportedDevice {
        &self.device
    }

    pub fn speed(&self) -> DeviceSpeed {
        DeviceSpeed::from_wire(self.device.speed)
    }

    pub fn address(&self) -> &UsbIpAddress {
        &self.address
    }

    /// Whether the connection is gone
    pub fn is_detached(&self) -> bool {
        self.shared.lock().is_detached()
    }

    fn submit(&self, urb: &SharedUrb, sync: bool) -> Result<(UrbHandle, u32)> {
        if self.io_thread.lock().unwrap_or_else(PoisonError::into_inner).is_none() {
            return Err(ProxyError::NotOpen);
        }
        let info = session::submit_info(&lock_urb(urb)).map_err(ProxyError::InvalidRequest)?;
        let queued = self.shared.lock().submit(info, Arc::downgrade(urb), sync)?;
        self.shared.wake.signal();
        Ok(queued)
    }

    fn apply_cancel(&self, action: CancelAction) {
        match action {
            CancelAction::Local(completion) => {
                self.shared.complete_with(completion, UrbStatus::Cancelled)
            }
            CancelAction::Unlink(_) => self.shared.wake.signal(),
            CancelAction::Nothing => {}
        }
    }

    /// Send a control request with no data stage and wait for it
    fn control(&self, setup: SetupPacket) -> Result<()> {
        let urb = Urb::control(setup, 0).into_shared();
        let (handle, tag) = self.submit(&urb, true)?;
        debug!(tag, request = setup.request, value = setup.value, index = setup.index, "control request");

        let deadline = Instant::now() + self.control_timeout;
        let mut table = self.shared.lock();
        loop {
            if table.take_landed(handle) {
                let detached = table.is_detached();
                drop(table);
                let status = lock_urb(&urb).status;
                return match status {
                    UrbStatus::Ok => Ok(()),
                    UrbStatus::NotResponding if detached => Err(ProxyError::Detached),
                    other => Err(ProxyError::TransferFailed(other)),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            table = self
                .shared
                .landed
                .wait_timeout(table, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        warn!(tag, "control request timed out after {:?}, cancelling", self.control_timeout);
        table.abandon(handle);
        let action = table.cancel(handle);
        drop(table);
        if let Ok(action) = action {
            self.apply_cancel(action);
        }
        Err(ProxyError::Timeout(self.control_timeout))
    }

    fn pop_reapable(table: &mut MutexGuard<'_, RequestTable>) -> Option<SharedUrb> {
        while let Some((handle, urb)) = table.pop_landed() {
            match urb.upgrade() {
                Some(urb) => return Some(urb),
                None => debug!(%handle, "landed request already dropped by its owner"),
            }
        }
        None
    }
}

impl UsbProxyBackend for UsbIpProxy {
    fn open(address: &str, config: &TransportConfig) -> Result<Self> {
        let address: UsbIpAddress = address.parse()?;
        let mut stream = handshake::connect(&address, config.connect_timeout())?;
        let device = handshake::import(&mut stream, &address.busid, config.connect_timeout())?;
        stream.set_nodelay(config.tcp_nodelay)?;
        stream.set_nonblocking(true)?;

        info!(
            "Imported {} ({:04x}:{:04x}, {:?} speed, devid {:#010x})",
            address,
            device.id_vendor,
            device.id_product,
            DeviceSpeed::from_wire(device.speed),
            device.devid()
        );

        let shared = Arc::new(Shared::new()?);
        let event_loop = EventLoop::new(stream, Arc::clone(&shared), device.devid(), config.write_timeout());
        let io_thread = thread::Builder::new()
            .name(format!("usbip-{}", address.busid))
            .spawn(move || event_loop.run())?;

        Ok(Self {
            address,
            device,
            shared,
            control_timeout: config.control_timeout(),
            io_thread: Mutex::new(Some(io_thread)),
        })
    }

    fn close(&self) {
        let io_thread = self
            .io_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(io_thread) = io_thread else {
            return;
        };
        let outstanding = self.shared.lock().outstanding();
        debug!("closing {} with {} requests outstanding", self.address, outstanding);
        self.shared.request_shutdown();
        if io_thread.join().is_err() {
            error!("I/O thread for {} panicked", self.address);
            self.shared.teardown();
        }
        info!("Closed {}", self.address);
    }

    fn reset(&self) -> Result<()> {
        self.control(SetupPacket {
            request_type: 0x23,
            request: request::SET_FEATURE,
            value: request::PORT_RESET,
            index: 0,
            length: 0,
        })
    }

    fn set_configuration(&self, value: u8) -> Result<()> {
        self.control(SetupPacket {
            request_type: 0x00,
            request: request::SET_CONFIGURATION,
            value: u16::from(value),
            index: 0,
            length: 0,
        })
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        debug!(interface, "claim_interface: handled by the server");
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        debug!(interface, "release_interface: handled by the server");
        Ok(())
    }

    fn set_interface(&self, interface: u8, alternate: u8) -> Result<()> {
        self.control(SetupPacket {
            request_type: 0x01,
            request: request::SET_INTERFACE,
            value: u16::from(alternate),
            index: u16::from(interface),
            length: 0,
        })
    }

    fn clear_halted_endpoint(&self, endpoint: u8) -> Result<()> {
        self.control(SetupPacket {
            request_type: 0x02,
            request: request::CLEAR_FEATURE,
            value: request::ENDPOINT_HALT,
            index: u16::from(endpoint),
            length: 0,
        })
    }

    fn queue(&self, urb: &SharedUrb) -> Result<UrbHandle> {
        self.submit(urb, false).map(|(handle, _)| handle)
    }

    fn cancel(&self, handle: UrbHandle) -> Result<()> {
        let action = self.shared.lock().cancel(handle)?;
        self.apply_cancel(action);
        Ok(())
    }

    fn reap(&self, timeout: Option<Duration>) -> Option<SharedUrb> {
        let mut table = self.shared.lock();
        if let Some(urb) = Self::pop_reapable(&mut table) {
            return Some(urb);
        }

        let idle = |t: &mut RequestTable| !t.has_reapable() && !t.wakeup_requested();
        table = match timeout {
            Some(Duration::ZERO) => return None,
            Some(timeout) => {
                self.shared
                    .landed
                    .wait_timeout_while(table, timeout, idle)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .shared
                .landed
                .wait_while(table, idle)
                .unwrap_or_else(PoisonError::into_inner),
        };
        if table.take_wakeup() {
            debug!("reap interrupted by wakeup");
        }
        Self::pop_reapable(&mut table)
    }

    fn wakeup(&self) {
        self.shared.lock().request_wakeup();
        self.shared.landed.notify_all();
    }
}

impl Drop for UsbIpProxy {
    fn drop(&mut self) {
        self.close();
    }
}
