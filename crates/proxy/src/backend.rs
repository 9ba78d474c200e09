//! The contract every proxy transport implements
//!
//! The virtual USB core drives a device through this trait without knowing
//! which transport carries the requests. Requests are queued and complete
//! asynchronously; the core collects completions with [`UsbProxyBackend::reap`].
//!
//! # Example
//!
//! ```no_run
//! use proxy::{TransportConfig, Urb, UsbIpProxy, UsbProxyBackend};
//! use std::time::Duration;
//!
//! let backend = UsbIpProxy::open("usbip://10.0.0.2:1-1.4", &TransportConfig::default())?;
//! backend.set_configuration(1)?;
//!
//! let urb = Urb::bulk_in(1, 512).into_shared();
//! backend.queue(&urb)?;
//! if let Some(done) = backend.reap(Some(Duration::from_secs(1))) {
//!     println!("{:?}", done.lock().unwrap().status);
//! }
//! backend.close();
//! # Ok::<(), proxy::ProxyError>(())
//! ```

use crate::config::TransportConfig;
use crate::error::Result;
use crate::urb::{SharedUrb, UrbHandle};
use std::time::Duration;

/// A transport that proxies USB requests to a real device
///
/// All operations except `open` take `&self`: submission, cancellation and
/// reaping may happen from different threads at once.
pub trait UsbProxyBackend: Send + Sync {
    /// Connect to the device named by `address`
    fn open(address: &str, config: &TransportConfig) -> Result<Self>
    where
        Self: Sized;

    /// Disconnect; outstanding requests complete with `NotResponding`
    fn close(&self);

    /// Reset the device (synchronous)
    fn reset(&self) -> Result<()>;

    /// SET_CONFIGURATION (synchronous)
    fn set_configuration(&self, value: u8) -> Result<()>;

    fn claim_interface(&self, interface: u8) -> Result<()>;

    fn release_interface(&self, interface: u8) -> Result<()>;

    /// SET_INTERFACE (synchronous)
    fn set_interface(&self, interface: u8, alternate: u8) -> Result<()>;

    /// CLEAR_FEATURE(ENDPOINT_HALT) for an endpoint address (direction bit included)
    fn clear_halted_endpoint(&self, endpoint: u8) -> Result<()>;

    /// Queue a request; never blocks on the transport
    fn queue(&self, urb: &SharedUrb) -> Result<UrbHandle>;

    /// Ask for a queued request to be cancelled
    ///
    /// Fire-and-forget: the request is still reaped exactly once, with
    /// `Cancelled` status or whatever status it completed with first.
    fn cancel(&self, handle: UrbHandle) -> Result<()>;

    /// Take the oldest completed request
    ///
    /// Waits up to `timeout` when nothing has completed yet; `None` waits
    /// indefinitely and `Some(Duration::ZERO)` never waits. Returns `None`
    /// on timeout or when interrupted by [`Self::wakeup`].
    fn reap(&self, timeout: Option<Duration>) -> Option<SharedUrb>;

    /// Interrupt a `reap` that is waiting
    fn wakeup(&self);
}
