//! USB device proxy backends
//!
//! A virtual USB controller hands requests ([`Urb`]s) to a
//! [`UsbProxyBackend`], which forwards them to a real device and reports
//! their completion asynchronously. [`UsbIpProxy`] is the USB/IP transport:
//! it imports a device exported by a remote `usbipd` and tunnels every
//! request over TCP.

pub mod address;
pub mod backend;
pub mod config;
pub mod error;
pub mod urb;
pub mod usbip;

pub use address::{DEFAULT_PORT, UsbIpAddress};
pub use backend::UsbProxyBackend;
pub use config::{DeviceConfig, ProxyConfig, TransportConfig};
pub use error::{ProxyError, Result};
pub use urb::{IsoPacket, SharedUrb, Urb, UrbHandle, lock_urb};
pub use usbip::UsbIpProxy;
