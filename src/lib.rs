//! Receipt printer connection layer for TinyFax.
//!
//! Keeps a network printer (raw TCP, DLE EOT liveness polling) and a USB
//! printer (profile matching, hot-plug) connected, and fans already-encoded
//! ESC/POS payloads out to whichever of them is up.

pub mod config;
pub mod errors;
pub mod events;
pub mod heartbeat;
pub mod network;
pub mod printer;
pub mod profiles;
pub mod status;
pub mod usb;
pub mod usb_bus;

pub use config::DaemonConfig;
pub use errors::{PrinterError, Result};
pub use events::{ConnectionEvent, TransportKind, UpstreamAction, UpstreamGate};
pub use network::NetworkPrinterConnection;
pub use printer::PrinterManager;
pub use status::{ConnectionState, ReportedPrinterStatus};
pub use usb::UsbPrinterConnection;
pub use usb_bus::{RusbBus, UsbBus};
