use crate::errors::PrinterError;
use crate::status::ReportedPrinterStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Capacity of every per-transport event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Network,
    Usb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Network => f.write_str("Network"),
            TransportKind::Usb => f.write_str("USB"),
        }
    }
}

/// Lifecycle notifications published by a printer transport.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    /// `expected` is true only for a requested `disconnect()`.
    Disconnected { expected: bool },
    Error(Arc<PrinterError>),
    /// Network only: connect attempt timed out.
    Timeout,
    /// Network only: raw inbound bytes.
    Data(Vec<u8>),
    /// Network only: decoded reply to a status poll.
    Status(ReportedPrinterStatus),
}

impl ConnectionEvent {
    /// Events after which the manager recomputes its connected count.
    pub fn affects_connectivity(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Connected
                | ConnectionEvent::Disconnected { .. }
                | ConnectionEvent::Error(_)
                | ConnectionEvent::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamAction {
    Connect,
    Disconnect,
}

/// Turns a stream of printer counts into upstream session actions.
///
/// Only the 0 → n and n → 0 edges produce an action; a transport
/// reconnecting while another one stays up leaves the upstream alone.
#[derive(Debug, Default)]
pub struct UpstreamGate {
    last_count: usize,
}

impl UpstreamGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, count: usize) -> Option<UpstreamAction> {
        let previous = std::mem::replace(&mut self.last_count, count);
        match (previous, count) {
            (0, n) if n > 0 => Some(UpstreamAction::Connect),
            (p, 0) if p > 0 => Some(UpstreamAction::Disconnect),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_only_fires_on_edges() {
        let mut gate = UpstreamGate::new();
        assert_eq!(gate.observe(0), None);
        assert_eq!(gate.observe(1), Some(UpstreamAction::Connect));
        assert_eq!(gate.observe(2), None);
        // network drops and comes back while USB stays up
        assert_eq!(gate.observe(1), None);
        assert_eq!(gate.observe(2), None);
        assert_eq!(gate.observe(1), None);
        assert_eq!(gate.observe(0), Some(UpstreamAction::Disconnect));
        assert_eq!(gate.observe(0), None);
    }

    #[test]
    fn test_data_does_not_affect_connectivity() {
        assert!(!ConnectionEvent::Data(vec![0x12]).affects_connectivity());
        assert!(ConnectionEvent::Timeout.affects_connectivity());
        assert!(ConnectionEvent::Disconnected { expected: true }.affects_connectivity());
    }
}
