// =============================================================================
// Connection State
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single printer transport.
///
/// `Idle → Connecting → Connected → {Disconnected, Error, Timeout}`, and any
/// of the last three may go back to `Connecting` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
    Timeout,
}

impl ConnectionState {
    /// A transport accepts print jobs only while connected.
    pub fn is_usable(self) -> bool {
        self == ConnectionState::Connected
    }

    /// `connect()` is a no-op in these states.
    pub fn is_busy(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
            ConnectionState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Hardware Status (DLE EOT 1 response parsing)
// =============================================================================

/// Real-time status request sent on every heartbeat tick: DLE EOT 1.
pub const STATUS_POLL_COMMAND: [u8; 3] = [0x10, 0x04, 0x01];

/// Fixed bits of a DLE EOT response: bits 1 and 4 set, bits 0 and 7 clear.
const FIXED_BITS_MASK: u8 = 0x93;
const FIXED_BITS_VALUE: u8 = 0x12;

const OFFLINE_BIT: u8 = 0x08;
const WAITING_FOR_RECOVERY_BIT: u8 = 0x20;

/// Printer status decoded from a DLE EOT 1 response byte.
///
/// Response layout (1 byte):
///   bit 3 = offline (inverted into `online`)
///   bit 5 = waiting for online recovery
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportedPrinterStatus {
    pub online: bool,
    pub waiting_for_online_recovery: bool,
}

impl ReportedPrinterStatus {
    pub fn from_status_byte(byte: u8) -> Self {
        Self {
            online: (byte & OFFLINE_BIT) == 0,
            waiting_for_online_recovery: (byte & WAITING_FOR_RECOVERY_BIT) != 0,
        }
    }

    /// Whether `byte` carries the fixed bit pattern of a DLE EOT reply.
    /// Inbound chunks that don't start with one are not decoded.
    pub fn is_status_byte(byte: u8) -> bool {
        (byte & FIXED_BITS_MASK) == FIXED_BITS_VALUE
    }

    /// Decode the first byte of an inbound chunk, if it looks like a status reply.
    pub fn from_chunk(chunk: &[u8]) -> Option<Self> {
        chunk
            .first()
            .copied()
            .filter(|b| Self::is_status_byte(*b))
            .map(Self::from_status_byte)
    }
}
