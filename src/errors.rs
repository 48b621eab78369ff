use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrinterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("No known USB printers found")]
    NoMatchingDevice,

    #[error("No interfaces found on printer")]
    NoInterface,

    #[error("Could not detach kernel driver: {0}")]
    KernelDriver(rusb::Error),

    #[error("Could not find OUT endpoint on printer interface")]
    NoOutEndpoint,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Connection timeout")]
    ConnectTimeout,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PrinterError {
    /// Connect failures after which the network transport schedules its own
    /// retry. Everything else needs an operator or a fresh `connect()`.
    pub fn is_retryable(&self) -> bool {
        match self {
            PrinterError::ConnectTimeout => true,
            PrinterError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    pub fn is_connection_refused(&self) -> bool {
        matches!(self, PrinterError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused)
    }

    /// Copy of this error for publishing on an event channel while the
    /// original is returned to the caller. Keeps the variant, and with it
    /// the retry classification.
    pub fn duplicate(&self) -> PrinterError {
        match self {
            PrinterError::Config(msg) => PrinterError::Config(msg.clone()),
            PrinterError::Io(e) => PrinterError::Io(io::Error::new(e.kind(), e.to_string())),
            PrinterError::Usb(e) => PrinterError::Usb(*e),
            PrinterError::NoMatchingDevice => PrinterError::NoMatchingDevice,
            PrinterError::NoInterface => PrinterError::NoInterface,
            PrinterError::KernelDriver(e) => PrinterError::KernelDriver(*e),
            PrinterError::NoOutEndpoint => PrinterError::NoOutEndpoint,
            PrinterError::ConnectionClosed(msg) => PrinterError::ConnectionClosed(msg.clone()),
            PrinterError::ConnectTimeout => PrinterError::ConnectTimeout,
            PrinterError::Task(_) | PrinterError::Json(_) | PrinterError::Other(_) => {
                PrinterError::Other(anyhow::anyhow!(self.to_string()))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PrinterError>;
