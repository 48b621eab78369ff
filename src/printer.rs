use crate::config::DaemonConfig;
use crate::events::{ConnectionEvent, TransportKind, EVENT_CHANNEL_CAPACITY};
use crate::network::NetworkPrinterConnection;
use crate::status::ConnectionState;
use crate::usb::UsbPrinterConnection;
use crate::usb_bus::UsbBus;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Fans print jobs out to every healthy transport and tracks how many are up.
///
/// USB is always present; the network transport only exists when a host is
/// configured. The connected count is republished on every
/// connect/disconnect/error/timeout event of either transport.
pub struct PrinterManager {
    shared: Arc<Shared>,
    aggregators: Vec<JoinHandle<()>>,
}

struct Shared {
    network: Option<NetworkPrinterConnection>,
    usb: UsbPrinterConnection,
    count: watch::Sender<usize>,
    count_changes: broadcast::Sender<usize>,
}

impl Shared {
    fn connected_count(&self) -> usize {
        let network = self
            .network
            .as_ref()
            .map_or(false, |network| network.state().is_usable());
        usize::from(network) + usize::from(self.usb.state().is_usable())
    }

    fn refresh(&self) {
        let count = self.connected_count();
        let changed = self.count.send_if_modified(|current| {
            if *current == count {
                return false;
            }
            *current = count;
            true
        });
        if changed {
            info!("Connected printers: {}", count);
        }
        // No subscribers is fine
        let _ = self.count_changes.send(count);
    }
}

impl PrinterManager {
    /// Build both transports from config. Must run inside a Tokio runtime.
    pub fn new(config: &DaemonConfig, bus: Arc<dyn UsbBus>) -> Self {
        info!("Initializing printer...");
        let network = NetworkPrinterConnection::from_config(config);
        match &network {
            Some(network) => info!("Network printer configured at {}", network.address()),
            None => info!("No network printer configured, using USB only"),
        }
        let usb = UsbPrinterConnection::with_default_profiles(bus, &config.usb);
        Self::with_transports(network, usb)
    }

    pub fn with_transports(network: Option<NetworkPrinterConnection>, usb: UsbPrinterConnection) -> Self {
        let (count, _) = watch::channel(0);
        let (count_changes, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        // Subscribe before anything can connect
        let mut receivers = vec![(TransportKind::Usb, usb.subscribe())];
        if let Some(network) = &network {
            receivers.push((TransportKind::Network, network.subscribe()));
        }

        let shared = Arc::new(Shared {
            network,
            usb,
            count,
            count_changes,
        });
        shared.refresh();

        let aggregators = receivers
            .into_iter()
            .map(|(kind, events)| tokio::spawn(aggregate(shared.clone(), kind, events)))
            .collect();

        Self { shared, aggregators }
    }

    /// Connect every configured transport concurrently and wait for all of
    /// them. One failing never stops the other.
    pub async fn connect(&self) {
        let network = async {
            if let Some(network) = &self.shared.network {
                if let Err(e) = network.connect().await {
                    warn!("Network printer not connected: {}", e);
                }
            }
        };
        let usb = async {
            if let Err(e) = self.shared.usb.connect().await {
                warn!("USB printer not connected: {}", e);
            }
        };
        tokio::join!(network, usb);
        self.shared.refresh();
    }

    pub async fn disconnect(&self) {
        if let Some(network) = &self.shared.network {
            network.disconnect().await;
            info!("Disconnected from printer.");
        }
        if self.shared.usb.state().is_busy() {
            self.shared.usb.disconnect().await;
            info!("Disconnected from USB printer.");
        } else {
            debug!("USB printer not connected, nothing to disconnect");
        }
        self.shared.refresh();
    }

    /// Drop every session and connect again.
    pub async fn reconnect(&self) {
        info!("Reconnecting to printers...");
        self.disconnect().await;
        self.connect().await;
    }

    /// Send an already-encoded payload to every connected transport.
    /// Transports that are not connected are skipped.
    pub fn broadcast_print(&self, payload: &[u8]) {
        if self.none_connected() {
            error!("Cannot print, no printer is connected.");
            return;
        }

        if let Some(network) = &self.shared.network {
            if network.state().is_usable() {
                network.print(payload);
            }
        }
        if self.shared.usb.state().is_usable() {
            self.shared.usb.print(payload);
        }
    }

    pub fn connected_count(&self) -> usize {
        self.shared.connected_count()
    }

    pub fn any_connected(&self) -> bool {
        self.connected_count() > 0
    }

    pub fn none_connected(&self) -> bool {
        self.connected_count() == 0
    }

    /// Count published after every connectivity event, changed or not.
    pub fn subscribe_count(&self) -> broadcast::Receiver<usize> {
        self.shared.count_changes.subscribe()
    }

    /// Latest count; wakes only when it changes.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.shared.count.subscribe()
    }

    /// State of one transport, `None` for an unconfigured network printer.
    pub fn state_of(&self, kind: TransportKind) -> Option<ConnectionState> {
        match kind {
            TransportKind::Network => self.shared.network.as_ref().map(|n| n.state()),
            TransportKind::Usb => Some(self.shared.usb.state()),
        }
    }

    pub fn network(&self) -> Option<&NetworkPrinterConnection> {
        self.shared.network.as_ref()
    }

    pub fn usb(&self) -> &UsbPrinterConnection {
        &self.shared.usb
    }
}

impl Drop for PrinterManager {
    fn drop(&mut self) {
        for task in &self.aggregators {
            task.abort();
        }
    }
}

async fn aggregate(shared: Arc<Shared>, kind: TransportKind, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) if event.affects_connectivity() => {
                debug!("{} printer event: {:?}", kind, event);
                shared.refresh();
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} {} printer events, recounting", missed, kind);
                shared.refresh();
            }
            Err(RecvError::Closed) => return,
        }
    }
}
