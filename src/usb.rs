use crate::config::UsbConfig;
use crate::errors::{PrinterError, Result};
use crate::events::{ConnectionEvent, TransportKind, EVENT_CHANNEL_CAPACITY};
use crate::profiles::{find_profile, PrinterProfile, DEVICE_PROFILES};
use crate::status::ConnectionState;
use crate::usb_bus::{EndpointDirection, HotplugEvent, UsbBus, UsbDeviceHandle, UsbDeviceInfo};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type SharedHandle = Arc<Mutex<Box<dyn UsbDeviceHandle>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the current USB session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbSessionInfo {
    pub device: UsbDeviceInfo,
    pub profile: PrinterProfile,
    pub interface: u8,
    pub out_endpoint: u8,
    pub in_endpoint: Option<u8>,
    pub kernel_driver_detached: bool,
}

/// Result of the blocking connect sequence.
struct ClaimedPrinter {
    info: UsbSessionInfo,
    handle: Box<dyn UsbDeviceHandle>,
}

struct UsbSession {
    epoch: u64,
    info: UsbSessionInfo,
    handle: SharedHandle,
    payloads: mpsc::UnboundedSender<Vec<u8>>,
    writer_task: JoinHandle<()>,
    /// Transfer errors are reported only while this is set.
    error_listener: Arc<AtomicBool>,
}

impl UsbSession {
    /// Release the interface, give the kernel driver back if we took it,
    /// close the device. Every step runs even if an earlier one failed.
    async fn close(self) {
        let UsbSession {
            info,
            handle,
            payloads,
            writer_task,
            error_listener,
            ..
        } = self;

        error_listener.store(false, Ordering::SeqCst);
        drop(payloads);
        writer_task.abort();

        let released = tokio::task::spawn_blocking(move || {
            release_device(&handle, info.interface, info.kernel_driver_detached)
        })
        .await;
        if let Err(e) = released {
            error!("USB teardown task failed: {}", e);
        }
    }
}

fn release_device(handle: &SharedHandle, interface: u8, kernel_driver_detached: bool) {
    let mut handle = lock(handle);
    if let Err(e) = handle.release_interface(interface) {
        error!("Could not release interface: {}", e);
    }
    if kernel_driver_detached {
        info!("Re-attaching kernel driver...");
        if let Err(e) = handle.attach_kernel_driver(interface) {
            error!("Could not re-attach kernel driver: {}", e);
        }
    }
    handle.close();
}

/// Every attached device is checked against the profile table and each
/// match replaces the previous one, so the last matching device in
/// enumeration order wins.
fn find_printer(bus: &dyn UsbBus, profiles: &[PrinterProfile]) -> Result<Option<(UsbDeviceInfo, PrinterProfile)>> {
    let mut found = None;
    for device in bus.devices()? {
        if let Some(profile) = find_profile(profiles, device.vendor_id, device.product_id) {
            debug!("USB device {} matches profile {}", device, profile.name);
            found = Some((device, profile.clone()));
        }
    }
    Ok(found)
}

/// Blocking connect sequence: find, open, pick interface, detach kernel
/// driver, claim, pick endpoints. A failure after open closes the device.
fn claim_printer(bus: &dyn UsbBus, profiles: &[PrinterProfile]) -> Result<ClaimedPrinter> {
    let (device, profile) = find_printer(bus, profiles)?.ok_or(PrinterError::NoMatchingDevice)?;
    info!("Found USB printer {} at {}", profile.name, device);

    let mut handle = bus.open(&device)?;
    match claim_interface(handle.as_mut(), &profile) {
        Ok((interface, out_endpoint, in_endpoint, kernel_driver_detached)) => Ok(ClaimedPrinter {
            info: UsbSessionInfo {
                device,
                profile,
                interface,
                out_endpoint,
                in_endpoint,
                kernel_driver_detached,
            },
            handle,
        }),
        Err(e) => {
            handle.close();
            Err(e)
        }
    }
}

fn claim_interface(
    handle: &mut dyn UsbDeviceHandle,
    profile: &PrinterProfile,
) -> Result<(u8, u8, Option<u8>, bool)> {
    let interface = handle
        .interfaces()?
        .into_iter()
        .nth(usize::from(profile.interface_index))
        .ok_or(PrinterError::NoInterface)?;

    let mut kernel_driver_detached = false;
    if handle.kernel_driver_active(interface.number)? {
        info!("Detaching kernel driver...");
        handle
            .detach_kernel_driver(interface.number)
            .map_err(|e| match e {
                PrinterError::Usb(cause) => PrinterError::KernelDriver(cause),
                other => other,
            })?;
        kernel_driver_detached = true;
    }

    handle.claim_interface(interface.number)?;

    let first = |direction: EndpointDirection| {
        interface
            .endpoints
            .iter()
            .find(|ep| ep.direction == direction)
            .map(|ep| ep.address)
    };
    let out_endpoint = first(EndpointDirection::Out).ok_or(PrinterError::NoOutEndpoint)?;
    let in_endpoint = first(EndpointDirection::In);

    Ok((interface.number, out_endpoint, in_endpoint, kernel_driver_detached))
}

/// Owns the session with one USB receipt printer.
///
/// Reacts to hot-plug: a matching printer showing up triggers a connect, the
/// held printer going away runs the same teardown as `disconnect()`.
/// Construct inside a Tokio runtime; the hot-plug watcher is spawned here.
#[derive(Clone)]
pub struct UsbPrinterConnection {
    inner: Arc<Inner>,
}

struct Inner {
    bus: Arc<dyn UsbBus>,
    profiles: Arc<[PrinterProfile]>,
    write_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    session: Mutex<Option<UsbSession>>,
    /// Devices that left while the current attempt was still claiming.
    departed: Mutex<Vec<UsbDeviceInfo>>,
    hotplug_task: Mutex<Option<JoinHandle<()>>>,
}

impl UsbPrinterConnection {
    pub fn new(bus: Arc<dyn UsbBus>, profiles: Vec<PrinterProfile>, config: &UsbConfig) -> Self {
        // Subscribe before anything can connect so no detach is missed
        let hotplug = bus.hotplug_events();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            bus,
            profiles: profiles.into(),
            write_timeout: config.write_timeout(),
            state,
            epoch: AtomicU64::new(0),
            events,
            session: Mutex::new(None),
            departed: Mutex::new(Vec::new()),
            hotplug_task: Mutex::new(None),
        });

        let task = tokio::spawn(watch_hotplug(Arc::downgrade(&inner), hotplug));
        *lock(&inner.hotplug_task) = Some(task);

        Self { inner }
    }

    /// Connection using the compiled-in profile table.
    pub fn with_default_profiles(bus: Arc<dyn UsbBus>, config: &UsbConfig) -> Self {
        Self::new(bus, DEVICE_PROFILES.to_vec(), config)
    }

    pub fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn session_info(&self) -> Option<UsbSessionInfo> {
        lock(&self.inner.session).as_ref().map(|s| s.info.clone())
    }

    /// Find and claim a printer. Failures leave the transport in `Error`
    /// and are returned as well as published.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.inner.teardown(true).await
    }

    /// Queue `payload` as a single bulk transfer to the OUT endpoint.
    pub fn print(&self, payload: &[u8]) {
        let session = lock(&self.inner.session);
        let Some(session) = session.as_ref() else {
            error!("No endpoint to use for printing.");
            return;
        };

        if session.payloads.send(payload.to_vec()).is_err() {
            warn!("USB transfer task stopped, dropping {} bytes", payload.len());
            return;
        }
        debug!(
            "Queued {} bytes for USB endpoint {:#04x}",
            payload.len(),
            session.info.out_endpoint
        );
    }
}

impl Inner {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut epoch = 0;
        let started = self.state.send_if_modified(|state| {
            if state.is_busy() {
                return false;
            }
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            lock(&self.departed).clear();
            *state = ConnectionState::Connecting;
            true
        });
        if !started {
            info!("Already connected to USB printer.");
            return Ok(());
        }

        let bus = self.bus.clone();
        let profiles = self.profiles.clone();
        let claimed = tokio::task::spawn_blocking(move || claim_printer(bus.as_ref(), &profiles))
            .await
            .map_err(PrinterError::from)
            .and_then(|claimed| claimed);

        match claimed {
            Ok(claimed) => self.start_session(epoch, claimed).await,
            Err(e) => Err(self.fail_connect(epoch, e)),
        }
    }

    async fn start_session(self: &Arc<Self>, epoch: u64, claimed: ClaimedPrinter) -> Result<()> {
        let ClaimedPrinter { info, handle } = claimed;
        let handle: SharedHandle = Arc::new(Mutex::new(handle));
        let error_listener = Arc::new(AtomicBool::new(true));
        let (payloads, payloads_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(transfer_loop(
            Arc::downgrade(self),
            handle.clone(),
            info.out_endpoint,
            self.write_timeout,
            error_listener.clone(),
            payloads_rx,
        ));
        let summary = format!("{} at {}", info.profile.name, info.device);

        let mut pending = Some(UsbSession {
            epoch,
            info,
            handle,
            payloads,
            writer_task,
            error_listener,
        });

        // Installed under the state lock, which `on_detach` also holds.
        let mut removed = false;
        self.state.send_if_modified(|state| {
            if self.current_epoch() != epoch || *state != ConnectionState::Connecting {
                return false;
            }
            let device = pending.as_ref().map(|s| s.info.device);
            if device.map_or(false, |d| lock(&self.departed).iter().any(|gone| gone.same_address(&d))) {
                removed = true;
                self.epoch.fetch_add(1, Ordering::SeqCst);
                *state = ConnectionState::Disconnected;
                return true;
            }
            *lock(&self.session) = pending.take();
            *state = ConnectionState::Connected;
            true
        });
        if let Some(stale) = pending {
            stale.close().await;
            if removed {
                warn!("USB printer {} was removed while connecting", summary);
                self.emit(ConnectionEvent::Disconnected { expected: false });
                return Err(PrinterError::ConnectionClosed("USB printer removed during connect".to_string()));
            }
            return Err(PrinterError::ConnectionClosed("USB connect superseded".to_string()));
        }

        info!("Connected to USB printer {}", summary);
        self.emit(ConnectionEvent::Connected);
        Ok(())
    }

    fn fail_connect(&self, epoch: u64, err: PrinterError) -> PrinterError {
        let applied = self.state.send_if_modified(|state| {
            if self.current_epoch() != epoch || *state != ConnectionState::Connecting {
                return false;
            }
            *state = ConnectionState::Error;
            true
        });
        if !applied {
            debug!("USB connect attempt was superseded: {}", err);
            return PrinterError::ConnectionClosed("USB connect superseded".to_string());
        }

        error!("USB printer connect failed: {}", err);
        self.emit(ConnectionEvent::Error(Arc::new(err.duplicate())));
        err
    }

    /// Shared by `disconnect()` (`expected`) and hot-plug removal.
    async fn teardown(&self, expected: bool) {
        let session = lock(&self.session).take();
        let Some(session) = session else {
            let cancelled = self.state.send_if_modified(|state| {
                if *state != ConnectionState::Connecting {
                    return false;
                }
                self.epoch.fetch_add(1, Ordering::SeqCst);
                *state = ConnectionState::Disconnected;
                true
            });
            if cancelled {
                info!("Cancelled pending USB connect");
                self.emit(ConnectionEvent::Disconnected { expected });
            } else {
                error!("No device to disconnect.");
            }
            return;
        };

        info!("Disconnecting from USB printer...");
        self.state.send_modify(|state| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *state = ConnectionState::Disconnected;
        });
        session.close().await;
        info!("Disconnected from USB printer");
        self.emit(ConnectionEvent::Disconnected { expected });
    }

    async fn on_attach(self: &Arc<Self>, device: UsbDeviceInfo) {
        let Some(profile) = find_profile(&self.profiles, device.vendor_id, device.product_id) else {
            return;
        };
        info!("Matching printer profile found ({}). Reconnecting...", profile.name);
        if let Err(e) = self.connect().await {
            debug!("Reconnect after attach of {} failed: {}", device, e);
        }
    }

    async fn on_detach(&self, device: UsbDeviceInfo) {
        let mut held = false;
        self.state.send_if_modified(|state| {
            held = lock(&self.session)
                .as_ref()
                .map_or(false, |s| s.info.device.same_address(&device));
            if !held && *state == ConnectionState::Connecting {
                lock(&self.departed).push(device);
            }
            false
        });
        if held {
            warn!("USB printer {} was removed", device);
            self.teardown(false).await;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.hotplug_task).take() {
            task.abort();
        }
        // Dropping the handle closes the device
        if let Some(session) = lock(&self.session).take() {
            session.writer_task.abort();
        }
    }
}

async fn watch_hotplug(inner: Weak<Inner>, mut events: broadcast::Receiver<HotplugEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} USB hot-plug events", missed);
                continue;
            }
            Err(RecvError::Closed) => {
                debug!("USB hot-plug stream closed");
                return;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            HotplugEvent::Arrived(device) => inner.on_attach(device).await,
            HotplugEvent::Left(device) => inner.on_detach(device).await,
        }
    }
}

/// Serial bulk writer: one transfer per queued payload, in queue order.
async fn transfer_loop(
    inner: Weak<Inner>,
    handle: SharedHandle,
    endpoint: u8,
    timeout: Duration,
    error_listener: Arc<AtomicBool>,
    mut payloads: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(payload) = payloads.recv().await {
        let len = payload.len();
        let handle = handle.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut handle = lock(&handle);
            handle.write_bulk(endpoint, &payload, timeout)
        })
        .await
        .map_err(PrinterError::from)
        .and_then(|written| written);

        match result {
            Ok(written) if written == len => debug!("Transferred {} bytes to USB printer", written),
            Ok(written) => warn!("USB printer accepted {} of {} bytes", written, len),
            Err(e) => {
                if !error_listener.load(Ordering::SeqCst) {
                    return;
                }
                error!("Error during transfer: {}", e);
                if let Some(inner) = inner.upgrade() {
                    inner.emit(ConnectionEvent::Error(Arc::new(e)));
                }
            }
        }
    }
}
