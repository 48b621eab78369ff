// Common test utilities and fakes for the printer transports

use async_trait::async_trait;
use mockall::mock;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tinyfax_printer::config::{HeartbeatConfig, NetworkPrinterConfig};
use tinyfax_printer::errors::{PrinterError, Result};
use tinyfax_printer::events::ConnectionEvent;
use tinyfax_printer::network::{BoxedStream, Dialer, NetworkPrinterConnection};
use tinyfax_printer::usb_bus::{
    EndpointDirection, HotplugEvent, UsbBus, UsbDeviceHandle, UsbDeviceInfo, UsbEndpoint, UsbInterface,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::broadcast;

#[allow(dead_code)]
pub const RETRY_DELAY: Duration = Duration::from_secs(15);

// =============================================================================
// Network fakes
// =============================================================================

/// Client side of an in-memory socket. Writes can be made to fail while
/// reads stay open, like a printer whose cable was pulled mid-session.
#[allow(dead_code)]
pub struct MockStream {
    inner: DuplexStream,
    fail_writes: Arc<AtomicBool>,
}

/// Printer side of a [`MockStream`].
#[allow(dead_code)]
pub struct MockPeer {
    pub socket: DuplexStream,
    fail_writes: Arc<AtomicBool>,
}

#[allow(dead_code)]
pub fn stream_pair() -> (MockStream, MockPeer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let fail_writes = Arc::new(AtomicBool::new(false));
    (
        MockStream {
            inner: client,
            fail_writes: fail_writes.clone(),
        },
        MockPeer {
            socket: server,
            fail_writes,
        },
    )
}

impl AsyncRead for MockStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fail_writes.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[allow(dead_code)]
impl MockPeer {
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Everything the client writes within `window`, stopping early at EOF.
    pub async fn received_within(&mut self, window: Duration) -> Vec<u8> {
        let mut received = Vec::new();
        let _ = tokio::time::timeout(window, async {
            let mut buf = [0u8; 1024];
            loop {
                match self.socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }
        })
        .await;
        received
    }
}

#[allow(dead_code)]
pub enum DialOutcome {
    Accept(MockStream),
    AcceptAfter(Duration, MockStream),
    Fail(io::ErrorKind),
}

/// Scripted dialer. Once the script runs out every dial is refused.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockDialer {
    script: Mutex<VecDeque<DialOutcome>>,
    dials: AtomicUsize,
}

#[allow(dead_code)]
impl MockDialer {
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(outcomes: Vec<DialOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, outcome: DialOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            Some(DialOutcome::Accept(stream)) => Ok(Box::new(stream)),
            Some(DialOutcome::AcceptAfter(delay, stream)) => {
                tokio::time::sleep(delay).await;
                Ok(Box::new(stream))
            }
            Some(DialOutcome::Fail(kind)) => Err(io::Error::from(kind)),
            None => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
        }
    }
}

/// Network transport with default heartbeat (5 s / 12 s) and 15 s retry.
#[allow(dead_code)]
pub fn network_printer(dialer: Arc<MockDialer>) -> NetworkPrinterConnection {
    NetworkPrinterConnection::new(
        NetworkPrinterConfig::new("192.168.1.87", 9100),
        &HeartbeatConfig::default(),
        RETRY_DELAY,
        dialer,
    )
}

/// Wait for the first event matching `pred`, skipping others.
#[allow(dead_code)]
pub async fn next_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    pred: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .expect("timed out waiting for event")
}

// =============================================================================
// USB fakes
// =============================================================================

#[allow(dead_code)]
pub fn usb_device(address: u8, vendor_id: u16, product_id: u16) -> UsbDeviceInfo {
    UsbDeviceInfo {
        bus_number: 1,
        address,
        vendor_id,
        product_id,
    }
}

/// A POS-8022 on bus 1, address 7.
#[allow(dead_code)]
pub fn pos_8022() -> UsbDeviceInfo {
    usb_device(7, 0x0483, 0x5743)
}

/// Interface 0 with a bulk IN 0x81 and bulk OUT 0x01 endpoint.
#[allow(dead_code)]
pub fn printer_interface() -> UsbInterface {
    UsbInterface {
        number: 0,
        endpoints: vec![
            UsbEndpoint {
                address: 0x81,
                direction: EndpointDirection::In,
            },
            UsbEndpoint {
                address: 0x01,
                direction: EndpointDirection::Out,
            },
        ],
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleCall {
    Detach(u8),
    Claim(u8),
    Write(u8, Vec<u8>),
    Release(u8),
    Attach(u8),
    Close,
}

#[allow(dead_code)]
pub type CallLog = Arc<Mutex<Vec<HandleCall>>>;

/// Recording device handle.
#[allow(dead_code)]
pub struct FakeHandle {
    pub interfaces: Vec<UsbInterface>,
    pub kernel_driver_active: bool,
    pub fail_detach: bool,
    pub fail_writes: bool,
    /// Blocks `claim_interface` to widen the connect window.
    pub claim_delay: Duration,
    calls: CallLog,
}

#[allow(dead_code)]
impl FakeHandle {
    pub fn printer() -> (Self, CallLog) {
        let calls = CallLog::default();
        (
            Self {
                interfaces: vec![printer_interface()],
                kernel_driver_active: false,
                fail_detach: false,
                fail_writes: false,
                claim_delay: Duration::ZERO,
                calls: calls.clone(),
            },
            calls,
        )
    }

    fn record(&self, call: HandleCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl UsbDeviceHandle for FakeHandle {
    fn interfaces(&self) -> Result<Vec<UsbInterface>> {
        Ok(self.interfaces.clone())
    }

    fn kernel_driver_active(&self, _interface: u8) -> Result<bool> {
        Ok(self.kernel_driver_active)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<()> {
        if self.fail_detach {
            return Err(PrinterError::Usb(rusb::Error::Access));
        }
        self.record(HandleCall::Detach(interface));
        self.kernel_driver_active = false;
        Ok(())
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<()> {
        self.record(HandleCall::Attach(interface));
        self.kernel_driver_active = true;
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<()> {
        std::thread::sleep(self.claim_delay);
        self.record(HandleCall::Claim(interface));
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<()> {
        self.record(HandleCall::Release(interface));
        Ok(())
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        if self.fail_writes {
            return Err(PrinterError::Usb(rusb::Error::Pipe));
        }
        self.record(HandleCall::Write(endpoint, data.to_vec()));
        Ok(data.len())
    }

    fn close(&mut self) {
        self.record(HandleCall::Close);
    }
}

mock! {
    pub Handle {}

    impl UsbDeviceHandle for Handle {
        fn interfaces(&self) -> Result<Vec<UsbInterface>>;
        fn kernel_driver_active(&self, interface: u8) -> Result<bool>;
        fn detach_kernel_driver(&mut self, interface: u8) -> Result<()>;
        fn attach_kernel_driver(&mut self, interface: u8) -> Result<()>;
        fn claim_interface(&mut self, interface: u8) -> Result<()>;
        fn release_interface(&mut self, interface: u8) -> Result<()>;
        fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;
        fn close(&mut self);
    }
}

/// In-memory bus: a device list, queued handles for `open`, and a hot-plug
/// stream driven by [`FakeUsbBus::attach`] / [`FakeUsbBus::detach`].
#[allow(dead_code)]
pub struct FakeUsbBus {
    devices: Mutex<Vec<UsbDeviceInfo>>,
    handles: Mutex<VecDeque<Box<dyn UsbDeviceHandle>>>,
    opened: Mutex<Vec<UsbDeviceInfo>>,
    hotplug: broadcast::Sender<HotplugEvent>,
}

#[allow(dead_code)]
impl FakeUsbBus {
    pub fn new(devices: Vec<UsbDeviceInfo>) -> Arc<Self> {
        let (hotplug, _) = broadcast::channel(16);
        Arc::new(Self {
            devices: Mutex::new(devices),
            handles: Mutex::new(VecDeque::new()),
            opened: Mutex::new(Vec::new()),
            hotplug,
        })
    }

    pub fn push_handle(&self, handle: impl UsbDeviceHandle + 'static) {
        self.handles.lock().unwrap().push_back(Box::new(handle));
    }

    pub fn opened(&self) -> Vec<UsbDeviceInfo> {
        self.opened.lock().unwrap().clone()
    }

    pub fn attach(&self, device: UsbDeviceInfo) {
        self.devices.lock().unwrap().push(device);
        let _ = self.hotplug.send(HotplugEvent::Arrived(device));
    }

    pub fn detach(&self, device: UsbDeviceInfo) {
        self.devices.lock().unwrap().retain(|d| !d.same_address(&device));
        let _ = self.hotplug.send(HotplugEvent::Left(device));
    }
}

impl UsbBus for FakeUsbBus {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn open(&self, device: &UsbDeviceInfo) -> Result<Box<dyn UsbDeviceHandle>> {
        self.opened.lock().unwrap().push(*device);
        self.handles
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(PrinterError::Usb(rusb::Error::NoDevice))
    }

    fn hotplug_events(&self) -> broadcast::Receiver<HotplugEvent> {
        self.hotplug.subscribe()
    }
}

/// Poll `condition` on real time until it holds or two seconds pass.
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[allow(dead_code)]
pub fn calls(log: &CallLog) -> Vec<HandleCall> {
    log.lock().unwrap().clone()
}
