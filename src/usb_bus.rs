//! USB access for the printer connection.
//!
//! [`UsbBus`] is the process-level capability handed to
//! `UsbPrinterConnection`: device enumeration, opening, and the shared
//! hot-plug event stream. [`RusbBus`] implements it on libusb; tests provide
//! their own.

use crate::config::UsbConfig;
use crate::errors::{PrinterError, Result};
use crate::events::EVENT_CHANNEL_CAPACITY;
use rusb::{Context, Device, DeviceHandle, Direction, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Identity of an attached USB device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbDeviceInfo {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbDeviceInfo {
    /// Same physical slot on the bus. Vendor/product ids may be unreadable
    /// once a device is gone, so only bus and address are compared.
    pub fn same_address(&self, other: &UsbDeviceInfo) -> bool {
        self.bus_number == other.bus_number && self.address == other.address
    }
}

impl fmt::Display for UsbDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {:03} address {:03})",
            self.vendor_id, self.product_id, self.bus_number, self.address
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbEndpoint {
    pub address: u8,
    pub direction: EndpointDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbInterface {
    pub number: u8,
    pub endpoints: Vec<UsbEndpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived(UsbDeviceInfo),
    Left(UsbDeviceInfo),
}

/// An opened USB device. All calls block.
pub trait UsbDeviceHandle: Send {
    /// Interfaces of the active configuration, first alternate setting each.
    fn interfaces(&self) -> Result<Vec<UsbInterface>>;
    fn kernel_driver_active(&self, interface: u8) -> Result<bool>;
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<()>;
    fn attach_kernel_driver(&mut self, interface: u8) -> Result<()>;
    fn claim_interface(&mut self, interface: u8) -> Result<()>;
    fn release_interface(&mut self, interface: u8) -> Result<()>;
    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;
    /// Close the device. Later calls fail.
    fn close(&mut self);
}

pub trait UsbBus: Send + Sync {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>>;
    fn open(&self, device: &UsbDeviceInfo) -> Result<Box<dyn UsbDeviceHandle>>;
    fn hotplug_events(&self) -> broadcast::Receiver<HotplugEvent>;
}

// =============================================================================
// libusb backend
// =============================================================================

/// libusb-backed bus with a background thread pumping hot-plug callbacks.
///
/// Create one per process: every subscriber shares the same stream.
pub struct RusbBus {
    context: Context,
    events: broadcast::Sender<HotplugEvent>,
    registration: Mutex<Option<Registration<Context>>>,
    running: Arc<AtomicBool>,
    event_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

struct HotplugForwarder {
    events: broadcast::Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        let info = device_info(&device);
        debug!("USB device attached: {}", info);
        let _ = self.events.send(HotplugEvent::Arrived(info));
    }

    fn device_left(&mut self, device: Device<Context>) {
        let info = device_info(&device);
        debug!("USB device detached: {}", info);
        let _ = self.events.send(HotplugEvent::Left(info));
    }
}

fn device_info<T: UsbContext>(device: &Device<T>) -> UsbDeviceInfo {
    let (vendor_id, product_id) = device
        .device_descriptor()
        .map(|desc| (desc.vendor_id(), desc.product_id()))
        .unwrap_or((0, 0));
    UsbDeviceInfo {
        bus_number: device.bus_number(),
        address: device.address(),
        vendor_id,
        product_id,
    }
}

impl RusbBus {
    pub fn new(config: &UsbConfig) -> Result<Self> {
        info!("Initializing USB context");
        let context = Context::new().map_err(|e| {
            error!("Failed to initialize USB context: {}", e);
            PrinterError::Usb(e)
        })?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));

        let registration = if rusb::has_hotplug() {
            let callback: Box<dyn Hotplug<Context>> = Box::new(HotplugForwarder {
                events: events.clone(),
            });
            Some(
                HotplugBuilder::new()
                    .enumerate(false)
                    .register(context.clone(), callback)?,
            )
        } else {
            warn!("libusb has no hot-plug support here; USB printers are only found on connect");
            None
        };

        let event_thread = if registration.is_some() {
            let context = context.clone();
            let running = running.clone();
            let poll = config.hotplug_poll();
            let handle = thread::Builder::new()
                .name("usb-hotplug".to_string())
                .spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        if let Err(e) = context.handle_events(Some(poll)) {
                            warn!("USB event handling failed: {}", e);
                            thread::sleep(poll);
                        }
                    }
                    debug!("USB hot-plug thread stopped");
                })?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            context,
            events,
            registration: Mutex::new(registration),
            running,
            event_thread: Mutex::new(event_thread),
        })
    }
}

impl UsbBus for RusbBus {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        Ok(self.context.devices()?.iter().map(|d| device_info(&d)).collect())
    }

    fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbDeviceHandle>> {
        let device = self
            .context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == info.bus_number && d.address() == info.address)
            .ok_or(PrinterError::Usb(rusb::Error::NoDevice))?;

        let handle = device.open().map_err(|e| {
            if e == rusb::Error::Access {
                warn!(
                    "USB access denied for {}. Check udev rules or run with access to /dev/bus/usb.",
                    info
                );
            }
            PrinterError::Usb(e)
        })?;

        Ok(Box::new(RusbHandle {
            device,
            handle: Some(handle),
        }))
    }

    fn hotplug_events(&self) -> broadcast::Receiver<HotplugEvent> {
        self.events.subscribe()
    }
}

impl Drop for RusbBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Deregistering wakes the event thread out of handle_events
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let thread = self
            .event_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("USB hot-plug thread panicked");
            }
        }
    }
}

struct RusbHandle {
    device: Device<Context>,
    handle: Option<DeviceHandle<Context>>,
}

impl RusbHandle {
    fn handle(&self) -> Result<&DeviceHandle<Context>> {
        self.handle.as_ref().ok_or(PrinterError::Usb(rusb::Error::NoDevice))
    }

    fn handle_mut(&mut self) -> Result<&mut DeviceHandle<Context>> {
        self.handle.as_mut().ok_or(PrinterError::Usb(rusb::Error::NoDevice))
    }
}

impl UsbDeviceHandle for RusbHandle {
    fn interfaces(&self) -> Result<Vec<UsbInterface>> {
        let config = self.device.active_config_descriptor()?;
        let interfaces = config
            .interfaces()
            .filter_map(|interface| interface.descriptors().next())
            .map(|desc| UsbInterface {
                number: desc.interface_number(),
                endpoints: desc
                    .endpoint_descriptors()
                    .map(|ep| UsbEndpoint {
                        address: ep.address(),
                        direction: match ep.direction() {
                            Direction::In => EndpointDirection::In,
                            Direction::Out => EndpointDirection::Out,
                        },
                    })
                    .collect(),
            })
            .collect();
        Ok(interfaces)
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        match self.handle()?.kernel_driver_active(interface) {
            Ok(active) => Ok(active),
            // macOS / Windows: no kernel driver concept in libusb
            Err(rusb::Error::NotSupported) => Ok(false),
            Err(e) => Err(PrinterError::Usb(e)),
        }
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<()> {
        Ok(self.handle_mut()?.detach_kernel_driver(interface)?)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<()> {
        Ok(self.handle_mut()?.attach_kernel_driver(interface)?)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<()> {
        self.handle_mut()?.claim_interface(interface).map_err(|e| {
            if e == rusb::Error::Access || e == rusb::Error::Busy {
                warn!("Cannot claim USB interface: {} (another driver may be active)", e);
            }
            PrinterError::Usb(e)
        })
    }

    fn release_interface(&mut self, interface: u8) -> Result<()> {
        Ok(self.handle_mut()?.release_interface(interface)?)
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle()?.write_bulk(endpoint, data, timeout)?)
    }

    fn close(&mut self) {
        // Dropping the libusb handle closes the device
        self.handle.take();
    }
}
