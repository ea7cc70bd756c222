//! Device I/O backends
//!
//! The registry talks to devices through the [`DeviceBackend`] trait: a
//! closed set of implementations selected at construction, either the real
//! libusb-backed [`RusbBackend`] or the scripted [`MockBackend`] used by
//! tests. Backends run on the blocking USB worker thread and never touch
//! async code.

use common::{DeviceRecord, OpenError, UrbOutcome};
use protocol::{BusId, DeviceSpeed, Direction, ExportedDevice, SubmitCmd, status};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Device change reported by a backend
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// Device connected
    Arrived(DeviceRecord),
    /// Device disconnected
    Left(BusId),
}

/// The opaque device-I/O collaborator
///
/// `submit` returns `None` when the transfer will never resolve; the async
/// side's operation timeout is the only bound on such transfers.
pub trait DeviceBackend: Send {
    /// Enumerate currently attached devices
    fn enumerate(&mut self) -> Vec<DeviceRecord>;

    /// Open a device for exclusive export (detaching kernel drivers)
    fn open(&mut self, busid: &BusId) -> Result<(), OpenError>;

    /// Close a previously opened device; reports whether it was open
    fn close(&mut self, busid: &BusId) -> bool;

    /// Execute one URB synchronously against an open device
    fn submit(&mut self, busid: &BusId, cmd: &SubmitCmd) -> Option<UrbOutcome>;

    /// Wait up to `timeout` for device change events
    fn poll_events(&mut self, timeout: Duration) -> Vec<BackendEvent>;
}

/// Map a rusb error onto the wire status a Linux usbip client expects
pub(crate) fn map_rusb_error(error: rusb::Error) -> i32 {
    match error {
        rusb::Error::Timeout => status::TIMEOUT,
        rusb::Error::Pipe => status::PIPE,
        rusb::Error::NoDevice => status::DEVICE_GONE,
        rusb::Error::NotFound => status::NOT_FOUND,
        rusb::Error::Busy => status::DEVICE_BUSY,
        rusb::Error::InvalidParam => status::INVALID,
        rusb::Error::Overflow => status::OVERFLOW,
        rusb::Error::Access => status::ACCESS_DENIED,
        _ => status::IO_ERROR,
    }
}

/// libusb-backed device backend
pub struct RusbBackend {
    context: Context,
    op_timeout: Duration,
    open_handles: HashMap<BusId, DeviceHandle<Context>>,
    known: HashSet<BusId>,
    changed: Arc<AtomicBool>,
    _hotplug: Option<Registration<Context>>,
}

impl RusbBackend {
    /// Create a backend using `op_timeout` for blocking device calls
    pub fn new(op_timeout: Duration) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let changed = Arc::new(AtomicBool::new(false));

        let hotplug = if rusb::has_hotplug() {
            match HotplugBuilder::new().enumerate(false).register(
                &context,
                Box::new(ChangeFlag {
                    changed: changed.clone(),
                }),
            ) {
                Ok(registration) => Some(registration),
                Err(e) => {
                    warn!("Hot-plug registration failed ({}), falling back to rescans", e);
                    None
                }
            }
        } else {
            warn!("libusb reports no hot-plug support, falling back to rescans");
            None
        };

        Ok(Self {
            context,
            op_timeout,
            open_handles: HashMap::new(),
            known: HashSet::new(),
            changed,
            _hotplug: hotplug,
        })
    }

    fn find_device(&self, busid: &BusId) -> Option<Device<Context>> {
        let devices = self.context.devices().ok()?;
        devices.iter().find(|device| {
            BusId::from_bus_dev(device.bus_number() as u32, device.address() as u32) == *busid
        })
    }

    /// Build a device record, returning None for root hubs and devices whose
    /// descriptors cannot be read
    fn record_for(device: &Device<Context>) -> Option<DeviceRecord> {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "Failed to read descriptor for bus={} addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                return None;
            }
        };

        // Root hubs cannot be exported
        if desc.vendor_id() == 0x1d6b && desc.class_code() == 9 {
            return None;
        }

        let busnum = device.bus_number() as u32;
        let devnum = device.address() as u32;

        let (configuration_value, num_interfaces) = match device.active_config_descriptor() {
            Ok(config) => (config.number(), config.num_interfaces()),
            Err(_) => (0, 0),
        };

        let version = desc.device_version();
        let bcd_device = ((version.major() as u16) << 8)
            | ((version.minor() as u16) << 4)
            | (version.sub_minor() as u16);

        // Descriptor strings need an open handle; unreadable strings are
        // left empty rather than failing enumeration
        let (manufacturer, product, serial_number) = match device.open() {
            Ok(handle) => (
                handle.read_manufacturer_string_ascii(&desc).ok(),
                handle.read_product_string_ascii(&desc).ok(),
                handle.read_serial_number_string_ascii(&desc).ok(),
            ),
            Err(_) => (None, None, None),
        };

        Some(DeviceRecord {
            desc: ExportedDevice {
                busid: BusId::from_bus_dev(busnum, devnum),
                busnum,
                devnum,
                speed: map_speed(device.speed()),
                vendor: desc.vendor_id(),
                product: desc.product_id(),
                bcd_device,
                class: desc.class_code(),
                subclass: desc.sub_class_code(),
                protocol: desc.protocol_code(),
                configuration_value,
                num_configurations: desc.num_configurations(),
                num_interfaces,
            },
            manufacturer,
            product,
            serial_number,
        })
    }

    fn current_busids(&self) -> HashSet<BusId> {
        match self.context.devices() {
            Ok(devices) => devices
                .iter()
                .map(|d| BusId::from_bus_dev(d.bus_number() as u32, d.address() as u32))
                .collect(),
            Err(e) => {
                warn!("Device scan failed: {}", e);
                self.known.clone()
            }
        }
    }
}

fn map_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

fn map_open_error(error: rusb::Error) -> OpenError {
    match error {
        rusb::Error::NoDevice | rusb::Error::NotFound => OpenError::NotFound,
        rusb::Error::Busy => OpenError::Busy,
        e => OpenError::Io(e.to_string()),
    }
}

impl DeviceBackend for RusbBackend {
    fn enumerate(&mut self) -> Vec<DeviceRecord> {
        let mut records = Vec::new();
        self.known.clear();

        let devices = match self.context.devices() {
            Ok(d) => d,
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                return records;
            }
        };

        for device in devices.iter() {
            self.known.insert(BusId::from_bus_dev(
                device.bus_number() as u32,
                device.address() as u32,
            ));
            if let Some(record) = Self::record_for(&device) {
                records.push(record);
            }
        }

        records
    }

    fn open(&mut self, busid: &BusId) -> Result<(), OpenError> {
        if self.open_handles.contains_key(busid) {
            return Ok(());
        }

        let device = self.find_device(busid).ok_or(OpenError::NotFound)?;
        let handle = device.open().map_err(map_open_error)?;

        // Driver-unbind claim: let libusb detach the kernel driver when an
        // interface is claimed, then claim every interface of the active
        // configuration
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("auto-detach not supported for {}: {}", busid, e);
        }

        let num_interfaces = device
            .active_config_descriptor()
            .map(|c| c.num_interfaces())
            .unwrap_or(0);
        for interface in 0..num_interfaces {
            handle.claim_interface(interface).map_err(map_open_error)?;
        }

        self.open_handles.insert(busid.clone(), handle);
        Ok(())
    }

    fn close(&mut self, busid: &BusId) -> bool {
        self.open_handles.remove(busid).is_some()
    }

    fn submit(&mut self, busid: &BusId, cmd: &SubmitCmd) -> Option<UrbOutcome> {
        let Some(handle) = self.open_handles.get(busid) else {
            return Some(UrbOutcome::error(status::DEVICE_GONE));
        };
        Some(execute_urb(handle, cmd, self.op_timeout))
    }

    fn poll_events(&mut self, timeout: Duration) -> Vec<BackendEvent> {
        if let Err(e) = self.context.handle_events(Some(timeout)) {
            if e != rusb::Error::Interrupted {
                warn!("Error handling USB events: {}", e);
            }
        }

        // With hot-plug support only rescan after a callback fired
        if self._hotplug.is_some() && !self.changed.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }

        let current = self.current_busids();
        let mut events = Vec::new();

        for busid in self.known.difference(&current) {
            events.push(BackendEvent::Left(busid.clone()));
        }

        let added: Vec<BusId> = current.difference(&self.known).cloned().collect();
        for busid in added {
            if let Some(device) = self.find_device(&busid)
                && let Some(record) = Self::record_for(&device)
            {
                events.push(BackendEvent::Arrived(record));
            }
        }

        self.known = current;
        events
    }
}

/// Execute one URB against an open handle
///
/// A non-zero setup packet selects a control transfer; otherwise the
/// interval field distinguishes interrupt from bulk, matching how the
/// submit command encodes transfer kinds.
fn execute_urb(handle: &DeviceHandle<Context>, cmd: &SubmitCmd, timeout: Duration) -> UrbOutcome {
    if cmd.is_control() {
        // Setup packet fields are little-endian
        let request_type = cmd.setup[0];
        let request = cmd.setup[1];
        let value = u16::from_le_bytes([cmd.setup[2], cmd.setup[3]]);
        let index = u16::from_le_bytes([cmd.setup[4], cmd.setup[5]]);

        return match cmd.direction {
            Direction::In => {
                let mut buffer = vec![0u8; cmd.transfer_buffer_length as usize];
                match handle.read_control(request_type, request, value, index, &mut buffer, timeout)
                {
                    Ok(len) => {
                        buffer.truncate(len);
                        UrbOutcome::success_in(buffer)
                    }
                    Err(e) => UrbOutcome::error(map_rusb_error(e)),
                }
            }
            Direction::Out => {
                match handle.write_control(request_type, request, value, index, &cmd.data, timeout)
                {
                    Ok(len) => UrbOutcome::success_out(len as u32),
                    Err(e) => UrbOutcome::error(map_rusb_error(e)),
                }
            }
        };
    }

    let endpoint = match cmd.direction {
        Direction::In => cmd.ep as u8 | 0x80,
        Direction::Out => cmd.ep as u8,
    };
    let interrupt = cmd.interval > 0;

    match cmd.direction {
        Direction::In => {
            let mut buffer = vec![0u8; cmd.transfer_buffer_length as usize];
            let result = if interrupt {
                handle.read_interrupt(endpoint, &mut buffer, timeout)
            } else {
                handle.read_bulk(endpoint, &mut buffer, timeout)
            };
            match result {
                Ok(len) => {
                    buffer.truncate(len);
                    UrbOutcome::success_in(buffer)
                }
                Err(e) => UrbOutcome::error(map_rusb_error(e)),
            }
        }
        Direction::Out => {
            let result = if interrupt {
                handle.write_interrupt(endpoint, &cmd.data, timeout)
            } else {
                handle.write_bulk(endpoint, &cmd.data, timeout)
            };
            match result {
                Ok(len) => UrbOutcome::success_out(len as u32),
                Err(e) => UrbOutcome::error(map_rusb_error(e)),
            }
        }
    }
}

/// Hot-plug callback that flags a change for the next poll
struct ChangeFlag {
    changed: Arc<AtomicBool>,
}

impl<T: UsbContext> Hotplug<T> for ChangeFlag {
    fn device_arrived(&mut self, _device: Device<T>) {
        self.changed.store(true, Ordering::Release);
    }

    fn device_left(&mut self, _device: Device<T>) {
        self.changed.store(true, Ordering::Release);
    }
}

/// Scripted URB behavior for the mock backend
#[derive(Debug, Clone)]
pub enum MockUrb {
    /// Complete with this outcome
    Complete(UrbOutcome),
    /// Never resolve; only the operation timeout terminates the transfer
    Never,
}

#[derive(Default)]
struct MockState {
    devices: HashMap<BusId, DeviceRecord>,
    open: HashSet<BusId>,
    urb_scripts: HashMap<(BusId, u32), MockUrb>,
    open_failures: HashMap<BusId, OpenError>,
    injected: VecDeque<BackendEvent>,
}

/// Deterministic backend for tests
///
/// Devices, URB outcomes, and hotplug events are scripted through a
/// [`MockHandle`] that stays usable after the backend moves onto the worker
/// thread. Unscripted URBs echo: IN transfers complete with a zero-filled
/// buffer of the requested length, OUT transfers report their data written.
#[derive(Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control handle shared with the backend
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
        }
    }
}

/// Test-side control handle for a [`MockBackend`]
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockHandle {
    /// Add a device without emitting an arrival event (pre-start seeding)
    pub fn seed_device(&self, record: DeviceRecord) {
        let mut state = lock_state(&self.state);
        state.devices.insert(record.desc.busid.clone(), record);
    }

    /// Hot-plug a device, emitting an arrival event
    pub fn add_device(&self, record: DeviceRecord) {
        let mut state = lock_state(&self.state);
        state.devices.insert(record.desc.busid.clone(), record.clone());
        state.injected.push_back(BackendEvent::Arrived(record));
    }

    /// Hot-unplug a device, emitting a removal event
    pub fn remove_device(&self, busid: &BusId) {
        let mut state = lock_state(&self.state);
        state.devices.remove(busid);
        state.open.remove(busid);
        state.injected.push_back(BackendEvent::Left(busid.clone()));
    }

    /// Script the outcome of the URB with `seqnum` on `busid`
    pub fn script_urb(&self, busid: &BusId, seqnum: u32, script: MockUrb) {
        lock_state(&self.state)
            .urb_scripts
            .insert((busid.clone(), seqnum), script);
    }

    /// Make opening `busid` fail with `error`
    pub fn fail_open(&self, busid: &BusId, error: OpenError) {
        lock_state(&self.state)
            .open_failures
            .insert(busid.clone(), error);
    }

    /// Whether the backend currently holds `busid` open
    pub fn is_open(&self, busid: &BusId) -> bool {
        lock_state(&self.state).open.contains(busid)
    }
}

impl DeviceBackend for MockBackend {
    fn enumerate(&mut self) -> Vec<DeviceRecord> {
        lock_state(&self.state).devices.values().cloned().collect()
    }

    fn open(&mut self, busid: &BusId) -> Result<(), OpenError> {
        let mut state = lock_state(&self.state);
        if let Some(error) = state.open_failures.get(busid) {
            return Err(error.clone());
        }
        if !state.devices.contains_key(busid) {
            return Err(OpenError::NotFound);
        }
        state.open.insert(busid.clone());
        Ok(())
    }

    fn close(&mut self, busid: &BusId) -> bool {
        lock_state(&self.state).open.remove(busid)
    }

    fn submit(&mut self, busid: &BusId, cmd: &SubmitCmd) -> Option<UrbOutcome> {
        let mut state = lock_state(&self.state);
        if !state.open.contains(busid) {
            return Some(UrbOutcome::error(status::DEVICE_GONE));
        }

        match state.urb_scripts.remove(&(busid.clone(), cmd.seqnum)) {
            Some(MockUrb::Complete(outcome)) => Some(outcome),
            Some(MockUrb::Never) => None,
            None => Some(match cmd.direction {
                Direction::In => {
                    UrbOutcome::success_in(vec![0u8; cmd.transfer_buffer_length as usize])
                }
                Direction::Out => UrbOutcome::success_out(cmd.data.len() as u32),
            }),
        }
    }

    fn poll_events(&mut self, timeout: Duration) -> Vec<BackendEvent> {
        let drained: Vec<BackendEvent> = lock_state(&self.state).injected.drain(..).collect();
        if !drained.is_empty() {
            return drained;
        }
        std::thread::sleep(timeout);
        lock_state(&self.state).injected.drain(..).collect()
    }
}

/// Build a plain full-speed test device on `busnum-devnum`
pub fn mock_device(busnum: u32, devnum: u32) -> DeviceRecord {
    DeviceRecord {
        desc: ExportedDevice {
            busid: BusId::from_bus_dev(busnum, devnum),
            busnum,
            devnum,
            speed: DeviceSpeed::Full,
            vendor: 0x1234,
            product: 0x5678,
            bcd_device: 0x0100,
            class: 0,
            subclass: 0,
            protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
        },
        manufacturer: Some("Mock".to_string()),
        product: Some("Test Device".to_string()),
        serial_number: None,
    }
}
