//! USB device registry
//!
//! Runs on the USB worker thread and owns the table of exportable devices.
//! Devices excluded by the allow-list never enter the table, so they are
//! invisible to device-list requests and unimportable. Each `list_devices`
//! call returns a fresh snapshot.

use crate::usb::backend::{BackendEvent, DeviceBackend};
use common::{DeviceRecord, OpenError, UrbOutcome, UsbEvent};
use protocol::{BusId, SubmitCmd};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Busid-keyed registry of exportable devices
pub struct DeviceRegistry {
    backend: Box<dyn DeviceBackend>,
    /// Exportable devices (allow-listed only)
    devices: HashMap<BusId, DeviceRecord>,
    /// Devices currently held open for export
    open: HashSet<BusId>,
    /// VID:PID allow-list patterns; empty allows everything
    filters: Vec<String>,
}

impl DeviceRegistry {
    pub fn new(backend: Box<dyn DeviceBackend>, filters: Vec<String>) -> Self {
        Self {
            backend,
            devices: HashMap::new(),
            open: HashSet::new(),
            filters,
        }
    }

    /// Populate the registry from an initial enumeration
    pub fn initialize(&mut self) {
        for record in self.backend.enumerate() {
            self.add_record(record);
        }
        info!("Device registry initialized with {} devices", self.devices.len());
    }

    fn add_record(&mut self, record: DeviceRecord) -> Option<&DeviceRecord> {
        if !Self::check_filter(record.desc.vendor, record.desc.product, &self.filters) {
            debug!("Device excluded by allow-list: {}", record.label());
            return None;
        }
        if self.devices.contains_key(&record.desc.busid) {
            return self.devices.get(&record.desc.busid);
        }

        debug!("Added device: {}", record.label());
        let busid = record.desc.busid.clone();
        self.devices.insert(busid.clone(), record);
        self.devices.get(&busid)
    }

    /// Fresh snapshot of all exportable devices
    pub fn list_devices(&self) -> Vec<DeviceRecord> {
        self.devices.values().cloned().collect()
    }

    /// Open a device for exclusive export and return its record
    ///
    /// Unknown and filtered-out bus ids both report `NotFound`; another
    /// device is never silently substituted.
    pub fn open_device(&mut self, busid: &BusId) -> Result<DeviceRecord, OpenError> {
        let Some(record) = self.devices.get(busid).cloned() else {
            return Err(OpenError::NotFound);
        };

        self.backend.open(busid)?;
        self.open.insert(busid.clone());
        info!("Opened device for export: {}", record.label());
        Ok(record)
    }

    /// Close a device; reports whether it had been open
    pub fn close_device(&mut self, busid: &BusId) -> bool {
        let was_open = self.open.remove(busid);
        if was_open {
            self.backend.close(busid);
            info!("Closed device: {}", busid);
        }
        was_open
    }

    /// Execute one URB; `None` means the transfer will never resolve
    pub fn submit(&mut self, busid: &BusId, cmd: &SubmitCmd) -> Option<UrbOutcome> {
        if !self.open.contains(busid) {
            return Some(UrbOutcome::error(protocol::status::DEVICE_GONE));
        }
        self.backend.submit(busid, cmd)
    }

    /// Poll the backend for device changes and fold them into the table
    pub fn poll(&mut self, timeout: Duration) -> Vec<UsbEvent> {
        let mut events = Vec::new();

        for event in self.backend.poll_events(timeout) {
            match event {
                BackendEvent::Arrived(record) => {
                    if let Some(added) = self.add_record(record) {
                        events.push(UsbEvent::DeviceArrived {
                            device: added.clone(),
                        });
                    }
                }
                BackendEvent::Left(busid) => {
                    if self.devices.remove(&busid).is_some() {
                        if self.open.remove(&busid) {
                            warn!("Open device disconnected: {}", busid);
                            self.backend.close(&busid);
                        }
                        events.push(UsbEvent::DeviceLeft { busid });
                    }
                }
            }
        }

        events
    }

    /// Check a VID/PID pair against the allow-list patterns
    ///
    /// Patterns are "0xVID:0xPID" with "*" wildcards; an empty list allows
    /// every device.
    pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }

        for filter in filters {
            let parts: Vec<&str> = filter.split(':').collect();
            if parts.len() != 2 {
                continue;
            }

            let vid_match = parts[0] == "*"
                || u16::from_str_radix(parts[0].trim_start_matches("0x"), 16)
                    .map(|v| v == vid)
                    .unwrap_or(false);
            if !vid_match {
                continue;
            }

            let pid_match = parts[1] == "*"
                || u16::from_str_radix(parts[1].trim_start_matches("0x"), 16)
                    .map(|p| p == pid)
                    .unwrap_or(false);
            if pid_match {
                return true;
            }
        }

        false
    }
}
