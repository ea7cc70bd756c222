//! Wire-level USB types
//!
//! Types shared by the device-list and import payloads: the fixed-width bus
//! id, the exported-device record, and device speed codes.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};

/// Size of the bus id field on the wire (NUL-padded ASCII)
pub const BUS_ID_SIZE: usize = 32;

/// Stable identifier of a device on the host ("busnum-devnum", e.g. "1-7")
///
/// At most `BUS_ID_SIZE - 1` bytes so the wire field keeps a trailing NUL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(String);

impl BusId {
    /// Create a bus id, validating it fits the wire field
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.len() >= BUS_ID_SIZE {
            return Err(ProtocolError::BusIdTooLong {
                len: id.len(),
                max: BUS_ID_SIZE - 1,
            });
        }
        Ok(Self(id))
    }

    /// Bus id for a bus number / device number pair
    pub fn from_bus_dev(busnum: u32, devnum: u32) -> Self {
        Self(format!("{}-{}", busnum, devnum))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode from the fixed wire field, stopping at the first NUL
    pub fn from_wire(raw: &[u8; BUS_ID_SIZE]) -> Self {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(BUS_ID_SIZE);
        Self(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Encode into the fixed wire field, NUL-padded
    pub fn to_wire(&self) -> [u8; BUS_ID_SIZE] {
        let mut raw = [0u8; BUS_ID_SIZE];
        let bytes = self.0.as_bytes();
        raw[..bytes.len()].copy_from_slice(bytes);
        raw
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// USB device speed, encoded as a u32 on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// Wireless USB
    Wireless,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl DeviceSpeed {
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Low => 1,
            Self::Full => 2,
            Self::High => 3,
            Self::Wireless => 4,
            Self::Super => 5,
            Self::SuperPlus => 6,
        }
    }
}

/// Device record carried in device-list and import replies
///
/// An immutable snapshot of one exported device's identity. Snapshots are
/// superseded wholesale on each enumeration, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    /// Stable bus id on the host
    pub busid: BusId,
    /// Bus number
    pub busnum: u32,
    /// Device number on the bus
    pub devnum: u32,
    /// Device speed
    pub speed: DeviceSpeed,
    /// USB Vendor ID
    pub vendor: u16,
    /// USB Product ID
    pub product: u16,
    /// Device release number (bcdDevice)
    pub bcd_device: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Active configuration value
    pub configuration_value: u8,
    /// Number of configurations
    pub num_configurations: u8,
    /// Number of interfaces in the active configuration
    pub num_interfaces: u8,
}

impl ExportedDevice {
    /// Size of one record on the wire
    pub const WIRE_SIZE: usize = BUS_ID_SIZE + 12 + 6 + 6;

    /// Device id used in URB traffic: busnum in the high 16 bits, devnum low
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | (self.devnum & 0xffff)
    }

    /// Read one record from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut busid_raw = [0u8; BUS_ID_SIZE];
        reader.read_exact(&mut busid_raw)?;
        let busid = BusId::from_wire(&busid_raw);

        let busnum = reader.read_u32::<BigEndian>()?;
        let devnum = reader.read_u32::<BigEndian>()?;
        let speed = DeviceSpeed::from_wire(reader.read_u32::<BigEndian>()?);
        let vendor = reader.read_u16::<BigEndian>()?;
        let product = reader.read_u16::<BigEndian>()?;
        let bcd_device = reader.read_u16::<BigEndian>()?;
        let class = reader.read_u8()?;
        let subclass = reader.read_u8()?;
        let protocol = reader.read_u8()?;
        let configuration_value = reader.read_u8()?;
        let num_configurations = reader.read_u8()?;
        let num_interfaces = reader.read_u8()?;

        Ok(Self {
            busid,
            busnum,
            devnum,
            speed,
            vendor,
            product,
            bcd_device,
            class,
            subclass,
            protocol,
            configuration_value,
            num_configurations,
            num_interfaces,
        })
    }

    /// Write one record to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.busid.to_wire())?;
        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed.to_wire())?;
        writer.write_u16::<BigEndian>(self.vendor)?;
        writer.write_u16::<BigEndian>(self.product)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.class)?;
        writer.write_u8(self.subclass)?;
        writer.write_u8(self.protocol)?;
        writer.write_u8(self.configuration_value)?;
        writer.write_u8(self.num_configurations)?;
        writer.write_u8(self.num_interfaces)?;
        Ok(())
    }
}

/// Transfer direction as carried in submit traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            _ => Err(ProtocolError::InvalidHeader {
                reason: "direction must be 0 (OUT) or 1 (IN)",
            }),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Out => 0,
            Self::In => 1,
        }
    }
}
