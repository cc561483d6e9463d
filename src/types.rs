// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

/// Speed of usb device. See usb spec for more details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    // Not known yet, the device is still being enumerated.
    Unknown,
    // The device is operating at low speed (1.5MBit/s).
    Low,
    // The device is operating at full speed (12MBit/s).
    Full,
    // The device is operating at high speed (480MBit/s).
    High,
    // The device is operating at super speed (5000MBit/s).
    Super,
}

/// Data phase direction, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out = 0,
    In = 1,
}

pub const ENDPOINT_DIRECTION_OFFSET: u8 = 7;
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or bmRequestType.
    pub fn from_address(address: u8) -> Direction {
        if address & (1 << ENDPOINT_DIRECTION_OFFSET) != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint transfer type, bmAttributes bits 1:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointType {
    pub fn from_attributes(attributes: u8) -> EndpointType {
        match attributes & 0x3 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }

    /// Interrupt and isochronous endpoints consume reserved frame time.
    pub fn is_periodic(self) -> bool {
        self == EndpointType::Isochronous || self == EndpointType::Interrupt
    }
}

/// Chapter 9 device states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    NotAttached,
    Attached,
    Powered,
    Default,
    Address,
    Configured,
    Suspended,
}

impl DeviceState {
    /// States a device can be suspended from, and resumes back into.
    pub fn can_suspend(self) -> bool {
        match self {
            DeviceState::Powered
            | DeviceState::Default
            | DeviceState::Address
            | DeviceState::Configured => true,
            _ => false,
        }
    }
}

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;

pub const DEVICE_DESCRIPTOR_LENGTH: usize = 18;

/// Type of control request, bmRequestType bits 6:5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Recipient of control request, bmRequestType bits 4:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequestRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    Invalid,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct UsbRequestSetup {
    // USB Device Request. USB spec. rev. 2.0 9.3
    pub request_type: u8, // bmRequestType
    pub request: u8,      // bRequest
    pub value: u16,       // wValue
    pub index: u16,       // wIndex
    pub length: u16,      // wLength
}

impl UsbRequestSetup {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        UsbRequestSetup {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Direction of the data stage.
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }

    pub fn get_type(&self) -> ControlRequestType {
        match (self.request_type >> 5) & 0x3 {
            0 => ControlRequestType::Standard,
            1 => ControlRequestType::Class,
            2 => ControlRequestType::Vendor,
            _ => ControlRequestType::Reserved,
        }
    }

    pub fn get_recipient(&self) -> ControlRequestRecipient {
        match self.request_type & 0x1f {
            0 => ControlRequestRecipient::Device,
            1 => ControlRequestRecipient::Interface,
            2 => ControlRequestRecipient::Endpoint,
            3 => ControlRequestRecipient::Other,
            _ => ControlRequestRecipient::Invalid,
        }
    }

    /// Length of the data stage. Copied out because the struct is packed.
    pub fn data_length(&self) -> usize {
        let length = self.length;
        length as usize
    }
}

/// Standard endpoint descriptor, USB spec. rev. 2.0 9.6.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn new(address: u8, ty: EndpointType, max_packet_size: u16, interval: u8) -> Self {
        EndpointDescriptor {
            address,
            attributes: ty as u8,
            max_packet_size,
            interval,
        }
    }

    /// Descriptor of the default control pipe.
    pub fn control(max_packet_size: u16) -> Self {
        EndpointDescriptor::new(0, EndpointType::Control, max_packet_size, 0)
    }

    pub fn number(&self) -> u8 {
        self.address & ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    pub fn ty(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }

    /// Payload bytes per transaction. High speed high bandwidth endpoints encode up to two extra
    /// transactions per microframe in bits 12:11.
    pub fn payload_bytes(&self) -> usize {
        let base = (self.max_packet_size & 0x7ff) as usize;
        let mult = ((self.max_packet_size >> 11) & 0x3) as usize + 1;
        base * mult
    }

    /// Polling period in microframes (125us).
    pub fn period_microframes(&self, speed: Speed) -> u32 {
        let interval = u32::from(self.interval.max(1));
        // Exponent encoding, 2^(bInterval-1).
        let exponential = 1 << (interval.min(16) - 1);
        match (speed, self.ty()) {
            (Speed::High, _) | (Speed::Super, _) => exponential,
            (_, EndpointType::Isochronous) => exponential * 8,
            // Full and low speed interrupt endpoints count frames.
            _ => interval * 8,
        }
    }

    /// Average microseconds per 1ms frame this endpoint occupies on the bus.
    pub fn periodic_load_us(&self, speed: Speed) -> u32 {
        if !self.ty().is_periodic() {
            return 0;
        }
        let per_transaction = crate::bandwidth::bus_time_us(
            speed,
            self.direction(),
            self.ty(),
            self.payload_bytes(),
        );
        let period = self.period_microframes(speed);
        if period >= 8 {
            // Once every `period / 8` frames; round the average up so it is never zero.
            let frames = period / 8;
            (per_transaction + frames - 1) / frames
        } else {
            per_transaction * (8 / period)
        }
    }
}

/// One alternate setting of an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltSetting {
    pub alternate_setting: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// An interface and all of its alternate settings. Alt setting 0 is active after
/// SET_CONFIGURATION.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interface {
    pub number: u8,
    pub alt_settings: Vec<AltSetting>,
}

impl Interface {
    pub fn alt_setting(&self, alternate_setting: u8) -> Option<&AltSetting> {
        self.alt_settings
            .iter()
            .find(|a| a.alternate_setting == alternate_setting)
    }
}

/// A device configuration as selected by SET_CONFIGURATION.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub value: u8,
    pub interfaces: Vec<Interface>,
}

impl Configuration {
    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.number == number)
    }

    /// Endpoints that are active right after this configuration is selected.
    pub fn default_endpoints(&self) -> Vec<EndpointDescriptor> {
        self.interfaces
            .iter()
            .filter_map(|i| i.alt_setting(0).or_else(|| i.alt_settings.first()))
            .flat_map(|a| a.endpoints.iter().cloned())
            .collect()
    }
}

/// Standard device descriptor, USB spec. rev. 2.0 9.6.1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Decode a raw device descriptor. Returns None if the buffer is short or is not a device
    /// descriptor.
    pub fn from_bytes(raw: &[u8]) -> Option<DeviceDescriptor> {
        if raw.len() < DEVICE_DESCRIPTOR_LENGTH || raw[1] != DESCRIPTOR_TYPE_DEVICE {
            return None;
        }
        let mut cursor = Cursor::new(&raw[2..DEVICE_DESCRIPTOR_LENGTH]);
        let usb_version = cursor.read_u16::<LittleEndian>().ok()?;
        let mut class = [0u8; 4];
        cursor.read_exact(&mut class).ok()?;
        let vendor_id = cursor.read_u16::<LittleEndian>().ok()?;
        let product_id = cursor.read_u16::<LittleEndian>().ok()?;
        let device_version = cursor.read_u16::<LittleEndian>().ok()?;
        let mut strings = [0u8; 4];
        cursor.read_exact(&mut strings).ok()?;
        Some(DeviceDescriptor {
            usb_version,
            device_class: class[0],
            device_subclass: class[1],
            device_protocol: class[2],
            max_packet_size0: class[3],
            vendor_id,
            product_id,
            device_version,
            manufacturer_index: strings[0],
            product_index: strings[1],
            serial_number_index: strings[2],
            num_configurations: strings[3],
        })
    }
}
