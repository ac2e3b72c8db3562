//! Types for (standard) descriptors
//!
//! This module contains types to represent various USB descriptors.
//!
//! The [`parse`] submodule contains functions for parsing raw descriptors into these structures.
//!
//! All descriptors have a common framing: the first two bytes contain the descriptor **length** and **type** respectively.
//! This framing is represented by the [`Descriptor`] type.
//!
//! To turn raw descriptor data into a [`Descriptor`] use the [`parse::any_descriptor`] function.
//!
//! Such a descriptor can then be interpreted further, by examining the [`Descriptor::descriptor_type`]:
//! - If the type matches one of the standard types ([`TYPE_DEVICE`], [`TYPE_CONFIGURATION`], [`TYPE_INTERFACE`], [`TYPE_ENDPOINT`]),
//!   then its `data` can further be parsed by the respective methods in the [`parse`] module.
//! - Otherwise it's up to the driver to interpret the descriptor.
//!
//! [`next_descriptor`] walks the framing without interpreting it, which is
//! how the enumeration sequence scans a full configuration descriptor for
//! the interface and endpoint entries it needs.

use crate::types::{Bcd16, TransferType};
use usb_device::UsbDirection;

/// [`descriptor_type`](Descriptor::descriptor_type) identifying a [`DeviceDescriptor`]
pub const TYPE_DEVICE: u8 = 1;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying a [`ConfigurationDescriptor`]
pub const TYPE_CONFIGURATION: u8 = 2;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying a `StringDescriptor` (not interpreted by this stack)
pub const TYPE_STRING: u8 = 3;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying an [`InterfaceDescriptor`]
pub const TYPE_INTERFACE: u8 = 4;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying an [`EndpointDescriptor`]
pub const TYPE_ENDPOINT: u8 = 5;

/// Full size of a device descriptor on the wire.
pub const DEVICE_DESC_SIZE: u16 = 18;
/// Size of the fixed part of a configuration descriptor.
pub const CONFIGURATION_DESC_SIZE: u16 = 9;
/// Size of an interface descriptor.
pub const INTERFACE_DESC_SIZE: u16 = 9;
/// Size of an endpoint descriptor.
pub const ENDPOINT_DESC_SIZE: u16 = 7;

/// Outer framing of a descriptor
pub struct Descriptor<'a> {
    /// Total length of the descriptor, including this length byte itself and the `descriptor_type` byte
    pub length: u8,
    /// Type of descriptor. If this is a standard descriptor, it corresponds to one of the `TYPE_*` constants,
    /// otherwise it is class or vendor specific.
    pub descriptor_type: u8,
    /// Remaining data of the descriptor. Usually `length - 2` bytes long, except the descriptor may be truncated
    /// if less data was requested, or the data did not fully fit into the control buffer.
    pub data: &'a [u8],
}

/// Advance to the next descriptor of the given type.
///
/// `buffer` must point at the start of a descriptor. That descriptor is
/// skipped, then the framing is walked until a descriptor of
/// `descriptor_type` is found with at least `min_size` bytes remaining in
/// the buffer. Returns the buffer tail starting at the found descriptor,
/// or `None` when the walk runs off the end (the caller decides policy).
pub fn next_descriptor(buffer: &[u8], descriptor_type: u8, min_size: u16) -> Option<&[u8]> {
    let mut rest = buffer;
    loop {
        let length = *rest.first()? as usize;
        if length < 2 || length > rest.len() {
            return None;
        }
        rest = &rest[length..];
        if rest.len() < 2 || rest.len() < min_size as usize {
            return None;
        }
        if rest[1] == descriptor_type {
            return Some(rest);
        }
    }
}

/// A device descriptor describes general information about a USB device.
/// A USB device has only one device descriptor.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceDescriptor {
    /// USB Specification Release Number in Binary-Coded Decimal (i.e., 2.10 is 210H).
    pub usb_release: Bcd16,

    /// Class code (assigned by the USB-IF).
    ///
    /// If this field is reset to zero, each interface within a configuration specifies its own
    /// class information and the various interfaces operate independently.
    pub device_class: u8,

    /// Subclass code (assigned by the USB-IF).
    pub device_sub_class: u8,

    /// Protocol code (assigned by the USB-IF).
    pub device_protocol: u8,

    /// Maximum packet size for endpoint zero
    ///
    /// (only 8, 16, 32, or 64 are valid)
    pub max_packet_size: u8,

    /// Vendor ID (assigned by the USB-IF)
    pub id_vendor: u16,

    /// Product ID (assigned by the manufacturer)
    pub id_product: u16,

    /// Device release number in binary-coded decimal
    pub device_release: Bcd16,

    /// Index of string descriptor describing manufacturer
    pub manufacturer_index: u8,

    /// Index of string descriptor describing product
    pub product_index: u8,

    /// Index of string descriptor describing the device's serial number
    pub serial_number_index: u8,

    /// Number of possible configurations
    pub num_configurations: u8,
}

/// The configuration descriptor describes information about a specific device configuration.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationDescriptor {
    /// Total length of data returned for this configuration.
    ///
    /// Includes the combined length of all descriptors (configuration, interface,
    /// endpoint, and class- or vendor-specific) returned for this configuration.
    pub total_length: u16,

    /// Number of interfaces supported by this configuration
    pub num_interfaces: u8,

    /// Value to use as an argument to the SetConfiguration() request to select this configuration
    pub value: u8,

    /// Index of string descriptor describing this configuration
    pub index: u8,

    /// Configuration characteristics
    pub attributes: ConfigurationAttributes,

    /// Maximum power consumption of the USB device from the bus in this specific configuration.
    ///
    /// Expressed in 2 mA units (i.e., 50 = 100 mA).
    pub max_power: u8,
}

#[derive(Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationAttributes(u8);

/// Part of the [`ConfigurationDescriptor`]
impl ConfigurationAttributes {
    /// Whether the configuration is self-powered (as opposed to bus-powered).
    pub fn self_powered(&self) -> bool {
        (self.0 >> 6) & 1 == 1
    }

    /// Device supports remote wakeup
    pub fn remote_wakeup(&self) -> bool {
        (self.0 >> 5) & 1 == 1
    }
}

/// The interface descriptor describes a specific interface within a configuration.
///
/// An interface descriptor is always returned as part of a configuration descriptor, followed
/// by the endpoint descriptors (and any class specific descriptors) of that interface.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceDescriptor {
    /// Number of this interface.
    ///
    /// Zero-based value identifying the index in the array of
    /// concurrent interfaces supported by this configuration.
    pub interface_number: u8,

    /// Value used to select this alternate setting for the interface identified in the prior field
    pub alternate_setting: u8,

    /// Number of endpoints used by this interface (excluding endpoint zero).
    pub num_endpoints: u8,

    /// Class code (assigned by the USB-IF).
    ///
    /// If this field is set to FFH, the interface class is vendor-specific.
    pub interface_class: u8,

    /// Subclass code (assigned by the USB-IF).
    pub interface_sub_class: u8,

    /// Protocol code (assigned by the USB).
    pub interface_protocol: u8,

    /// Index of string descriptor describing this interface
    pub interface_index: u8,
}

/// Each endpoint used for an interface has its own descriptor.
///
/// This descriptor contains the information required by the host to configure a pipe for the endpoint.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    /// The address of the endpoint on the USB device described by this descriptor.
    pub address: EndpointAddress,

    /// This field describes the endpoint's attributes when it is configured using the bConfigurationValue.
    pub attributes: EndpointAttributes,

    /// Maximum packet size this endpoint is capable of sending or receiving (low 11 bits).
    pub max_packet_size: u16,

    /// Interval for polling endpoint for data transfers.
    ///
    /// Expressed in frames (1 millisecond).
    pub interval: u8,
}

#[derive(Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Address of an endpoint
///
/// Part of an [`EndpointDescriptor`].
pub struct EndpointAddress(u8);

impl EndpointAddress {
    /// Endpoint number
    ///
    /// Ranges from 1 to 15.
    pub fn number(&self) -> u8 {
        self.0 & 0x0F
    }

    /// Direction of the endpoint
    pub fn direction(&self) -> UsbDirection {
        self.0.into()
    }
}

#[derive(Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Attributes of an endpoint
///
/// Part of an [`EndpointDescriptor`].
pub struct EndpointAttributes(u8);

impl EndpointAttributes {
    pub fn transfer_type(&self) -> TransferType {
        unsafe { core::mem::transmute(self.0 & 0b11) }
    }
}

pub mod parse {
    use nom::bytes::streaming::take;
    use nom::combinator::{map, verify};
    use nom::number::streaming::{le_u16, u8};
    use nom::sequence::tuple;
    use nom::IResult;

    use super::*;

    /// Parse outer framing of a descriptor
    ///
    /// The resulting `data` within the descriptor can then be parsed with one of the other functions below,
    /// depending on the `type`.
    pub fn any_descriptor(input: &[u8]) -> IResult<&[u8], Descriptor<'_>> {
        let (input, (length, descriptor_type)) =
            tuple((verify(u8, |len| *len >= 2), u8))(input)?;
        let (input, data) = take((length - 2) as usize)(input)?;
        Ok((
            input,
            Descriptor {
                length,
                descriptor_type,
                data,
            },
        ))
    }

    /// Parse descriptor data for a device
    pub fn device_descriptor(input: &[u8]) -> IResult<&[u8], DeviceDescriptor> {
        map(
            tuple((bcd_16, u8, u8, u8, u8, le_u16, le_u16, bcd_16, u8, u8, u8, u8)),
            |(usb_release, device_class, device_sub_class, device_protocol, max_packet_size,
              id_vendor, id_product, device_release, manufacturer_index, product_index,
              serial_number_index, num_configurations)| {
                DeviceDescriptor {
                    usb_release, device_class, device_sub_class, device_protocol, max_packet_size,
                    id_vendor, id_product, device_release, manufacturer_index, product_index,
                    serial_number_index, num_configurations,
                }
            }
        )(input)
    }

    /// Parse descriptor data for a configuration
    pub fn configuration_descriptor(input: &[u8]) -> IResult<&[u8], ConfigurationDescriptor> {
        map(
            tuple((le_u16, u8, u8, u8, u8, u8)),
            |(total_length, num_interfaces, value, index, attributes, max_power)| {
                ConfigurationDescriptor {
                    total_length, num_interfaces, value, index,
                    attributes: ConfigurationAttributes(attributes),
                    max_power,
                }
            }
        )(input)
    }

    /// Parse only the `total_length` from a (partial) configuration descriptor
    pub fn configuration_descriptor_length(input: &[u8]) -> IResult<&[u8], u16> {
        le_u16(input)
    }

    /// Parse descriptor data for an interface
    pub fn interface_descriptor(input: &[u8]) -> IResult<&[u8], InterfaceDescriptor> {
        map(
            tuple((u8, u8, u8, u8, u8, u8, u8)),
            |(interface_number, alternate_setting, num_endpoints, interface_class, interface_sub_class,
              interface_protocol, interface_index)| {
                InterfaceDescriptor {
                    interface_number, alternate_setting, num_endpoints, interface_class, interface_sub_class,
                    interface_protocol, interface_index,
                }
            }
        )(input)
    }

    /// Parse descriptor data for an endpoint
    pub fn endpoint_descriptor(input: &[u8]) -> IResult<&[u8], EndpointDescriptor> {
        map(
            tuple((u8, u8, le_u16, u8)),
            |(address, attributes, max_packet_size, interval)| {
                EndpointDescriptor {
                    address: EndpointAddress(address),
                    attributes: EndpointAttributes(attributes),
                    max_packet_size: max_packet_size & 0x7FF,
                    interval,
                }
            }
        )(input)
    }

    /// Parses a 16-bit binary coded decimal value
    ///
    /// Succeeds only if the data is indeed a valid value. This requires all four nibbles (i.e. half-bytes) to be in the 0-9 range.
    pub fn bcd_16(input: &[u8]) -> IResult<&[u8], Bcd16> {
        map(verify(le_u16, |value| Bcd16::is_valid(*value)), Bcd16)(input)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_any_descriptor() {
            let data = [8, 7, 6, 5, 4, 3, 2, 1, 0];
            let (rest, desc) = any_descriptor(&data).unwrap();
            assert_eq!(desc.length, 8);
            assert_eq!(desc.descriptor_type, 7);
            assert_eq!(desc.data, &[6, 5, 4, 3, 2, 1]);
            assert_eq!(rest, &[0]);
        }

        #[test]
        fn test_any_descriptor_rejects_runt_framing() {
            assert!(any_descriptor(&[1, 5, 0]).is_err());
        }

        #[test]
        fn test_endpoint_descriptor_masks() {
            // bEndpointAddress 0x81: IN endpoint 1; interrupt; MPS limited to 11 bits.
            let (_, ep) = endpoint_descriptor(&[0x81, 0x03, 0x08, 0xF8, 10]).unwrap();
            assert_eq!(ep.address.number(), 1);
            assert_eq!(ep.address.direction(), UsbDirection::In);
            assert_eq!(ep.attributes.transfer_type(), TransferType::Interrupt);
            assert_eq!(ep.max_packet_size, 0xF808 & 0x7FF);
            assert_eq!(ep.interval, 10);
        }

        #[test]
        fn test_configuration_attributes() {
            let (_, cfg) =
                configuration_descriptor(&[32, 0, 1, 1, 0, 0b0110_0000, 50]).unwrap();
            assert_eq!(cfg.total_length, 32);
            assert!(cfg.attributes.self_powered());
            assert!(cfg.attributes.remote_wakeup());
            assert_eq!(cfg.max_power, 50);
        }

        #[test]
        fn test_bcd_16() {
            let (_, Bcd16(bcd)) = bcd_16(&[0x10, 0x02]).unwrap();
            assert_eq!(bcd, 0x0210);

            assert!(bcd_16(&[0x00, 0x09]).is_ok());
            assert!(bcd_16(&[0x00, 0x0A]).is_err());
            assert!(bcd_16(&[0x0F, 0x00]).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // config(9) + interface(9) + endpoint(7) + endpoint(7)
    const CFG: &[u8] = &[
        9, TYPE_CONFIGURATION, 32, 0, 1, 1, 0, 0xC0, 50, //
        9, TYPE_INTERFACE, 0, 0, 2, 0x03, 0, 0, 0, //
        7, TYPE_ENDPOINT, 0x81, 0x03, 8, 0, 10, //
        7, TYPE_ENDPOINT, 0x01, 0x03, 8, 0, 10,
    ];

    #[test]
    fn test_next_descriptor_finds_interface() {
        let iface = next_descriptor(CFG, TYPE_INTERFACE, INTERFACE_DESC_SIZE).unwrap();
        assert_eq!(iface[1], TYPE_INTERFACE);
        assert_eq!(iface[4], 2); // bNumEndpoints
    }

    #[test]
    fn test_next_descriptor_walks_endpoints() {
        let iface = next_descriptor(CFG, TYPE_INTERFACE, INTERFACE_DESC_SIZE).unwrap();
        let ep0 = next_descriptor(iface, TYPE_ENDPOINT, ENDPOINT_DESC_SIZE).unwrap();
        assert_eq!(ep0[2], 0x81);
        let ep1 = next_descriptor(ep0, TYPE_ENDPOINT, ENDPOINT_DESC_SIZE).unwrap();
        assert_eq!(ep1[2], 0x01);
        assert!(next_descriptor(ep1, TYPE_ENDPOINT, ENDPOINT_DESC_SIZE).is_none());
    }

    #[test]
    fn test_next_descriptor_not_found() {
        assert!(next_descriptor(CFG, TYPE_STRING, 2).is_none());
        // Truncated framing ends the walk instead of panicking.
        assert!(next_descriptor(&[9, TYPE_CONFIGURATION, 1], TYPE_INTERFACE, 9).is_none());
    }
}
