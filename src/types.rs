//! Common types used throughout the crate
//!

use usb_device::{
    control::{Recipient, RequestType},
    UsbDirection,
};

/// Vendor/product filter value that matches any id.
pub const MATCH_ANY_ID: u16 = 0xFFFF;

/// Represents a 16-bit binary-coded-decimal value
///
/// A 16-bit BCD represents 4 decimal digits (0-9).
#[derive(Clone, Copy, PartialEq)]
pub struct Bcd16(pub(crate) u16);

impl Bcd16 {
    /// Returns the four contained digits as separate numbers
    ///
    /// Each of the returned numbers is in the 0-9 range.
    pub fn to_digits(self) -> [u8; 4] {
        [
            ((self.0 >> 12) & 0xF) as u8,
            ((self.0 >> 8) & 0xF) as u8,
            ((self.0 >> 4) & 0xF) as u8,
            (self.0 & 0xF) as u8,
        ]
    }

    pub(crate) fn is_valid(value: u16) -> bool {
        (value >> 12 & 0xF) < 10
            && (value >> 8 & 0xF) < 10
            && (value >> 4 & 0xF) < 10
            && (value & 0xF) < 10
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Bcd16 {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "{}{}{}{}",
            (self.0 >> 12) & 0xF,
            (self.0 >> 8) & 0xF,
            (self.0 >> 4) & 0xF,
            self.0 & 0xF,
        )
    }
}

/// Speed reported for an attached device
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// USB 1.0 low speed
    Low,
    /// USB 1.0 full speed
    Full,
    /// USB 2.0 high speed
    High,
    /// Unknown or not yet read
    Invalid,
}

/// Represents one of the four transfer types that USB supports
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Direction of a pipe, as seen from the host
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    /// Towards device from host
    Out = 0,
    /// Towards host from device
    In = 1,
    /// Token stage of a control transfer
    Token = 2,
}

impl From<UsbDirection> for Direction {
    fn from(value: UsbDirection) -> Self {
        match value {
            UsbDirection::Out => Direction::Out,
            UsbDirection::In => Direction::In,
        }
    }
}

/// Represents a standard request (the five SETUP fields)
///
/// NOTE: the fields are all public, because they must be read by the
/// [`crate::hci::HostController`] implementation. The fields are not meant to
/// be written to though. Use the [`StdRequest::new`] constructor instead.
#[derive(Copy, Clone)]
pub struct StdRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl StdRequest {
    /// Construct the SETUP fields for a control transfer
    ///
    /// - `direction`: `UsbDirection::In` when the data stage moves data toward
    ///   the host, `UsbDirection::Out` otherwise (including zero-length
    ///   requests such as SET_ADDRESS).
    /// - `request_type`: whether this is a `Standard`, `Class` or `Vendor`
    ///   request.
    /// - `recipient`: `Device`, `Interface`, `Endpoint` or `Other`.
    /// - `request`, `value`, `index`: meaning depends on the request type; for
    ///   standard requests they are defined by the USB specification.
    /// - `length`: length in bytes of the data stage.
    pub fn new(
        direction: UsbDirection,
        request_type: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: (recipient as u8) | ((request_type as u8) << 5) | (direction as u8),
            request,
            value,
            index,
            length,
        }
    }

    /// Direction encoded in the request-type byte
    pub fn direction(&self) -> UsbDirection {
        self.request_type.into()
    }

    /// Serialize into USB wire order (little-endian)
    pub fn to_bytes(&self) -> [u8; 8] {
        [
            self.request_type,
            self.request,
            self.value as u8,
            (self.value >> 8) as u8,
            self.index as u8,
            (self.index >> 8) as u8,
            self.length as u8,
            (self.length >> 8) as u8,
        ]
    }

    pub(crate) const fn zeroed() -> Self {
        Self {
            request_type: 0,
            request: 0,
            value: 0,
            index: 0,
            length: 0,
        }
    }
}

/// Identifies one interface of one device across the stack boundary.
///
/// This is the only stable handle handed out to drivers and user code: the
/// high byte is the device index, the low byte the interface index.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceId(u16);

impl DeviceId {
    pub fn new(device: u8, interface: u8) -> Self {
        Self(((device as u16) << 8) | interface as u16)
    }

    pub fn device(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn interface(self) -> u8 {
        self.0 as u8
    }
}

/// Handle returned by an IRP submission, used to poll status or cancel.
///
/// Message-pipe tickets carry the message-pipe slot, streaming tickets the
/// endpoint-pipe index within the interface. In the packed 8-bit form the
/// high bit marks a message-pipe ticket.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ticket {
    Msg(u8),
    Stream(u8),
}

const TICKET_MSG_BIT: u8 = 0x80;

impl Ticket {
    pub fn to_wire(self) -> u8 {
        match self {
            Ticket::Msg(slot) => TICKET_MSG_BIT | slot,
            Ticket::Stream(pipe) => pipe & !TICKET_MSG_BIT,
        }
    }

    pub fn from_wire(raw: u8) -> Self {
        if raw & TICKET_MSG_BIT != 0 {
            Ticket::Msg(raw & !TICKET_MSG_BIT)
        } else {
            Ticket::Stream(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb_device::control::Request;

    #[test]
    fn test_stdreq_new() {
        let req = StdRequest::new(
            UsbDirection::In,
            RequestType::Standard,
            Recipient::Device,
            Request::GET_DESCRIPTOR,
            0x1234,
            0,
            27,
        );
        assert_eq!(req.request_type, 0x80);
        assert_eq!(req.request, 0x06);
        assert_eq!(req.value, 0x1234);
        assert_eq!(req.index, 0);
        assert_eq!(req.length, 27);
    }

    #[test]
    fn test_stdreq_wire_order() {
        let req = StdRequest::new(
            UsbDirection::In,
            RequestType::Standard,
            Recipient::Device,
            Request::GET_DESCRIPTOR,
            0x0102,
            0x0304,
            0x0506,
        );
        assert_eq!(
            req.to_bytes(),
            [0x80, 0x06, 0x02, 0x01, 0x04, 0x03, 0x06, 0x05]
        );
    }

    #[test]
    fn test_device_id_packing() {
        let id = DeviceId::new(3, 1);
        assert_eq!(id.device(), 3);
        assert_eq!(id.interface(), 1);
        assert_eq!(DeviceId::new(0, 0).device(), 0);
    }

    #[test]
    fn test_ticket_wire() {
        assert_eq!(Ticket::Msg(1).to_wire(), 0x81);
        assert_eq!(Ticket::Stream(2).to_wire(), 0x02);
        assert_eq!(Ticket::from_wire(0x81), Ticket::Msg(1));
        assert_eq!(Ticket::from_wire(0x02), Ticket::Stream(2));
    }

    #[test]
    fn test_bcd_digits() {
        let bcd = Bcd16(0x1234);
        assert_eq!(bcd.to_digits(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_bcd_is_valid() {
        assert!(Bcd16::is_valid(0x1234));
        assert!(Bcd16::is_valid(0x9999));
        assert!(!Bcd16::is_valid(0xA000));
        assert!(!Bcd16::is_valid(0x0F09));
    }
}
