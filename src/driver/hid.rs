//! HID class driver (boot protocol)
//!
//! Keeps track of bound HID interfaces and offers the class requests a
//! boot-protocol host needs: idle rate, protocol selection and report
//! reads. Report traffic itself goes through the generic IRP interface,
//! either as GET_REPORT control transfers or on the interface's interrupt
//! IN pipe.

use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

use crate::debug::*;
use crate::descriptor;
use crate::error::UsbError;
use crate::hci::HostController;
use crate::types::{Direction, DeviceId, StdRequest, Ticket, TransferType};
use crate::UsbStack;

/// bInterfaceClass of a HID device.
pub const CLASS_HID: u8 = 0x03;

/// bInterfaceProtocol values for boot devices.
pub const PROTOCOL_KEYBOARD: u8 = 1;
pub const PROTOCOL_MOUSE: u8 = 2;

/// Bound HID interfaces the driver can track.
const MAX_HIDS: usize = 2;

/// Size of a boot input report.
pub const BOOT_REPORT_LEN: u16 = 8;

const GET_REPORT: u8 = 0x01;
const SET_IDLE: u8 = 0x0A;
const SET_PROTOCOL: u8 = 0x0B;

const REPORT_TYPE_INPUT: u16 = 0x01;

#[derive(Copy, Clone)]
struct HidSlot {
    active: bool,
    device: u8,
    interface: u8,
    protocol: u8,
}

impl HidSlot {
    const fn vacant() -> Self {
        Self {
            active: false,
            device: 0,
            interface: 0,
            protocol: 0,
        }
    }
}

pub(crate) struct HidPool {
    slots: [HidSlot; MAX_HIDS],
}

impl HidPool {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [HidSlot::vacant(); MAX_HIDS],
        }
    }

    fn slot_for(&self, id: DeviceId) -> Option<&HidSlot> {
        self.slots
            .iter()
            .find(|s| s.active && s.device == id.device() && s.interface == id.interface())
    }
}

/// Probe: accept any interface of the HID class.
pub(crate) fn probe(buffer: &[u8]) -> bool {
    let Ok((_, desc)) = descriptor::parse::any_descriptor(buffer) else {
        return false;
    };
    if desc.descriptor_type != descriptor::TYPE_INTERFACE {
        return false;
    }
    match descriptor::parse::interface_descriptor(desc.data) {
        Ok((_, iface)) => iface.interface_class == CLASS_HID,
        Err(_) => false,
    }
}

pub(crate) fn assign<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
    _buffer: &[u8],
) -> Result<(), UsbError> {
    let protocol =
        stack.devices[id.device() as usize].interfaces[id.interface() as usize].protocol;
    let slot = stack
        .hid
        .slots
        .iter_mut()
        .find(|s| !s.active)
        .ok_or(UsbError::Busy)?;
    slot.active = true;
    slot.device = id.device();
    slot.interface = id.interface();
    slot.protocol = protocol;
    info!("hid bound: device {} protocol {}", id.device(), protocol);
    Ok(())
}

pub(crate) fn remove<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
) -> Result<(), UsbError> {
    for slot in stack.hid.slots.iter_mut() {
        if slot.active && slot.device == id.device() && slot.interface == id.interface() {
            *slot = HidSlot::vacant();
            return Ok(());
        }
    }
    Err(UsbError::InvParam)
}

/// Boot protocol of a bound interface (keyboard/mouse), if any.
pub fn protocol<H: HostController>(stack: &UsbStack<H>, id: DeviceId) -> Option<u8> {
    stack.hid.slot_for(id).map(|s| s.protocol)
}

/// Select the boot protocol on the interface.
pub fn set_boot_protocol<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
) -> Result<Ticket, UsbError> {
    stack.hid.slot_for(id).ok_or(UsbError::InvParam)?;
    let req = StdRequest::new(
        UsbDirection::Out,
        RequestType::Class,
        Recipient::Interface,
        SET_PROTOCOL,
        0, // boot protocol
        id.interface() as u16,
        0,
    );
    stack.ctrl_irp(id, &req, None)
}

/// Stop the device from resending unchanged reports.
pub fn set_idle<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
) -> Result<Ticket, UsbError> {
    stack.hid.slot_for(id).ok_or(UsbError::InvParam)?;
    let req = StdRequest::new(
        UsbDirection::Out,
        RequestType::Class,
        Recipient::Interface,
        SET_IDLE,
        0, // indefinite, all reports
        id.interface() as u16,
        0,
    );
    stack.ctrl_irp(id, &req, None)
}

/// Request an input report over the control pipe.
///
/// The report lands in the device's control buffer
/// ([`UsbStack::control_data`]) once the returned ticket completes.
pub fn request_report<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
) -> Result<Ticket, UsbError> {
    stack.hid.slot_for(id).ok_or(UsbError::InvParam)?;
    let req = StdRequest::new(
        UsbDirection::In,
        RequestType::Class,
        Recipient::Interface,
        GET_REPORT,
        REPORT_TYPE_INPUT << 8,
        id.interface() as u16,
        BOOT_REPORT_LEN,
    );
    stack.ctrl_irp(id, &req, None)
}

/// Arm a report read on the interface's interrupt IN pipe.
///
/// Poll the returned ticket with [`UsbStack::irp_status`]; the report is
/// then available through [`UsbStack::stream_data`].
pub fn poll_report<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
) -> Result<Ticket, UsbError> {
    stack.hid.slot_for(id).ok_or(UsbError::InvParam)?;
    let iface = &stack.devices[id.device() as usize].interfaces[id.interface() as usize];
    let pipe_idx = iface
        .endpoints
        .iter()
        .take(iface.n_endpoints as usize)
        .position(|p| p.ty == TransferType::Interrupt && p.dir == Direction::In)
        .ok_or(UsbError::InvParam)? as u8;
    stack.irp(id, pipe_idx, None, BOOT_REPORT_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_matches_hid_class() {
        let kbd = [9, 4, 0, 0, 1, CLASS_HID, 1, PROTOCOL_KEYBOARD, 0];
        assert!(probe(&kbd));
        let hub = [9, 4, 0, 0, 1, 0x09, 0, 0, 0];
        assert!(!probe(&hub));
        assert!(!probe(&[7, 5, 0x81, 3, 8, 0, 10]));
    }
}
