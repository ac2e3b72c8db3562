//! HUB class driver
//!
//! Besides the regular probe/assign/remove contract, the HUB driver offers
//! port services to the device state machine: downstream devices are reset
//! and speed-read through their parent HUB's ports instead of the root
//! port.
//!
//! All HUB traffic is ordinary class-specific control transfers submitted
//! through the IRP interface, one outstanding request per HUB. [`update`]
//! advances every HUB by at most one step per call: read the HUB
//! descriptor, power the ports, then cycle through the ports polling their
//! status, acknowledging changes and carrying out pending reset requests.

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

use crate::config::{MAX_HUBS, MAX_HUB_PORTS};
use crate::debug::*;
use crate::descriptor;
use crate::device::Parent;
use crate::error::{IrpStatus, UsbError};
use crate::hci::HostController;
use crate::types::{DeviceId, Speed, StdRequest, Ticket};
use crate::UsbStack;

/// bInterfaceClass of a HUB.
pub const CLASS_HUB: u8 = 0x09;

/// bDescriptorType of the class-specific HUB descriptor.
const TYPE_HUB_DESCRIPTOR: u8 = 0x29;

/// Port features for SET_FEATURE / CLEAR_FEATURE, per USB 2.0 table 11-17.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    Power = 8,
    LowSpeed = 9,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
}

/// wPortStatus + wPortChange, as returned by GET_STATUS on a port.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortStatus(u32);

impl PortStatus {
    const CONNECTION: u32 = 1 << 0;
    const LOW_SPEED: u32 = 1 << 9;
    const HIGH_SPEED: u32 = 1 << 10;
    const C_CONNECTION: u32 = 1 << 16;
    const C_RESET: u32 = 1 << 20;

    pub(crate) fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != 4 {
            return None;
        }
        Some(Self(
            (data[0] as u32)
                | ((data[1] as u32) << 8)
                | ((data[2] as u32) << 16)
                | ((data[3] as u32) << 24),
        ))
    }

    pub fn connected(self) -> bool {
        self.0 & Self::CONNECTION != 0
    }

    pub fn connection_changed(self) -> bool {
        self.0 & Self::C_CONNECTION != 0
    }

    pub fn reset_changed(self) -> bool {
        self.0 & Self::C_RESET != 0
    }

    pub fn speed(self) -> Speed {
        if self.0 & Self::LOW_SPEED != 0 {
            Speed::Low
        } else if self.0 & Self::HIGH_SPEED != 0 {
            Speed::High
        } else {
            Speed::Full
        }
    }
}

/// Request in flight for one HUB.
#[derive(Copy, Clone, PartialEq)]
enum HubOp {
    ReadDescriptor,
    PowerPort(u8),
    ResetPort(u8),
    ReadPortStatus(u8),
    ClearFeature(u8, PortFeature),
}

#[derive(Copy, Clone)]
pub(crate) struct HubSlot {
    active: bool,
    /// Device index of the HUB itself.
    device: u8,
    interface: u8,
    /// Number of downstream ports, 0 until the HUB descriptor is read.
    ports: u8,
    /// Ports already powered (bit per port).
    powered: u8,
    /// Ports the state machine asked to reset.
    reset_pending: u8,
    /// Ports with SET_FEATURE(PORT_RESET) already issued.
    reset_sent: u8,
    /// Ports whose reset completed; consumed by `port_reset_status`.
    reset_done: u8,
    /// Last observed status per port.
    status: [PortStatus; MAX_HUB_PORTS],
    op: Option<(HubOp, Ticket)>,
    /// Round-robin status poll cursor.
    poll_port: u8,
}

impl HubSlot {
    const fn vacant() -> Self {
        Self {
            active: false,
            device: 0,
            interface: 0,
            ports: 0,
            powered: 0,
            reset_pending: 0,
            reset_sent: 0,
            reset_done: 0,
            status: [PortStatus(0); MAX_HUB_PORTS],
            op: None,
            poll_port: 0,
        }
    }

    fn next_unpowered(&self) -> Option<u8> {
        (0..self.ports).find(|p| self.powered & (1 << p) == 0)
    }

    fn next_reset_request(&self) -> Option<u8> {
        (0..self.ports).find(|p| {
            self.reset_pending & (1 << p) != 0 && self.reset_sent & (1 << p) == 0
        })
    }
}

pub(crate) struct HubPool {
    slots: [HubSlot; MAX_HUBS],
}

impl HubPool {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [HubSlot::vacant(); MAX_HUBS],
        }
    }

    fn slot_for_device(&mut self, device: u8) -> Option<&mut HubSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.active && s.device == device)
    }
}

/// Probe: accept any interface of the HUB class.
pub(crate) fn probe(buffer: &[u8]) -> bool {
    let Ok((_, desc)) = descriptor::parse::any_descriptor(buffer) else {
        return false;
    };
    if desc.descriptor_type != descriptor::TYPE_INTERFACE {
        return false;
    }
    match descriptor::parse::interface_descriptor(desc.data) {
        Ok((_, iface)) => iface.interface_class == CLASS_HUB,
        Err(_) => false,
    }
}

pub(crate) fn assign<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
    _buffer: &[u8],
) -> Result<(), UsbError> {
    let slot = stack
        .hubs
        .slots
        .iter_mut()
        .find(|s| !s.active)
        .ok_or(UsbError::Busy)?;
    *slot = HubSlot::vacant();
    slot.active = true;
    slot.device = id.device();
    slot.interface = id.interface();
    info!("hub bound: device {}", id.device());
    Ok(())
}

pub(crate) fn remove<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
) -> Result<(), UsbError> {
    let Some(slot) = stack.hubs.slot_for_device(id.device()) else {
        return Err(UsbError::InvParam);
    };
    let pending = slot.op.take();
    *slot = HubSlot::vacant();
    if let Some((_, ticket)) = pending {
        let _ = stack.irp_cancel(id, ticket);
    }
    Ok(())
}

/// Advance every HUB by at most one step. Called from the host
/// orchestrator after the per-device state machines have run.
pub(crate) fn update<H: HostController>(stack: &mut UsbStack<H>) {
    for index in 0..MAX_HUBS {
        let mut slot = stack.hubs.slots[index];
        if !slot.active || !stack.devices[slot.device as usize].initialized {
            continue;
        }
        step(stack, index as u8, &mut slot);
        stack.hubs.slots[index] = slot;
    }
}

fn step<H: HostController>(stack: &mut UsbStack<H>, hub: u8, slot: &mut HubSlot) {
    let id = DeviceId::new(slot.device, slot.interface);

    if let Some((op, ticket)) = slot.op {
        match stack.irp_status(id, ticket) {
            Ok(IrpStatus::Pending) => {}
            Ok(IrpStatus::Complete) => {
                slot.op = None;
                if let Some(followup) = complete(stack, hub, slot, op) {
                    submit(stack, id, slot, followup);
                }
            }
            Err(e) => {
                // Drop the request; the next pass issues a fresh one.
                debug!("hub {} request failed: {}", hub, e);
                slot.op = None;
            }
        }
        return;
    }

    let op = if slot.ports == 0 {
        HubOp::ReadDescriptor
    } else if let Some(port) = slot.next_unpowered() {
        HubOp::PowerPort(port)
    } else if let Some(port) = slot.next_reset_request() {
        HubOp::ResetPort(port)
    } else {
        let port = slot.poll_port;
        slot.poll_port = (port + 1) % slot.ports;
        HubOp::ReadPortStatus(port)
    };
    submit(stack, id, slot, op);
}

fn submit<H: HostController>(stack: &mut UsbStack<H>, id: DeviceId, slot: &mut HubSlot, op: HubOp) {
    // Ports are 0-based here; wIndex counts them from 1.
    let req = match op {
        HubOp::ReadDescriptor => StdRequest::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Device,
            Request::GET_DESCRIPTOR,
            (TYPE_HUB_DESCRIPTOR as u16) << 8,
            0,
            8,
        ),
        HubOp::PowerPort(port) => StdRequest::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Other,
            Request::SET_FEATURE,
            PortFeature::Power as u16,
            port as u16 + 1,
            0,
        ),
        HubOp::ResetPort(port) => StdRequest::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Other,
            Request::SET_FEATURE,
            PortFeature::Reset as u16,
            port as u16 + 1,
            0,
        ),
        HubOp::ReadPortStatus(port) => StdRequest::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Other,
            Request::GET_STATUS,
            0,
            port as u16 + 1,
            4,
        ),
        HubOp::ClearFeature(port, feature) => StdRequest::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Other,
            Request::CLEAR_FEATURE,
            feature as u16,
            port as u16 + 1,
            0,
        ),
    };

    match stack.ctrl_irp(id, &req, None) {
        Ok(ticket) => slot.op = Some((op, ticket)),
        // All message pipes taken; retry on the next pass.
        Err(UsbError::Busy) => {}
        Err(e) => debug!("hub request not accepted: {}", e),
    }
}

/// Handle a finished request; may return a follow-up to submit right away.
fn complete<H: HostController>(
    stack: &mut UsbStack<H>,
    hub: u8,
    slot: &mut HubSlot,
    op: HubOp,
) -> Option<HubOp> {
    match op {
        HubOp::ReadDescriptor => {
            let data = stack.devices[slot.device as usize].control_data();
            if data.len() < 3 || data[1] != TYPE_HUB_DESCRIPTOR {
                debug!("hub {}: bad hub descriptor", hub);
                return None;
            }
            slot.ports = data[2].min(MAX_HUB_PORTS as u8);
            info!("hub {}: {} ports", hub, slot.ports);
            None
        }
        HubOp::PowerPort(port) => {
            slot.powered |= 1 << port;
            None
        }
        HubOp::ResetPort(port) => {
            slot.reset_sent |= 1 << port;
            None
        }
        HubOp::ReadPortStatus(port) => {
            let status =
                PortStatus::from_bytes(stack.devices[slot.device as usize].control_data())?;
            slot.status[port as usize] = status;

            if status.connection_changed() {
                if status.connected() {
                    if stack.device_on_port(hub, port).is_none() {
                        trace!("hub {} port {}: connected", hub, port);
                        if stack
                            .device_attach(Parent::Port { hub, port })
                            .is_none()
                        {
                            warn!("hub {} port {}: no free device slot", hub, port);
                        }
                    }
                } else {
                    trace!("hub {} port {}: disconnected", hub, port);
                    stack.release_from_port(hub, port);
                }
                return Some(HubOp::ClearFeature(port, PortFeature::CConnection));
            }
            if status.reset_changed() {
                let bit = 1 << port;
                slot.reset_done |= bit;
                slot.reset_pending &= !bit;
                slot.reset_sent &= !bit;
                return Some(HubOp::ClearFeature(port, PortFeature::CReset));
            }
            None
        }
        HubOp::ClearFeature(..) => None,
    }
}

/// Ask the HUB to drive a USB reset on one of its ports. The result is
/// picked up later through [`port_reset_status`].
pub(crate) fn port_reset_start<H: HostController>(stack: &mut UsbStack<H>, hub: u8, port: u8) {
    if let Some(slot) = stack.hubs.slots.get_mut(hub as usize) {
        slot.reset_pending |= 1 << port;
        slot.reset_done &= !(1 << port);
    }
}

/// Poll a previously requested port reset. `Busy` while the HUB is still
/// working on it.
pub(crate) fn port_reset_status<H: HostController>(
    stack: &mut UsbStack<H>,
    hub: u8,
    port: u8,
) -> Result<(), UsbError> {
    let slot = stack.hubs.slots.get_mut(hub as usize).ok_or(UsbError::InvParam)?;
    let bit = 1 << port;
    if slot.reset_done & bit != 0 {
        slot.reset_done &= !bit;
        Ok(())
    } else {
        Err(UsbError::Busy)
    }
}

/// Speed of the device on a HUB port, from the last observed port status.
pub(crate) fn port_speed<H: HostController>(stack: &UsbStack<H>, hub: u8, port: u8) -> Speed {
    match stack.hubs.slots.get(hub as usize) {
        Some(slot) if slot.active => slot.status[port as usize].speed(),
        _ => Speed::Invalid,
    }
}

/// Device index backing a HUB slot, used to resolve downstream parent
/// references.
pub(crate) fn device_index<H: HostController>(stack: &UsbStack<H>, hub: u8) -> Option<u8> {
    match stack.hubs.slots.get(hub as usize) {
        Some(slot) if slot.active => Some(slot.device),
        _ => None,
    }
}

/// Bus address of the HUB backing a slot.
pub fn address<H: HostController>(stack: &UsbStack<H>, hub: u8) -> Option<u8> {
    device_index(stack, hub).map(|d| stack.devices[d as usize].addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_status_bits() {
        let status = PortStatus::from_bytes(&[0x01, 0x02, 0x01, 0x00]).unwrap();
        assert!(status.connected());
        assert!(status.connection_changed());
        assert!(!status.reset_changed());
        assert_eq!(status.speed(), Speed::Low);

        let status = PortStatus::from_bytes(&[0x01, 0x04, 0x10, 0x00]).unwrap();
        assert_eq!(status.speed(), Speed::High);
        assert!(status.reset_changed());

        assert!(PortStatus::from_bytes(&[0, 0]).is_none());
    }

    #[test]
    fn test_probe_matches_hub_class() {
        let hub_iface = [9, 4, 0, 0, 1, CLASS_HUB, 0, 0, 0];
        assert!(probe(&hub_iface));
        let hid_iface = [9, 4, 0, 0, 1, 0x03, 1, 1, 0];
        assert!(!probe(&hid_iface));
        assert!(!probe(&[9, 2, 25, 0, 1, 1, 0, 0xC0, 50]));
        assert!(!probe(&[]));
    }
}
