//! Class-driver registry
//!
//! Drivers expose three entry points: *probe* (can this driver serve the
//! interface described by this descriptor?), *assign* (bind the interface)
//! and *remove* (unbind, called on device release). The registry below
//! lists every driver compiled into the stack, in priority order: earlier
//! entries are probed first, so a custom driver keyed to specific
//! vendor/product ids belongs above the generic one it specializes.
//!
//! The driver-owned state lives inside [`UsbStack`], so drivers can be
//! reached both from the interface-binding path and from the device state
//! machine (the HUB driver services port resets for downstream devices).

use crate::debug::*;
use crate::device::Device;
use crate::error::UsbError;
use crate::hci::HostController;
use crate::types::{DeviceId, MATCH_ANY_ID};
use crate::UsbStack;

pub mod hid;
pub mod hub;

/// Identifies a driver implementation.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverKind {
    Hub,
    Hid,
}

/// One registry entry: id filters plus the driver they select.
pub struct DriverEntry {
    /// Only probe devices matching this vendor id, [`MATCH_ANY_ID`] for all.
    pub vendor_id: u16,
    /// Only probe devices matching this product id, [`MATCH_ANY_ID`] for all.
    pub product_id: u16,
    pub kind: DriverKind,
}

impl DriverEntry {
    fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        (self.vendor_id == MATCH_ANY_ID || self.vendor_id == vendor_id)
            && (self.product_id == MATCH_ANY_ID || self.product_id == product_id)
    }
}

/// The registry. Order is priority.
pub static DRIVERS: &[DriverEntry] = &[
    DriverEntry {
        vendor_id: MATCH_ANY_ID,
        product_id: MATCH_ANY_ID,
        kind: DriverKind::Hub,
    },
    DriverEntry {
        vendor_id: MATCH_ANY_ID,
        product_id: MATCH_ANY_ID,
        kind: DriverKind::Hid,
    },
];

/// Probe registry entries from `offset` onwards against one interface.
///
/// `buffer` spans the interface descriptor and everything up to the next
/// interface (endpoints, class-specific descriptors). Returns the registry
/// index of the first driver that accepts, or `NoDriver` on exhaustion.
/// Callers that want to try drivers after a failed assignment pass the
/// failing index plus one as `offset`.
pub(crate) fn probe(device: &Device, offset: u8, buffer: &[u8]) -> Result<u8, UsbError> {
    for (index, entry) in DRIVERS.iter().enumerate().skip(offset as usize) {
        if !entry.matches(device.vendor_id, device.product_id) {
            continue;
        }
        let accepted = match entry.kind {
            DriverKind::Hub => hub::probe(buffer),
            DriverKind::Hid => hid::probe(buffer),
        };
        if accepted {
            return Ok(index as u8);
        }
    }
    Err(UsbError::NoDriver)
}

/// Bind an interface to the driver that won the probe.
pub(crate) fn assign<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
    buffer: &[u8],
    handle: u8,
) -> Result<(), UsbError> {
    let entry = DRIVERS.get(handle as usize).ok_or(UsbError::InvParam)?;
    trace!("assigning driver {} to {}", handle, id);
    match entry.kind {
        DriverKind::Hub => hub::assign(stack, id, buffer),
        DriverKind::Hid => hid::assign(stack, id, buffer),
    }
}

/// Unbind an interface. The driver shuts down any transfer it owns; the
/// core deallocates the interface's endpoints afterwards.
pub(crate) fn remove<H: HostController>(
    stack: &mut UsbStack<H>,
    id: DeviceId,
    handle: u8,
) -> Result<(), UsbError> {
    let entry = DRIVERS.get(handle as usize).ok_or(UsbError::InvParam)?;
    match entry.kind {
        DriverKind::Hub => hub::remove(stack, id),
        DriverKind::Hid => hid::remove(stack, id),
    }
}
