//! Per-device bookkeeping: state machine position, addressing, interfaces.

use crate::config::{MAX_ENDPOINTS, MAX_INTERFACES, XFER_BUFFER_LEN};
use crate::hci::DeviceInfo;
use crate::pipe::Pipe;
use crate::types::{Speed, Ticket};

/// Address stored while no address has been assigned (the in-band value 0
/// is reserved for the USB default state during enumeration).
pub const UNASSIGNED_ADDR: u8 = 0xFF;

/// Protocol number stored in released interfaces.
const NO_PROTOCOL: u8 = 255;

/// Positions of the per-device enumeration state machine.
///
/// These are the USB 2.0 device states, plus `Disconnected` for an empty
/// slot and a few internal stops used while enumerating. The machine is
/// non-blocking: every long operation is parked in `WaitDelay` (timed) or
/// stays in place polling an in-flight transfer.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// No device in this slot
    Disconnected,
    /// Attached, waiting for the power rail to settle
    Attached,
    /// Waiting for `ticks_delay`, then falls through to `next_state`
    WaitDelay,
    /// Powered, waiting to own address 0 and drive a USB reset
    Powered,
    /// Reset being driven (by the root port or the parent HUB's port)
    Reset,
    /// Default state: read speed, talk on address 0 with an 8-byte MPS
    Default,
    /// Probing the real max packet size of endpoint 0
    Mps,
    /// SET_ADDRESS in flight
    Address,
    /// Reading the full device descriptor
    DevDesc,
    /// Reading the 9-byte configuration descriptor header
    CfgDescHeader,
    /// Reading the full configuration descriptor, then binding drivers
    CfgDesc,
    /// SET_CONFIGURATION in flight
    SetCfg,
    /// Releasing the address-0 lock, marking the device initialized
    Unlock,
    /// Enumeration finished; user IRPs accepted
    Configured,
    /// Reserved
    Suspended,
}

/// Driver binding of an interface.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Binding {
    /// No driver accepted the interface; it stays addressable so user code
    /// can inspect why.
    None,
    /// Registry index of the bound driver.
    Driver(u8),
    /// A driver matched but endpoint allocation or assignment failed.
    Failed,
}

/// Where a device hangs off the bus.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parent {
    /// Directly on the root port.
    Root,
    /// Downstream of a HUB: HUB driver slot plus port number.
    Port { hub: u8, port: u8 },
}

/// One functional unit of a device.
///
/// Endpoints are instantiated as pipes: even though they are endpoints on
/// the device end, the host reaches them through local pipes, and an
/// interface cannot be used without its pipes configured.
#[derive(Copy, Clone)]
pub struct Interface {
    pub endpoints: [Pipe; MAX_ENDPOINTS],
    pub n_endpoints: u8,
    pub driver: Binding,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl Interface {
    pub(crate) const fn vacant() -> Self {
        Self {
            endpoints: [Pipe::vacant(); MAX_ENDPOINTS],
            n_endpoints: 0,
            driver: Binding::None,
            class: 0,
            subclass: 0,
            protocol: NO_PROTOCOL,
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::vacant();
    }
}

/// One enumerated (or enumerating) USB device.
pub struct Device {
    pub state: DeviceState,
    /// State entered when the current wait (delay, reset, transfer)
    /// completes.
    pub next_state: DeviceState,
    pub speed: Speed,
    /// Assigned address; 0 while in default state, [`UNASSIGNED_ADDR`]
    /// before that.
    pub addr: u8,
    /// Max packet size of endpoint 0.
    pub mps0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bConfigurationValue selected during enumeration.
    pub cfg_value: u8,
    /// Maximum power draw, in 2 mA units.
    pub max_power: u8,
    /// Ticket of the control transfer currently in flight for enumeration.
    pub ticket: Option<Ticket>,
    /// Tick count at which the current `WaitDelay` expires.
    pub ticks_delay: u16,
    /// Scratch buffer for this device's control transfers; also holds the
    /// configuration descriptor once read.
    pub xfer_buffer: [u8; XFER_BUFFER_LEN],
    /// Valid bytes in `xfer_buffer`.
    pub xfer_length: u16,
    pub interfaces: [Interface; MAX_INTERFACES],
    pub parent: Parent,
    /// Configuration-template slot matched during enumeration.
    pub cte_index: Option<u8>,

    // Status flags
    pub active: bool,
    pub initialized: bool,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    /// Set while enumeration is parked in `Powered` waiting for the
    /// address-0 lock.
    pub waiting_addr0: bool,
    /// Set while this device owns the address-0 lock.
    pub holds_addr0: bool,
    /// Set when the state machine must submit a new control request (as
    /// opposed to polling the one in flight).
    pub request_pending: bool,
}

impl Device {
    pub(crate) const fn new() -> Self {
        Self {
            state: DeviceState::Disconnected,
            next_state: DeviceState::Disconnected,
            speed: Speed::Invalid,
            addr: UNASSIGNED_ADDR,
            mps0: 0,
            vendor_id: 0,
            product_id: 0,
            cfg_value: 0,
            max_power: 0,
            ticket: None,
            ticks_delay: 0,
            xfer_buffer: [0; XFER_BUFFER_LEN],
            xfer_length: 0,
            interfaces: [Interface::vacant(); MAX_INTERFACES],
            parent: Parent::Root,
            cte_index: None,
            active: false,
            initialized: false,
            self_powered: false,
            remote_wakeup: false,
            waiting_addr0: false,
            holds_addr0: false,
            request_pending: false,
        }
    }

    /// Put the slot back into its default state.
    pub(crate) fn reset(&mut self, ticks: u16) {
        *self = Self::new();
        self.ticks_delay = ticks;
    }

    /// Addressing snapshot handed to the host controller with transfers.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            addr: if self.addr == UNASSIGNED_ADDR { 0 } else { self.addr },
            speed: self.speed,
            mps0: self.mps0,
        }
    }

    /// Move to `state`, with `next_state` queued behind whatever wait
    /// `state` performs. Also flags that the next control transfer must be
    /// submitted fresh.
    pub(crate) fn enter(&mut self, state: DeviceState, next_state: DeviceState) {
        self.request_pending = true;
        self.state = state;
        self.next_state = next_state;
    }

    /// Fall through to the queued `next_state`.
    pub(crate) fn advance(&mut self) {
        self.enter(self.next_state, self.next_state);
    }

    /// Data received by the device's most recent control transfer.
    pub fn control_data(&self) -> &[u8] {
        &self.xfer_buffer[..self.xfer_length as usize]
    }
}
