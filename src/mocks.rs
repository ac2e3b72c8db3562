//! A scripted host controller used by the whole-stack tests.
//!
//! `FakeController` models a small bus: up to four fake devices, one of
//! which sits on the root port; hub models forward resets and report port
//! status, and devices only answer on address 0 after *their* reset, so
//! the address-0 serialization the stack enforces is actually observable.

use crate::config::XFER_BUFFER_LEN;
use crate::error::{TransferStatus, UsbError};
use crate::hci::{DeviceInfo, HostController, PipeHandle};
use crate::pipe::{MessagePipe, Pipe};
use crate::types::{Speed, StdRequest, TransferType};
use usb_device::control::Request;

const MAX_MODELS: usize = 4;
const N_HW_PIPES: usize = 16;

/// Address meaning "not reachable until reset".
const NO_ADDR: u8 = 0xFF;

// Port status bits, mirroring USB 2.0 table 11-21.
pub const PORT_CONNECTION: u32 = 1 << 0;
pub const PORT_ENABLE: u32 = 1 << 1;
pub const PORT_POWER: u32 = 1 << 8;
pub const PORT_LOW_SPEED: u32 = 1 << 9;
pub const PORT_HIGH_SPEED: u32 = 1 << 10;
pub const PORT_C_CONNECTION: u32 = 1 << 16;
pub const PORT_C_RESET: u32 = 1 << 20;

// Configuration fixtures matching the templates in `config.rs`.

/// HID boot device, one interface, interrupt IN + OUT. 32 bytes.
pub const HID_CFG: &[u8] = &[
    9, 2, 32, 0, 1, 1, 0, 0xC0, 50, //
    9, 4, 0, 0, 2, 0x03, 1, 1, 0, //
    7, 5, 0x81, 0x03, 8, 0, 10, //
    7, 5, 0x01, 0x03, 8, 0, 10,
];

/// Same shape as [`HID_CFG`] but vendor-specific class: no driver matches.
pub const VENDOR_CFG: &[u8] = &[
    9, 2, 32, 0, 1, 1, 0, 0xC0, 50, //
    9, 4, 0, 0, 2, 0xFF, 0, 0, 0, //
    7, 5, 0x81, 0x03, 8, 0, 10, //
    7, 5, 0x01, 0x03, 8, 0, 10,
];

/// Endpoint count contradicting the 32-byte template (claims 1, has 2).
pub const BAD_EP_COUNT_CFG: &[u8] = &[
    9, 2, 32, 0, 1, 1, 0, 0xC0, 50, //
    9, 4, 0, 0, 1, 0x03, 1, 1, 0, //
    7, 5, 0x81, 0x03, 8, 0, 10, //
    7, 5, 0x01, 0x03, 8, 0, 10,
];

/// Single-interface hub, one status-change endpoint. 25 bytes.
pub const HUB_CFG: &[u8] = &[
    9, 2, 25, 0, 1, 1, 0, 0xE0, 50, //
    9, 4, 0, 0, 1, 0x09, 0, 0, 0, //
    7, 5, 0x81, 0x03, 1, 0, 12,
];

/// Boot keyboard with a HID class descriptor and one interrupt endpoint.
/// 34 bytes.
pub const KBD_CFG: &[u8] = &[
    9, 2, 34, 0, 1, 1, 0, 0xA0, 50, //
    9, 4, 0, 0, 1, 0x03, 1, 1, 0, //
    9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0, //
    7, 5, 0x81, 0x03, 8, 0, 10,
];

pub struct FakeHub {
    pub ports: u8,
    pub status: [u32; 4],
    /// Model index attached on each port.
    pub attached: [Option<usize>; 4],
}

pub struct FakeDevice {
    /// Current bus address; [`NO_ADDR`] until this device's port is reset.
    pub addr: u8,
    pub present: bool,
    pub dev_desc: [u8; 18],
    pub cfg: [u8; XFER_BUFFER_LEN],
    pub cfg_len: usize,
    /// Stall the next N control transfers served by this device.
    pub stall_next: u8,
    pub hub: Option<FakeHub>,
}

impl FakeDevice {
    pub fn with_config(vendor_id: u16, product_id: u16, cfg: &[u8]) -> Self {
        let mut dev_desc = [0u8; 18];
        dev_desc[0] = 18;
        dev_desc[1] = 1;
        dev_desc[2..4].copy_from_slice(&0x0200u16.to_le_bytes()); // bcdUSB
        dev_desc[7] = 64; // bMaxPacketSize0
        dev_desc[8..10].copy_from_slice(&vendor_id.to_le_bytes());
        dev_desc[10..12].copy_from_slice(&product_id.to_le_bytes());
        dev_desc[12..14].copy_from_slice(&0x0100u16.to_le_bytes()); // bcdDevice
        dev_desc[17] = 1; // bNumConfigurations

        let mut cfg_buf = [0u8; XFER_BUFFER_LEN];
        cfg_buf[..cfg.len()].copy_from_slice(cfg);
        Self {
            addr: NO_ADDR,
            present: false,
            dev_desc,
            cfg: cfg_buf,
            cfg_len: cfg.len(),
            stall_next: 0,
            hub: None,
        }
    }

    pub fn hub(ports: u8) -> Self {
        let mut model = Self::with_config(0x0424, 0x2514, HUB_CFG);
        model.hub = Some(FakeHub {
            ports,
            status: [0; 4],
            attached: [None; 4],
        });
        model
    }
}

#[derive(Copy, Clone)]
struct Flight {
    active: bool,
    status: TransferStatus,
    waits: u8,
    len: usize,
    data: [u8; XFER_BUFFER_LEN],
}

impl Flight {
    const fn idle() -> Self {
        Self {
            active: false,
            status: TransferStatus::Failed,
            waits: 0,
            len: 0,
            data: [0; XFER_BUFFER_LEN],
        }
    }
}

pub struct FakeController {
    pub connected: bool,
    pub root_speed: Speed,
    /// Model attached on the root port.
    pub root: usize,
    pub models: [Option<FakeDevice>; MAX_MODELS],
    /// Polls a transfer spends in `Wait` before settling.
    pub latency: u8,
    allocated: [bool; N_HW_PIPES],
    flights: [Flight; N_HW_PIPES],
    reset_polls_left: u8,
}

impl FakeController {
    pub fn new() -> Self {
        Self {
            connected: false,
            root_speed: Speed::Full,
            root: 0,
            models: [None, None, None, None],
            latency: 1,
            allocated: [false; N_HW_PIPES],
            flights: [Flight::idle(); N_HW_PIPES],
            reset_polls_left: 0,
        }
    }

    /// Number of hardware pipes currently handed out.
    pub fn allocated_pipes(&self) -> usize {
        self.allocated.iter().filter(|a| **a).count()
    }

    /// Connect `child` on `hub_model`'s port, reporting the given speed.
    pub fn plug(&mut self, hub_model: usize, port: usize, child: usize, speed: Speed) {
        let hub = self.models[hub_model].as_mut().unwrap().hub.as_mut().unwrap();
        hub.attached[port] = Some(child);
        hub.status[port] |= PORT_CONNECTION | PORT_C_CONNECTION;
        hub.status[port] &= !(PORT_LOW_SPEED | PORT_HIGH_SPEED);
        match speed {
            Speed::Low => hub.status[port] |= PORT_LOW_SPEED,
            Speed::High => hub.status[port] |= PORT_HIGH_SPEED,
            _ => {}
        }
        self.models[child].as_mut().unwrap().present = true;
    }

    /// Report a disconnection on `hub_model`'s port.
    pub fn unplug(&mut self, hub_model: usize, port: usize) {
        let hub = self.models[hub_model].as_mut().unwrap().hub.as_mut().unwrap();
        let child = hub.attached[port].take();
        hub.status[port] &= !PORT_CONNECTION;
        hub.status[port] |= PORT_C_CONNECTION;
        if let Some(child) = child {
            let model = self.models[child].as_mut().unwrap();
            model.present = false;
            model.addr = NO_ADDR;
        }
    }

    fn find_model(&self, addr: u8) -> Option<usize> {
        self.models
            .iter()
            .position(|m| m.as_ref().map(|m| m.present && m.addr == addr).unwrap_or(false))
    }

    /// Serve one control transfer addressed to `model`. Returns the reply
    /// data and final status.
    fn serve(&mut self, model: usize, setup: StdRequest) -> (usize, [u8; XFER_BUFFER_LEN], TransferStatus) {
        let mut data = [0u8; XFER_BUFFER_LEN];

        {
            let m = self.models[model].as_mut().unwrap();
            if m.stall_next > 0 {
                m.stall_next -= 1;
                return (0, data, TransferStatus::Stalled);
            }
        }

        // SET_FEATURE may touch the model attached downstream, handle it
        // outside the per-model borrow.
        if setup.request_type == 0x23 && setup.request == Request::SET_FEATURE {
            self.serve_set_feature(model, setup);
            return (0, data, TransferStatus::Complete);
        }

        let m = self.models[model].as_mut().unwrap();
        let wanted = setup.length as usize;
        let len = match (setup.request_type, setup.request) {
            (0x80, Request::GET_DESCRIPTOR) => match (setup.value >> 8) as u8 {
                1 => {
                    let len = wanted.min(m.dev_desc.len());
                    data[..len].copy_from_slice(&m.dev_desc[..len]);
                    len
                }
                2 => {
                    let len = wanted.min(m.cfg_len);
                    data[..len].copy_from_slice(&m.cfg[..len]);
                    len
                }
                _ => return (0, data, TransferStatus::Stalled),
            },
            (0x00, Request::SET_ADDRESS) => {
                m.addr = setup.value as u8;
                0
            }
            (0x00, Request::SET_CONFIGURATION) => 0,
            // Class: hub descriptor.
            (0xA0, Request::GET_DESCRIPTOR) if (setup.value >> 8) == 0x29 => {
                let Some(hub) = m.hub.as_ref() else {
                    return (0, data, TransferStatus::Stalled);
                };
                let desc = [9, 0x29, hub.ports, 0, 0, 0x32, 0, 0, 0];
                let len = wanted.min(desc.len());
                data[..len].copy_from_slice(&desc[..len]);
                len
            }
            // Class: port status.
            (0xA3, Request::GET_STATUS) => {
                let Some(hub) = m.hub.as_ref() else {
                    return (0, data, TransferStatus::Stalled);
                };
                let port = (setup.index as usize).saturating_sub(1);
                data[..4].copy_from_slice(&hub.status[port].to_le_bytes());
                4
            }
            // Class: clear port feature.
            (0x23, Request::CLEAR_FEATURE) => {
                let Some(hub) = m.hub.as_mut() else {
                    return (0, data, TransferStatus::Stalled);
                };
                let port = (setup.index as usize).saturating_sub(1);
                match setup.value {
                    16 => hub.status[port] &= !PORT_C_CONNECTION,
                    20 => hub.status[port] &= !PORT_C_RESET,
                    _ => {}
                }
                0
            }
            // Class, interface recipient: HID GET_REPORT (zeroed report).
            (0xA1, 0x01) => wanted,
            // Class, interface recipient: SET_IDLE / SET_PROTOCOL.
            (0x21, _) => 0,
            _ => return (0, data, TransferStatus::Stalled),
        };
        (len, data, TransferStatus::Complete)
    }

    fn serve_set_feature(&mut self, model: usize, setup: StdRequest) {
        let port = (setup.index as usize).saturating_sub(1);
        let mut reset_child = None;
        {
            let m = self.models[model].as_mut().unwrap();
            let Some(hub) = m.hub.as_mut() else { return };
            match setup.value {
                // PORT_POWER
                8 => hub.status[port] |= PORT_POWER,
                // PORT_RESET: the hub resets the downstream device, which
                // then answers on address 0.
                4 => {
                    hub.status[port] |= PORT_C_RESET | PORT_ENABLE;
                    reset_child = hub.attached[port];
                }
                _ => {}
            }
        }
        if let Some(child) = reset_child {
            if let Some(m) = self.models[child].as_mut() {
                m.addr = 0;
            }
        }
    }

    fn settle(&mut self, handle: PipeHandle) -> TransferStatus {
        let flight = &mut self.flights[handle.0 as usize];
        if !flight.active {
            return TransferStatus::Failed;
        }
        if flight.waits > 0 {
            flight.waits -= 1;
            return TransferStatus::Wait;
        }
        flight.status
    }
}

impl HostController for FakeController {
    fn init(&mut self) {}

    fn deinit(&mut self) {}

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn speed(&self) -> Speed {
        self.root_speed
    }

    fn reset_start(&mut self) {
        self.reset_polls_left = 1;
        if let Some(m) = self.models[self.root].as_mut() {
            m.present = true;
            m.addr = 0;
        }
    }

    fn reset_stop(&mut self) -> Result<(), UsbError> {
        if self.reset_polls_left > 0 {
            self.reset_polls_left -= 1;
            return Err(UsbError::Busy);
        }
        Ok(())
    }

    fn pipe_alloc(&mut self, _ty: TransferType) -> Option<PipeHandle> {
        let free = self.allocated.iter().position(|a| !*a)?;
        self.allocated[free] = true;
        Some(PipeHandle(free as u8))
    }

    fn pipe_dealloc(&mut self, handle: PipeHandle) {
        self.allocated[handle.0 as usize] = false;
    }

    fn pipe_configure(&mut self, _device: DeviceInfo, _pipe: &Pipe) -> Result<(), UsbError> {
        Ok(())
    }

    fn msg_pipe_configure(
        &mut self,
        _device: DeviceInfo,
        _pipe: &MessagePipe,
    ) -> Result<(), UsbError> {
        Ok(())
    }

    fn ctrlxfer_start(
        &mut self,
        device: DeviceInfo,
        pipe: &MessagePipe,
        _data_out: Option<&[u8]>,
    ) -> Result<(), UsbError> {
        let waits = self.latency;
        let (len, data, status) = match self.find_model(device.addr) {
            Some(model) => self.serve(model, pipe.setup),
            None => (0, [0; XFER_BUFFER_LEN], TransferStatus::Failed),
        };
        self.flights[pipe.handle.0 as usize] = Flight {
            active: true,
            status,
            waits,
            len,
            data,
        };
        Ok(())
    }

    fn ctrlxfer_cancel(&mut self, _device: DeviceInfo, pipe: &MessagePipe) {
        self.flights[pipe.handle.0 as usize].active = false;
    }

    fn ctrlxfer_status(&mut self, _device: DeviceInfo, pipe: &MessagePipe) -> TransferStatus {
        self.settle(pipe.handle)
    }

    fn xfer_start(
        &mut self,
        device: DeviceInfo,
        pipe: &Pipe,
        _data_out: Option<&[u8]>,
    ) -> Result<(), UsbError> {
        // Streaming endpoints reply with zeroed payloads.
        let status = if self.find_model(device.addr).is_some() {
            TransferStatus::Complete
        } else {
            TransferStatus::Failed
        };
        self.flights[pipe.handle.0 as usize] = Flight {
            active: true,
            status,
            waits: self.latency,
            len: pipe.length as usize,
            data: [0; XFER_BUFFER_LEN],
        };
        Ok(())
    }

    fn xfer_cancel(&mut self, _device: DeviceInfo, pipe: &Pipe) {
        self.flights[pipe.handle.0 as usize].active = false;
    }

    fn xfer_status(&mut self, _device: DeviceInfo, pipe: &Pipe) -> TransferStatus {
        self.settle(pipe.handle)
    }

    fn received_data(&self, handle: PipeHandle, len: usize) -> &[u8] {
        let flight = &self.flights[handle.0 as usize];
        &flight.data[..len.min(flight.len)]
    }
}
