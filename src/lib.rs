#![no_std]

//! Host-side USB stack core
//!
//! [`UsbStack`] owns a fixed set of device slots, a small pool of shared
//! message (control) pipes, and the class-driver state. It is generic over
//! a [`HostController`](hci::HostController) implementation, which does the
//! actual bus work.
//!
//! The stack is strictly non-blocking and single-threaded: call
//! [`run`](UsbStack::run) from a task or main loop (about once per
//! millisecond) and feed the tick counter through [`tick`](UsbStack::tick).
//! Each `run` detects root connect/disconnect, advances every active
//! device's enumeration state machine by one step, and lets the HUB driver
//! maintain downstream topology. Once a device reports `Configured`,
//! transfers can be submitted to it through the IRP interface
//! ([`ctrl_irp`](UsbStack::ctrl_irp), [`irp`](UsbStack::irp)) and polled
//! via [`irp_status`](UsbStack::irp_status).

pub mod config;
pub mod descriptor;
pub mod device;
pub mod driver;
pub mod error;
pub mod hci;
pub mod pipe;
pub mod types;

mod debug;
mod enumeration;

#[cfg(test)]
mod mocks;

use usb_device::UsbDirection;

use crate::config::{MAX_DEVICES, MAX_RETRIES, N_CTRL_PIPES, TASK_INTERVAL_MS, XFER_BUFFER_LEN};
use crate::debug::*;
use crate::device::{Binding, Device, DeviceState, Parent};
use crate::driver::{hid::HidPool, hub::HubPool};
use crate::hci::HostController;
use crate::pipe::MessagePipe;
use crate::types::{DeviceId, Speed, StdRequest, Ticket, TransferType};

pub use crate::error::{IrpStatus, TransferStatus, UsbError};

/// Host-level state: everything else is per-device.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostState {
    /// Waiting for a device connection on the root port.
    Idle,
    /// At least one device connected and being serviced.
    Running,
    /// Reserved.
    Suspended,
}

/// The USB host stack.
pub struct UsbStack<H> {
    pub(crate) hci: H,
    state: HostState,
    pub(crate) devices: [Device; MAX_DEVICES],
    msg_pipes: [MessagePipe; N_CTRL_PIPES],
    ticks: u16,
    n_devices: u8,
    /// Set while some device is using address 0 to enumerate.
    pub(crate) addr0_taken: bool,
    pub(crate) hubs: HubPool,
    pub(crate) hid: HidPool,
}

impl<H: HostController> UsbStack<H> {
    /// Bring up the controller and claim the configured number of message
    /// pipes from it.
    ///
    /// Failing to obtain the message pipes is a build configuration error
    /// (the controller offers fewer control pipes than
    /// [`N_CTRL_PIPES`](config::N_CTRL_PIPES)) and reported as `HciInit`.
    pub fn new(mut hci: H) -> Result<Self, UsbError> {
        hci.init();

        let mut msg_pipes = [MessagePipe::vacant(); N_CTRL_PIPES];
        for pipe in msg_pipes.iter_mut() {
            pipe.handle = hci
                .pipe_alloc(TransferType::Control)
                .ok_or(UsbError::HciInit)?;
        }

        Ok(Self {
            hci,
            state: HostState::Idle,
            devices: core::array::from_fn(|_| Device::new()),
            msg_pipes,
            ticks: 0,
            n_devices: 0,
            addr0_taken: false,
            hubs: HubPool::new(),
            hid: HidPool::new(),
        })
    }

    /// Release every active device and shut the controller down.
    pub fn deinit(&mut self) {
        for index in 0..MAX_DEVICES as u8 {
            if self.devices[index as usize].active {
                self.device_release(index);
            }
        }
        self.state = HostState::Idle;
        self.hci.deinit();
    }

    /// Advance the millisecond tick counter and return it.
    pub fn tick(&mut self, increment_ms: u16) -> u16 {
        self.ticks = self.ticks.wrapping_add(increment_ms);
        self.ticks
    }

    pub fn ticks(&self) -> u16 {
        self.ticks
    }

    pub fn host_state(&self) -> HostState {
        self.state
    }

    pub fn device_count(&self) -> u8 {
        self.n_devices
    }

    pub fn addr0_locked(&self) -> bool {
        self.addr0_taken
    }

    /// Read-only view of one device slot.
    pub fn device(&self, index: u8) -> Option<&Device> {
        self.devices.get(index as usize)
    }

    pub fn device_is_active(&self, index: u8) -> bool {
        self.devices
            .get(index as usize)
            .map(|d| d.active)
            .unwrap_or(false)
    }

    /// One iteration of the host loop.
    pub fn run(&mut self) {
        match self.state {
            HostState::Idle => {
                if self.hci.is_connected() {
                    // The root device always lands in slot 0: nothing else
                    // can be attached while the stack is idle.
                    let index = self.device_attach(Parent::Root);
                    debug_assert_eq!(index, Some(0));
                    self.state = HostState::Running;
                    info!("root device connected");
                }
            }
            HostState::Running => {
                if self.n_devices == 0 {
                    self.state = HostState::Idle;
                } else if !self.hci.is_connected() {
                    // Root went away: everything hangs off it.
                    info!("root device disconnected");
                    self.device_release(0);
                    self.state = HostState::Idle;
                } else {
                    for index in 0..MAX_DEVICES as u8 {
                        if !self.devices[index as usize].active {
                            continue;
                        }
                        if let Err(e) = enumeration::update_device(self, index) {
                            if e.is_fatal() {
                                error!("dev {}: fatal {}, releasing", index, e);
                                self.device_release(index);
                            }
                        }
                    }
                    driver::hub::update(self);
                }
            }
            HostState::Suspended => {}
        }
    }

    /************************ Device lifecycle ********************************/

    /// Claim the lowest free slot for a newly detected device and start its
    /// enumeration. Returns `None` when every slot is taken.
    pub fn device_attach(&mut self, parent: Parent) -> Option<u8> {
        let index = self.devices.iter().position(|d| !d.active)? as u8;
        self.n_devices += 1;
        let pdev = &mut self.devices[index as usize];
        pdev.active = true;
        pdev.state = DeviceState::Attached;
        pdev.next_state = DeviceState::Attached;
        pdev.parent = parent;
        pdev.cte_index = None;
        trace!("dev {}: attached", index);
        Some(index)
    }

    /// Tear a device down and return its slot to the default state.
    ///
    /// Recursive: a HUB's downstream devices are released first. Bound
    /// drivers are removed, endpoint pipes are deallocated, a held
    /// address-0 lock is freed and any control transfer still holding a
    /// message pipe is cancelled. Idempotent on an inactive slot.
    pub fn device_release(&mut self, index: u8) {
        if index as usize >= MAX_DEVICES || !self.devices[index as usize].active {
            return;
        }

        // Children first. Slot 0 is the root and can't be downstream.
        for child in 1..MAX_DEVICES as u8 {
            if child == index || !self.devices[child as usize].active {
                continue;
            }
            if let Parent::Port { hub, .. } = self.devices[child as usize].parent {
                if driver::hub::device_index(self, hub) == Some(index) {
                    self.device_release(child);
                }
            }
        }

        if let Some(cte) = self.devices[index as usize].cte_index {
            for iface in 0..config::interface_count(cte) {
                let binding = self.devices[index as usize].interfaces[iface as usize].driver;
                if let Binding::Driver(handle) = binding {
                    let _ = driver::remove(self, DeviceId::new(index, iface), handle);
                    self.release_interface_endpoints(index, iface);
                }
                self.devices[index as usize].interfaces[iface as usize].clear();
            }
        }

        // Mid-enumeration teardown: free the shared address-0 lock so
        // others can enumerate.
        if self.devices[index as usize].holds_addr0 {
            self.addr0_taken = false;
        }

        // And drop any message pipe still locked for this device.
        for slot in 0..N_CTRL_PIPES as u8 {
            if self.msg_pipes[slot as usize].owner == Some(index) {
                let _ = self.irp_cancel(DeviceId::new(index, 0), Ticket::Msg(slot));
            }
        }

        let ticks = self.ticks;
        self.devices[index as usize].reset(ticks);
        self.n_devices -= 1;
        trace!("dev {}: released", index);
    }

    /// Release a device and re-attach it on the same parent coordinates,
    /// restarting enumeration from scratch.
    pub fn device_reset(&mut self, id: DeviceId) -> Result<(), UsbError> {
        let index = id.device();
        if index as usize >= MAX_DEVICES {
            return Err(UsbError::InvParam);
        }
        let parent = self.devices[index as usize].parent;
        self.device_release(index);
        self.device_attach(parent);
        Ok(())
    }

    /// Release whatever device sits on the given HUB port.
    ///
    /// A port with no known device is fine: attachment may have failed
    /// earlier (e.g. no free slot), but the HUB still reports the
    /// disconnection.
    pub fn release_from_port(&mut self, hub: u8, port: u8) {
        if let Some(index) = self.device_on_port(hub, port) {
            self.device_release(index);
        }
    }

    /// Find the device attached on a HUB port.
    pub(crate) fn device_on_port(&self, hub: u8, port: u8) -> Option<u8> {
        self.devices
            .iter()
            .position(|d| d.active && d.parent == Parent::Port { hub, port })
            .map(|i| i as u8)
    }

    /// Current bus address of a device.
    pub fn device_addr(&self, id: DeviceId) -> Result<u8, UsbError> {
        self.devices
            .get(id.device() as usize)
            .map(|d| d.addr)
            .ok_or(UsbError::InvParam)
    }

    /// Deallocate every endpoint pipe of one interface.
    pub(crate) fn release_interface_endpoints(&mut self, index: u8, iface: u8) {
        let Some(cte) = self.devices[index as usize].cte_index else {
            return;
        };
        for ep in 0..config::endpoint_count(cte, iface) {
            pipe::remove(
                &mut self.hci,
                &mut self.devices[index as usize].interfaces[iface as usize].endpoints
                    [ep as usize],
            );
        }
    }

    /************************ IRP interface ***********************************/

    /// Submit a control transfer to an enumerated device.
    ///
    /// Takes a message pipe from the shared pool (failing with `Busy` when
    /// none is free), stages the SETUP fields and arms the transfer.
    /// Returns a ticket to poll with [`irp_status`](Self::irp_status). IN
    /// data is available through [`control_data`](Self::control_data) after
    /// completion.
    pub fn ctrl_irp(
        &mut self,
        id: DeviceId,
        req: &StdRequest,
        data_out: Option<&[u8]>,
    ) -> Result<Ticket, UsbError> {
        let dev = id.device() as usize;
        if dev >= MAX_DEVICES {
            return Err(UsbError::InvParam);
        }
        if !self.devices[dev].initialized {
            // Enumeration still owns the default pipe of this device.
            return Err(UsbError::Busy);
        }
        self.ctrl_irp_bypass(id, req, data_out)
    }

    /// Like [`ctrl_irp`](Self::ctrl_irp) without the initialized check:
    /// the enumeration sequence uses this to talk to devices that are not
    /// yet configured.
    pub(crate) fn ctrl_irp_bypass(
        &mut self,
        id: DeviceId,
        req: &StdRequest,
        data_out: Option<&[u8]>,
    ) -> Result<Ticket, UsbError> {
        let dev = id.device() as usize;
        if dev >= MAX_DEVICES || req.length as usize > XFER_BUFFER_LEN {
            return Err(UsbError::InvParam);
        }

        let slot = pipe::acquire(&mut self.msg_pipes, id.device())?;
        {
            let pmsg = &mut self.msg_pipes[slot as usize];
            pmsg.setup = *req;
            pmsg.retries = 0;
        }

        let info = self.devices[dev].info();
        if self
            .hci
            .msg_pipe_configure(info, &self.msg_pipes[slot as usize])
            .is_err()
        {
            pipe::release(&mut self.msg_pipes, slot);
            return Err(UsbError::PipeCfg);
        }
        if let Err(e) = self
            .hci
            .ctrlxfer_start(info, &self.msg_pipes[slot as usize], data_out)
        {
            pipe::release(&mut self.msg_pipes, slot);
            return Err(e);
        }
        Ok(Ticket::Msg(slot))
    }

    /// Submit a transfer on a streaming (bulk/interrupt) pipe of an
    /// enumerated device.
    ///
    /// `pipe` indexes the endpoint within the interface named by `id`. OUT
    /// pipes take their payload in `data_out`; IN results are read back
    /// with [`stream_data`](Self::stream_data) after completion.
    pub fn irp(
        &mut self,
        id: DeviceId,
        pipe: u8,
        data_out: Option<&[u8]>,
        length: u16,
    ) -> Result<Ticket, UsbError> {
        let (dev, iface) = self.validate_stream(id, pipe)?;
        if length == 0 {
            return Err(UsbError::InvParam);
        }
        if !self.devices[dev].initialized {
            return Err(UsbError::Busy);
        }

        {
            let ppipe = &mut self.devices[dev].interfaces[iface].endpoints[pipe as usize];
            match (ppipe.dir, data_out) {
                (types::Direction::Out, None) => return Err(UsbError::InvParam),
                (types::Direction::In, Some(_)) => return Err(UsbError::InvParam),
                _ => {}
            }
            ppipe.length = length;
            ppipe.retries = 0;
        }

        let info = self.devices[dev].info();
        self.hci.xfer_start(
            info,
            &self.devices[dev].interfaces[iface].endpoints[pipe as usize],
            data_out,
        )?;
        Ok(Ticket::Stream(pipe))
    }

    /// Poll an in-flight IRP.
    ///
    /// On any result other than `Pending` for a message-pipe ticket, the
    /// message pipe is released back to the pool inside this call.
    ///
    /// A stalled endpoint is retried transparently up to
    /// [`MAX_RETRIES`](config::MAX_RETRIES) times; the stall only surfaces
    /// once the budget is spent.
    pub fn irp_status(&mut self, id: DeviceId, ticket: Ticket) -> Result<IrpStatus, UsbError> {
        let dev = id.device() as usize;
        if dev >= MAX_DEVICES {
            return Err(UsbError::InvParam);
        }
        match ticket {
            Ticket::Msg(slot) => {
                if slot as usize >= N_CTRL_PIPES {
                    return Err(UsbError::InvParam);
                }
                let result = self.msg_irp_status(dev, slot);
                if !matches!(result, Ok(IrpStatus::Pending)) {
                    pipe::release(&mut self.msg_pipes, slot);
                }
                result
            }
            Ticket::Stream(pipe) => self.stream_irp_status(id, pipe),
        }
    }

    /// Cancel an in-flight IRP. Idempotent, and safe on a ticket whose
    /// transfer never started. Message-pipe tickets also give the pipe
    /// lock back.
    pub fn irp_cancel(&mut self, id: DeviceId, ticket: Ticket) -> Result<(), UsbError> {
        let dev = id.device() as usize;
        if dev >= MAX_DEVICES {
            return Err(UsbError::InvParam);
        }
        match ticket {
            Ticket::Msg(slot) => {
                if slot as usize >= N_CTRL_PIPES {
                    return Err(UsbError::InvParam);
                }
                let info = self.devices[dev].info();
                self.hci.ctrlxfer_cancel(info, &self.msg_pipes[slot as usize]);
                pipe::release(&mut self.msg_pipes, slot);
                Ok(())
            }
            Ticket::Stream(pipe) => {
                let (dev, iface) = self.validate_stream(id, pipe)?;
                let info = self.devices[dev].info();
                self.hci.xfer_cancel(
                    info,
                    &self.devices[dev].interfaces[iface].endpoints[pipe as usize],
                );
                Ok(())
            }
        }
    }

    /// Data received by the device's most recent completed control
    /// transfer.
    pub fn control_data(&self, id: DeviceId) -> &[u8] {
        self.devices[id.device() as usize].control_data()
    }

    /// Data received by the most recent completed IN transfer on a
    /// streaming pipe.
    pub fn stream_data(&self, id: DeviceId, pipe: u8) -> Result<&[u8], UsbError> {
        let (dev, iface) = self.validate_stream(id, pipe)?;
        let ppipe = &self.devices[dev].interfaces[iface].endpoints[pipe as usize];
        Ok(self.hci.received_data(ppipe.handle, ppipe.length as usize))
    }

    /// Polling interval of a streaming pipe, converted to run-loop ticks.
    pub fn pipe_interval(&self, id: DeviceId, pipe: u8) -> Result<u16, UsbError> {
        let (dev, iface) = self.validate_stream(id, pipe)?;
        let pdev = &self.devices[dev];
        let ppipe = &pdev.interfaces[iface].endpoints[pipe as usize];
        let b = ppipe.interval;

        let frames: u32 = match ppipe.ty {
            // ISO FS/HS, or INT HS: interval = 2**(bInterval-1), bInterval 1..=16.
            TransferType::Isochronous => {
                if !(1..=16).contains(&b) {
                    return Err(UsbError::InvParam);
                }
                1 << (b - 1)
            }
            TransferType::Interrupt if pdev.speed == Speed::High => {
                if !(1..=16).contains(&b) {
                    return Err(UsbError::InvParam);
                }
                1 << (b - 1)
            }
            // INT FS/LS: interval = bInterval, 1..=255.
            TransferType::Interrupt => {
                if b < 1 {
                    return Err(UsbError::InvParam);
                }
                b as u32
            }
            _ => b as u32,
        };

        // High-speed intervals count 125 us microframes.
        let ms = if pdev.speed == Speed::High {
            (frames + 7) / 8
        } else {
            frames
        };
        Ok((ms as u16 + TASK_INTERVAL_MS - 1) / TASK_INTERVAL_MS)
    }

    /************************ internals ***************************************/

    fn validate_stream(&self, id: DeviceId, pipe: u8) -> Result<(usize, usize), UsbError> {
        let dev = id.device() as usize;
        if dev >= MAX_DEVICES {
            return Err(UsbError::InvParam);
        }
        let cte = self.devices[dev].cte_index.ok_or(UsbError::InvParam)?;
        let iface = id.interface();
        if iface >= config::interface_count(cte) || pipe >= config::endpoint_count(cte, iface) {
            return Err(UsbError::InvParam);
        }
        Ok((dev, iface as usize))
    }

    fn msg_irp_status(&mut self, dev: usize, slot: u8) -> Result<IrpStatus, UsbError> {
        let info = self.devices[dev].info();
        match self.hci.ctrlxfer_status(info, &self.msg_pipes[slot as usize]) {
            TransferStatus::Complete => {
                self.msg_pipes[slot as usize].retries = 0;
                let setup = self.msg_pipes[slot as usize].setup;
                if setup.direction() == UsbDirection::In && setup.length > 0 {
                    let handle = self.msg_pipes[slot as usize].handle;
                    let data = self.hci.received_data(handle, setup.length as usize);
                    let n = data.len().min(XFER_BUFFER_LEN);
                    self.devices[dev].xfer_buffer[..n].copy_from_slice(&data[..n]);
                    self.devices[dev].xfer_length = n as u16;
                } else {
                    self.devices[dev].xfer_length = 0;
                }
                Ok(IrpStatus::Complete)
            }
            TransferStatus::Wait => Ok(IrpStatus::Pending),
            TransferStatus::Stalled => {
                // Cancel what's left of the transaction, then retry from
                // scratch while the strike budget lasts.
                self.hci.ctrlxfer_cancel(info, &self.msg_pipes[slot as usize]);
                if self.msg_pipes[slot as usize].retries < MAX_RETRIES {
                    self.msg_pipes[slot as usize].retries += 1;
                    self.hci
                        .ctrlxfer_start(info, &self.msg_pipes[slot as usize], None)
                        .map_err(|_| UsbError::XferErr)?;
                    Ok(IrpStatus::Pending)
                } else {
                    Err(UsbError::EpStalled)
                }
            }
            TransferStatus::Failed => Err(UsbError::XferErr),
        }
    }

    fn stream_irp_status(&mut self, id: DeviceId, pipe: u8) -> Result<IrpStatus, UsbError> {
        let (dev, iface) = self.validate_stream(id, pipe)?;
        let info = self.devices[dev].info();
        let status = self
            .hci
            .xfer_status(info, &self.devices[dev].interfaces[iface].endpoints[pipe as usize]);
        match status {
            TransferStatus::Complete => {
                self.devices[dev].interfaces[iface].endpoints[pipe as usize].retries = 0;
                Ok(IrpStatus::Complete)
            }
            TransferStatus::Wait => Ok(IrpStatus::Pending),
            TransferStatus::Stalled => {
                let ppipe = self.devices[dev].interfaces[iface].endpoints[pipe as usize];
                self.hci.xfer_cancel(info, &ppipe);
                if ppipe.retries < MAX_RETRIES {
                    self.devices[dev].interfaces[iface].endpoints[pipe as usize].retries += 1;
                    self.hci
                        .xfer_start(
                            info,
                            &self.devices[dev].interfaces[iface].endpoints[pipe as usize],
                            None,
                        )
                        .map_err(|_| UsbError::XferErr)?;
                    Ok(IrpStatus::Pending)
                } else {
                    Err(UsbError::EpStalled)
                }
            }
            TransferStatus::Failed => Err(UsbError::XferErr),
        }
    }
}

#[cfg(test)]
#[path = "tests/stack.rs"]
mod stack_tests;
