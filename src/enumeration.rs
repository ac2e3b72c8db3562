//! The per-device enumeration state machine
//!
//! Non-blocking: every call advances a device by at most one step. Waits
//! are explicit states: `WaitDelay` for timed settling, `Reset` while a
//! reset is driven, and every descriptor exchange stays in its state
//! polling the in-flight control transfer until it settles.
//!
//! The sequence follows USB 2.0 defaults: reset, probe the endpoint-0 max
//! packet size with a short descriptor read at MPS 8, reset again to
//! return the device cleanly to default state, assign the address, read
//! the device and configuration descriptors, bind drivers, select the
//! configuration. Address 0 is a bus-wide resource: a device must own the
//! stack's address-0 lock from `Powered` until `Unlock`, which serializes
//! sibling enumerations.

use fugit::MillisDurationU32;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

use crate::config::{self, XFER_BUFFER_LEN};
use crate::debug::*;
use crate::descriptor::{self, parse};
use crate::device::{Binding, DeviceState, Parent};
use crate::driver;
use crate::error::{IrpStatus, UsbError};
use crate::hci::HostController;
use crate::pipe::Pipe;
use crate::types::{DeviceId, StdRequest};
use crate::UsbStack;

/// Wait after attach for the power rail to settle.
const ATTACH_SETTLE: MillisDurationU32 = MillisDurationU32::millis(100);
/// Wait after SET_CONFIGURATION before declaring the device usable.
const CONFIG_SETTLE: MillisDurationU32 = MillisDurationU32::millis(500);

/// Progress of the control request owned by the state machine.
enum CtrlStep {
    Pending,
    Complete,
}

/// Advance one device by at most one step.
pub(crate) fn update_device<H: HostController>(
    stack: &mut UsbStack<H>,
    index: u8,
) -> Result<(), UsbError> {
    match stack.devices[index as usize].state {
        // Waiting for attach, nothing to drive.
        DeviceState::Disconnected => Ok(()),
        DeviceState::Attached => attached(stack, index),
        DeviceState::WaitDelay => wait_delay(stack, index),
        DeviceState::Powered => powered(stack, index),
        DeviceState::Reset => reset(stack, index),
        DeviceState::Default => default_state(stack, index),
        DeviceState::Mps => mps(stack, index),
        DeviceState::Address => address(stack, index),
        DeviceState::DevDesc => dev_desc(stack, index),
        DeviceState::CfgDescHeader => cfg_desc_header(stack, index),
        DeviceState::CfgDesc => cfg_desc(stack, index),
        DeviceState::SetCfg => set_cfg(stack, index),
        DeviceState::Unlock => unlock(stack, index),
        DeviceState::Configured => Ok(()),
        // Reserved.
        DeviceState::Suspended => Ok(()),
    }
}

fn set_delay<H: HostController>(stack: &mut UsbStack<H>, index: u8, delay_ms: u16) {
    stack.devices[index as usize].ticks_delay = stack.ticks.wrapping_add(delay_ms);
}

/// Drive a USB reset towards the device, through the root port or the
/// parent HUB's port.
fn port_reset<H: HostController>(stack: &mut UsbStack<H>, index: u8) {
    match stack.devices[index as usize].parent {
        Parent::Root => stack.hci.reset_start(),
        Parent::Port { hub, port } => driver::hub::port_reset_start(stack, hub, port),
    }
}

/// Submit or poll the state machine's control request.
///
/// The first call after a state transition (request flag set) submits the
/// request and records the ticket; subsequent calls poll it. A busy
/// message-pipe pool is not an error, just another reason to poll again.
fn ctrl_request<H: HostController>(
    stack: &mut UsbStack<H>,
    index: u8,
    req: StdRequest,
) -> Result<CtrlStep, UsbError> {
    if req.length as usize > XFER_BUFFER_LEN {
        return Err(UsbError::InvParam);
    }
    let id = DeviceId::new(index, 0);
    if stack.devices[index as usize].request_pending {
        match stack.ctrl_irp_bypass(id, &req, None) {
            Ok(ticket) => {
                let pdev = &mut stack.devices[index as usize];
                pdev.ticket = Some(ticket);
                pdev.request_pending = false;
                Ok(CtrlStep::Pending)
            }
            Err(UsbError::Busy) => Ok(CtrlStep::Pending),
            Err(e) => Err(e),
        }
    } else {
        let ticket = stack.devices[index as usize]
            .ticket
            .ok_or(UsbError::InvParam)?;
        match stack.irp_status(id, ticket)? {
            IrpStatus::Pending => Ok(CtrlStep::Pending),
            IrpStatus::Complete => {
                stack.devices[index as usize].ticket = None;
                Ok(CtrlStep::Complete)
            }
        }
    }
}

/****************************** States follow *********************************/

fn attached<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    // Device attached, wait for the power rail to settle.
    set_delay(stack, index, ATTACH_SETTLE.ticks() as u16);
    stack.devices[index as usize].enter(DeviceState::WaitDelay, DeviceState::Powered);
    trace!("dev {}: -> Powered (after delay)", index);
    Ok(())
}

fn wait_delay<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    let expired = {
        let pdev = &stack.devices[index as usize];
        (pdev.ticks_delay.wrapping_sub(stack.ticks) as i16) <= 0
    };
    if expired {
        stack.devices[index as usize].advance();
    }
    Ok(())
}

fn powered<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    // Drive a USB reset, but only once no other device is resetting or
    // talking on address 0. Siblings attached simultaneously queue up here
    // and enumerate one at a time.
    if stack.addr0_taken {
        stack.devices[index as usize].waiting_addr0 = true;
        return Ok(());
    }
    stack.addr0_taken = true;
    {
        let pdev = &mut stack.devices[index as usize];
        pdev.holds_addr0 = true;
        pdev.waiting_addr0 = false;
    }
    port_reset(stack, index);
    stack.devices[index as usize].enter(DeviceState::Reset, DeviceState::Default);
    trace!("dev {}: -> Reset", index);
    Ok(())
}

fn reset<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    let result = match stack.devices[index as usize].parent {
        Parent::Root => stack.hci.reset_stop(),
        Parent::Port { hub, port } => driver::hub::port_reset_status(stack, hub, port),
    };
    match result {
        Ok(()) => {
            stack.devices[index as usize].advance();
            Ok(())
        }
        // Reset still being driven.
        Err(UsbError::Busy) => Ok(()),
        Err(e) => Err(e),
    }
}

fn default_state<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    // Reset released: the device answers on address 0. Read the speed from
    // whoever drove the reset, then probe the control endpoint with the
    // universally safe max packet size of 8.
    let speed = match stack.devices[index as usize].parent {
        Parent::Root => stack.hci.speed(),
        Parent::Port { hub, port } => driver::hub::port_speed(stack, hub, port),
    };
    let pdev = &mut stack.devices[index as usize];
    pdev.speed = speed;
    pdev.addr = 0;
    pdev.mps0 = 8;
    pdev.enter(DeviceState::Mps, DeviceState::Mps);
    trace!("dev {}: -> Mps, speed {}", index, speed);
    Ok(())
}

fn mps<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    let req = StdRequest::new(
        UsbDirection::In,
        RequestType::Standard,
        Recipient::Device,
        Request::GET_DESCRIPTOR,
        (descriptor::TYPE_DEVICE as u16) << 8,
        0,
        8,
    );
    match ctrl_request(stack, index, req)? {
        CtrlStep::Pending => Ok(()),
        CtrlStep::Complete => {
            {
                let pdev = &mut stack.devices[index as usize];
                if pdev.xfer_length < 8 {
                    return Err(UsbError::InvDesc);
                }
                // bMaxPacketSize0 sits at offset 7 of the device descriptor.
                pdev.mps0 = pdev.xfer_buffer[7];
            }
            // MPS known; reset once more so SET_ADDRESS finds the device
            // cleanly back in default state.
            port_reset(stack, index);
            stack.devices[index as usize].enter(DeviceState::Reset, DeviceState::Address);
            trace!("dev {}: -> Reset (re-drive before addressing)", index);
            Ok(())
        }
    }
}

fn address<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    let req = StdRequest::new(
        UsbDirection::Out,
        RequestType::Standard,
        Recipient::Device,
        Request::SET_ADDRESS,
        index as u16 + 1,
        0,
        0,
    );
    match ctrl_request(stack, index, req)? {
        CtrlStep::Pending => Ok(()),
        CtrlStep::Complete => {
            let pdev = &mut stack.devices[index as usize];
            pdev.addr = index + 1;
            pdev.enter(DeviceState::DevDesc, DeviceState::DevDesc);
            trace!("dev {}: -> DevDesc, address {}", index, index + 1);
            Ok(())
        }
    }
}

fn dev_desc<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    let req = StdRequest::new(
        UsbDirection::In,
        RequestType::Standard,
        Recipient::Device,
        Request::GET_DESCRIPTOR,
        (descriptor::TYPE_DEVICE as u16) << 8,
        0,
        descriptor::DEVICE_DESC_SIZE,
    );
    match ctrl_request(stack, index, req)? {
        CtrlStep::Pending => Ok(()),
        CtrlStep::Complete => {
            let pdev = &mut stack.devices[index as usize];
            let (_, desc) =
                parse::any_descriptor(pdev.control_data()).map_err(|_| UsbError::InvDesc)?;
            if desc.descriptor_type != descriptor::TYPE_DEVICE {
                return Err(UsbError::InvDesc);
            }
            let (_, device_desc) =
                parse::device_descriptor(desc.data).map_err(|_| UsbError::InvDesc)?;
            pdev.vendor_id = device_desc.id_vendor;
            pdev.product_id = device_desc.id_product;
            pdev.enter(DeviceState::CfgDescHeader, DeviceState::CfgDescHeader);
            trace!("dev {}: -> CfgDescHeader", index);
            Ok(())
        }
    }
}

fn cfg_desc_header<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    let req = StdRequest::new(
        UsbDirection::In,
        RequestType::Standard,
        Recipient::Device,
        Request::GET_DESCRIPTOR,
        (descriptor::TYPE_CONFIGURATION as u16) << 8,
        0,
        descriptor::CONFIGURATION_DESC_SIZE,
    );
    match ctrl_request(stack, index, req)? {
        CtrlStep::Pending => Ok(()),
        CtrlStep::Complete => {
            let (total_length, num_interfaces) = {
                let pdev = &stack.devices[index as usize];
                let (_, desc) =
                    parse::any_descriptor(pdev.control_data()).map_err(|_| UsbError::InvDesc)?;
                if desc.descriptor_type != descriptor::TYPE_CONFIGURATION {
                    return Err(UsbError::InvDesc);
                }
                let (_, cfg) = parse::configuration_descriptor(desc.data)
                    .map_err(|_| UsbError::InvDesc)?;
                (cfg.total_length, cfg.num_interfaces)
            };
            if total_length as usize > XFER_BUFFER_LEN {
                return Err(UsbError::InvDesc);
            }
            // Match the device against the build-time profiles: this fixes
            // the interface/endpoint layout the rest of enumeration trusts.
            let pdev = &mut stack.devices[index as usize];
            let cte = config::find_template(
                pdev.vendor_id,
                pdev.product_id,
                total_length,
                num_interfaces,
            )
            .ok_or(UsbError::IfaceCfg)?;
            pdev.cte_index = Some(cte);
            pdev.enter(DeviceState::CfgDesc, DeviceState::CfgDesc);
            trace!("dev {}: -> CfgDesc ({} bytes)", index, total_length);
            Ok(())
        }
    }
}

fn cfg_desc<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    let cte = stack.devices[index as usize]
        .cte_index
        .ok_or(UsbError::InvParam)?;
    let req = StdRequest::new(
        UsbDirection::In,
        RequestType::Standard,
        Recipient::Device,
        Request::GET_DESCRIPTOR,
        (descriptor::TYPE_CONFIGURATION as u16) << 8,
        0,
        config::TEMPLATES[cte as usize].total_length,
    );
    match ctrl_request(stack, index, req)? {
        CtrlStep::Pending => Ok(()),
        CtrlStep::Complete => {
            parse_configuration(stack, index)?;
            stack.devices[index as usize].enter(DeviceState::SetCfg, DeviceState::SetCfg);
            trace!("dev {}: -> SetCfg", index);
            Ok(())
        }
    }
}

fn set_cfg<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    let cfg_value = stack.devices[index as usize].cfg_value;
    let req = StdRequest::new(
        UsbDirection::Out,
        RequestType::Standard,
        Recipient::Device,
        Request::SET_CONFIGURATION,
        cfg_value as u16,
        0,
        0,
    );
    match ctrl_request(stack, index, req)? {
        CtrlStep::Pending => Ok(()),
        CtrlStep::Complete => {
            set_delay(stack, index, CONFIG_SETTLE.ticks() as u16);
            stack.devices[index as usize].enter(DeviceState::WaitDelay, DeviceState::Unlock);
            trace!("dev {}: -> Unlock (after delay)", index);
            Ok(())
        }
    }
}

fn unlock<H: HostController>(stack: &mut UsbStack<H>, index: u8) -> Result<(), UsbError> {
    // Give address 0 back so the next sibling can enumerate.
    stack.addr0_taken = false;
    let pdev = &mut stack.devices[index as usize];
    pdev.holds_addr0 = false;
    pdev.initialized = true;
    pdev.enter(DeviceState::Configured, DeviceState::Configured);
    info!("dev {}: configured, address {}", index, pdev.addr);
    Ok(())
}

/************************* Configuration parsing ******************************/

/// Digest the full configuration descriptor: record the configuration
/// attributes, then carve the buffer into per-interface segments and bind
/// each one.
fn parse_configuration<H: HostController>(
    stack: &mut UsbStack<H>,
    index: u8,
) -> Result<(), UsbError> {
    // Parse out of a local copy so the device entry stays free for
    // interface bookkeeping and pipe setup below.
    let buf = stack.devices[index as usize].xfer_buffer;
    let len = stack.devices[index as usize].xfer_length as usize;
    let buf = &buf[..len];

    let (_, desc) = parse::any_descriptor(buf).map_err(|_| UsbError::InvDesc)?;
    if desc.descriptor_type != descriptor::TYPE_CONFIGURATION {
        return Err(UsbError::InvDesc);
    }
    let (_, cfg) = parse::configuration_descriptor(desc.data).map_err(|_| UsbError::InvDesc)?;

    let cte = {
        let pdev = &mut stack.devices[index as usize];
        pdev.cfg_value = cfg.value;
        pdev.self_powered = cfg.attributes.self_powered();
        pdev.remote_wakeup = cfg.attributes.remote_wakeup();
        pdev.max_power = cfg.max_power;
        pdev.cte_index.ok_or(UsbError::InvParam)?
    };

    let n_interfaces = config::interface_count(cte);
    let mut cursor = descriptor::next_descriptor(
        buf,
        descriptor::TYPE_INTERFACE,
        descriptor::INTERFACE_DESC_SIZE,
    )
    .ok_or(UsbError::InvDesc)?;

    for i in 0..n_interfaces {
        // Segment runs up to the next interface descriptor, so the driver
        // sees the endpoints and class descriptors that belong to it.
        let next = descriptor::next_descriptor(
            cursor,
            descriptor::TYPE_INTERFACE,
            descriptor::INTERFACE_DESC_SIZE,
        );
        let segment = match next {
            Some(tail) => &cursor[..cursor.len() - tail.len()],
            None => {
                if i + 1 < n_interfaces {
                    return Err(UsbError::IfaceCfg);
                }
                cursor
            }
        };
        parse_interface(stack, index, i, segment)?;
        if let Some(tail) = next {
            cursor = tail;
        }
    }
    Ok(())
}

/// Bind one interface: validate its endpoint count against the template,
/// find a driver, set up the endpoint pipes, register with the driver.
///
/// Endpoint or assignment failures spoil only this interface (it is marked
/// failed and its pipes are rolled back); the siblings still proceed.
fn parse_interface<H: HostController>(
    stack: &mut UsbStack<H>,
    index: u8,
    iface_idx: u8,
    buffer: &[u8],
) -> Result<(), UsbError> {
    let (_, desc) = parse::any_descriptor(buffer).map_err(|_| UsbError::InvDesc)?;
    if desc.descriptor_type != descriptor::TYPE_INTERFACE {
        return Err(UsbError::InvDesc);
    }
    let (_, iface_desc) = parse::interface_descriptor(desc.data).map_err(|_| UsbError::InvDesc)?;

    let cte = stack.devices[index as usize]
        .cte_index
        .ok_or(UsbError::InvParam)?;
    if iface_desc.num_endpoints != config::endpoint_count(cte, iface_idx) {
        return Err(UsbError::EpAvail);
    }

    {
        let piface = &mut stack.devices[index as usize].interfaces[iface_idx as usize];
        piface.class = iface_desc.interface_class;
        piface.subclass = iface_desc.interface_sub_class;
        piface.protocol = iface_desc.interface_protocol;
        piface.n_endpoints = iface_desc.num_endpoints;
    }

    let handle = match driver::probe(&stack.devices[index as usize], 0, buffer) {
        Ok(handle) => handle,
        Err(UsbError::NoDriver) => {
            // The interface stays listed and addressable, so user code can
            // inspect it and find out why no driver took it.
            debug!("dev {} iface {}: no driver", index, iface_idx);
            stack.devices[index as usize].interfaces[iface_idx as usize].driver = Binding::None;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    stack.devices[index as usize].interfaces[iface_idx as usize].driver =
        Binding::Driver(handle);

    let mut cursor = buffer;
    let mut result = Ok(());
    for ep in 0..iface_desc.num_endpoints {
        match descriptor::next_descriptor(
            cursor,
            descriptor::TYPE_ENDPOINT,
            descriptor::ENDPOINT_DESC_SIZE,
        ) {
            Some(tail) => {
                cursor = tail;
                if let Err(e) = configure_endpoint(stack, index, iface_idx, ep, cursor) {
                    result = Err(e);
                    break;
                }
            }
            None => {
                result = Err(UsbError::InvDesc);
                break;
            }
        }
    }

    if result.is_err() {
        // Can't leave a half-configured interface behind.
        stack.release_interface_endpoints(index, iface_idx);
        stack.devices[index as usize].interfaces[iface_idx as usize].driver = Binding::Failed;
        return Ok(());
    }

    let id = DeviceId::new(index, iface_idx);
    if driver::assign(stack, id, buffer, handle).is_err() {
        stack.release_interface_endpoints(index, iface_idx);
        stack.devices[index as usize].interfaces[iface_idx as usize].driver = Binding::Failed;
    }
    Ok(())
}

fn configure_endpoint<H: HostController>(
    stack: &mut UsbStack<H>,
    index: u8,
    iface_idx: u8,
    ep: u8,
    buffer: &[u8],
) -> Result<(), UsbError> {
    let (_, desc) = parse::any_descriptor(buffer).map_err(|_| UsbError::InvDesc)?;
    if desc.descriptor_type != descriptor::TYPE_ENDPOINT {
        return Err(UsbError::InvDesc);
    }
    let (_, ep_desc) = parse::endpoint_descriptor(desc.data).map_err(|_| UsbError::InvDesc)?;

    let ty = ep_desc.attributes.transfer_type();
    let handle = stack.hci.pipe_alloc(ty).ok_or(UsbError::NoPipe)?;
    stack.devices[index as usize].interfaces[iface_idx as usize].endpoints[ep as usize] = Pipe {
        handle,
        number: ep_desc.address.number(),
        ty,
        dir: ep_desc.address.direction().into(),
        mps: ep_desc.max_packet_size,
        interval: ep_desc.interval,
        length: 0,
        retries: 0,
    };
    let info = stack.devices[index as usize].info();
    stack
        .hci
        .pipe_configure(
            info,
            &stack.devices[index as usize].interfaces[iface_idx as usize].endpoints[ep as usize],
        )
        .map_err(|_| UsbError::PipeCfg)
}
