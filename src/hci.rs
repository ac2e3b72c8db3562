//! Interface for host controller hardware
//!
//! In order to use `usbh-core` on a given device, there must be a
//! [`HostController`] implementation specific to that device. The stack
//! drives enumeration and IRPs exclusively through this trait; no hardware
//! register is ever touched by the core.
//!
//! The model is strictly polled: `*_start` arms a transfer, `*_status` is
//! polled from the cooperative loop until it stops reporting
//! [`TransferStatus::Wait`]. The only concurrent actor allowed on the other
//! side is the controller's interrupt service, which may update the status
//! reported here; implementations must make that update visible to the
//! polling thread but must never block.

use crate::error::{TransferStatus, UsbError};
use crate::pipe::{MessagePipe, Pipe};
use crate::types::{Speed, TransferType};

/// Opaque handle for a hardware pipe, issued by the controller.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeHandle(pub u8);

impl PipeHandle {
    /// Sentinel stored in deallocated pipes.
    pub const INVALID: PipeHandle = PipeHandle(0xFF);
}

/// Addressing snapshot of one device, passed down with every transfer so
/// the controller knows which address/speed/MPS combination to drive.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceInfo {
    /// Current device address (0 while the device is in default state).
    pub addr: u8,
    /// Speed the device operates at.
    pub speed: Speed,
    /// Max packet size of endpoint 0.
    pub mps0: u8,
}

/// Interface for host controller hardware
pub trait HostController {
    /// Bring the controller into host mode.
    ///
    /// Called once when the stack is created. Must also reset any internal
    /// state to a default configuration and enable the interrupts needed to
    /// report transfer completion through the `*_status` methods.
    fn init(&mut self);

    /// Shut the controller down.
    fn deinit(&mut self);

    /// Whether a device is currently connected to the root port.
    fn is_connected(&self) -> bool;

    /// Speed of the device on the root port.
    ///
    /// Only meaningful after a reset has completed.
    fn speed(&self) -> Speed;

    /// Begin driving a USB reset on the root port.
    fn reset_start(&mut self);

    /// Stop driving the USB reset.
    ///
    /// Returns `Err(UsbError::Busy)` while the reset is still being held;
    /// the stack polls this from the device state machine.
    fn reset_stop(&mut self) -> Result<(), UsbError>;

    /// Allocate a hardware pipe for the given transfer type.
    ///
    /// Returns `None` when the controller has no pipe of that type left.
    fn pipe_alloc(&mut self, ty: TransferType) -> Option<PipeHandle>;

    /// Return a hardware pipe to the controller.
    fn pipe_dealloc(&mut self, handle: PipeHandle);

    /// Bind a streaming pipe to `(device address, speed, endpoint, direction,
    /// max packet size, interval)`.
    fn pipe_configure(&mut self, device: DeviceInfo, pipe: &Pipe) -> Result<(), UsbError>;

    /// Bind a message pipe to the device's endpoint 0.
    ///
    /// Called every time the pipe is re-acquired, since message pipes are
    /// shared between devices.
    fn msg_pipe_configure(&mut self, device: DeviceInfo, pipe: &MessagePipe)
        -> Result<(), UsbError>;

    /// Arm a control transfer: SETUP stage from the pipe's staged request,
    /// then a DATA stage of `pipe.setup.length` bytes.
    ///
    /// For OUT requests with a data stage, `data_out` holds the payload and
    /// must be copied out by the controller before this method returns. IN
    /// data is buffered by the controller and read back through
    /// [`received_data`](HostController::received_data) after
    /// [`ctrlxfer_status`](HostController::ctrlxfer_status) reports
    /// completion.
    fn ctrlxfer_start(
        &mut self,
        device: DeviceInfo,
        pipe: &MessagePipe,
        data_out: Option<&[u8]>,
    ) -> Result<(), UsbError>;

    /// Cancel an in-flight control transfer. Must be idempotent.
    fn ctrlxfer_cancel(&mut self, device: DeviceInfo, pipe: &MessagePipe);

    /// Poll an in-flight control transfer.
    fn ctrlxfer_status(&mut self, device: DeviceInfo, pipe: &MessagePipe) -> TransferStatus;

    /// Arm a transfer of `pipe.length` bytes on a streaming pipe.
    ///
    /// Buffer handling follows the control-transfer rules: OUT payloads are
    /// copied at start, IN data is read back via `received_data` once the
    /// transfer completes.
    fn xfer_start(
        &mut self,
        device: DeviceInfo,
        pipe: &Pipe,
        data_out: Option<&[u8]>,
    ) -> Result<(), UsbError>;

    /// Cancel an in-flight streaming transfer. Must be idempotent.
    fn xfer_cancel(&mut self, device: DeviceInfo, pipe: &Pipe);

    /// Poll an in-flight streaming transfer.
    fn xfer_status(&mut self, device: DeviceInfo, pipe: &Pipe) -> TransferStatus;

    /// Access the data received by the most recent completed IN transfer on
    /// the given pipe.
    ///
    /// The returned buffer *should* be exactly `len` bytes long. It *may* be
    /// shorter if the device sent less data than requested.
    ///
    /// The buffer contents remain valid until the next transfer is started
    /// on the same pipe.
    fn received_data(&self, handle: PipeHandle, len: usize) -> &[u8];
}
