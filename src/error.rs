//! Error and status codes shared across the stack

/// Errors reported by the stack or by a [`HostController`](crate::hci::HostController)
/// implementation.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Invalid argument/parameter to function. Non-retryable.
    InvParam,
    /// A shared resource (message pipe, device slot, driver slot) is
    /// currently unavailable. Retryable.
    Busy,
    /// No registered driver accepted the interface.
    NoDriver,
    /// The host controller refused to allocate a hardware pipe.
    NoPipe,
    /// Unable to configure a pipe against the device.
    PipeCfg,
    /// Host controller could not be brought up with the configured
    /// number of control pipes.
    HciInit,
    /// A descriptor was malformed, truncated, or too large for the
    /// transfer buffer.
    InvDesc,
    /// An interface reported a different endpoint count than the one
    /// fixed by its configuration template.
    EpAvail,
    /// No configuration template matches the device.
    IfaceCfg,
    /// Endpoint stalled and the retry budget is exhausted.
    EpStalled,
    /// Device stopped responding.
    DevUnreachable,
    /// Transfer failed at the hardware level.
    XferErr,
}

impl UsbError {
    /// Errors that end enumeration: the device is released and the slot
    /// reused.
    pub(crate) fn is_fatal(self) -> bool {
        matches!(
            self,
            UsbError::InvDesc
                | UsbError::EpAvail
                | UsbError::IfaceCfg
                | UsbError::EpStalled
                | UsbError::DevUnreachable
                | UsbError::XferErr
                | UsbError::PipeCfg
                | UsbError::NoPipe
        )
    }
}

/// Outcome of polling the host controller for an in-flight transfer.
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferStatus {
    /// Transfer finished successfully.
    Complete,
    /// Still in flight, poll again.
    Wait,
    /// The endpoint replied with STALL.
    Stalled,
    /// The transfer failed.
    Failed,
}

/// Result of polling an IRP through [`irp_status`](crate::UsbStack::irp_status).
#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IrpStatus {
    /// Data (if any) is available; for message pipes the lock has been
    /// released.
    Complete,
    /// Still in flight, poll again.
    Pending,
}
