//! Compile-time capacities and configuration templates
//!
//! Nothing in this stack allocates: every array is sized here, at build
//! time, per supported device profile. The template table maps an
//! enumerated device onto one of those profiles, so the rest of the stack
//! can trust interface and endpoint counts without ever growing a buffer.

use crate::types::MATCH_ANY_ID;

/// Maximum number of devices (root device included).
pub const MAX_DEVICES: usize = 4;

/// Maximum number of interfaces per device.
pub const MAX_INTERFACES: usize = 2;

/// Maximum number of endpoints per interface (besides endpoint 0).
pub const MAX_ENDPOINTS: usize = 3;

/// Maximum number of HUBs.
pub const MAX_HUBS: usize = 2;

/// Maximum number of ports per HUB.
pub const MAX_HUB_PORTS: usize = 4;

/// Number of shared message (control) pipes.
pub const N_CTRL_PIPES: usize = 2;

/// Control transfer buffer length. The USB specification allows a 16-bit
/// wTotalLength; this implementation caps it here.
pub const XFER_BUFFER_LEN: usize = 256;

/// Strikes allowed on a stalled pipe before the stall is surfaced.
pub const MAX_RETRIES: u8 = 3;

/// Period, in milliseconds, at which [`run`](crate::UsbStack::run) is
/// expected to be called.
pub const TASK_INTERVAL_MS: u16 = 1;

/// One device profile: which interface/endpoint layout to expect from a
/// device whose configuration descriptor matches the listed keys.
pub struct ConfigTemplate {
    /// Vendor filter, [`MATCH_ANY_ID`] to accept any.
    pub vendor_id: u16,
    /// Product filter, [`MATCH_ANY_ID`] to accept any.
    pub product_id: u16,
    /// Expected wTotalLength of the full configuration descriptor.
    pub total_length: u16,
    /// Number of interfaces in the configuration.
    pub n_interfaces: u8,
    /// Endpoint count fixed for each interface.
    pub endpoints: [u8; MAX_INTERFACES],
}

/// Supported device profiles, in match order.
///
/// Adjust this table to the devices the product must accept; an attached
/// device matching no entry is rejected during enumeration.
pub static TEMPLATES: &[ConfigTemplate] = &[
    // Single-interface HUB: config + interface + status-change endpoint.
    ConfigTemplate {
        vendor_id: MATCH_ANY_ID,
        product_id: MATCH_ANY_ID,
        total_length: 25,
        n_interfaces: 1,
        endpoints: [1, 0],
    },
    // Boot-protocol HID with interrupt IN + OUT endpoints.
    ConfigTemplate {
        vendor_id: MATCH_ANY_ID,
        product_id: MATCH_ANY_ID,
        total_length: 32,
        n_interfaces: 1,
        endpoints: [2, 0],
    },
    // Boot keyboard with a class descriptor and a single interrupt endpoint.
    ConfigTemplate {
        vendor_id: MATCH_ANY_ID,
        product_id: MATCH_ANY_ID,
        total_length: 34,
        n_interfaces: 1,
        endpoints: [1, 0],
    },
    // Two-function composite device, one endpoint per interface.
    ConfigTemplate {
        vendor_id: MATCH_ANY_ID,
        product_id: MATCH_ANY_ID,
        total_length: 41,
        n_interfaces: 2,
        endpoints: [1, 1],
    },
    // Largest configuration the transfer buffer can hold (devices padding
    // the descriptor with vendor-specific blocks).
    ConfigTemplate {
        vendor_id: MATCH_ANY_ID,
        product_id: MATCH_ANY_ID,
        total_length: XFER_BUFFER_LEN as u16,
        n_interfaces: 1,
        endpoints: [1, 0],
    },
];

fn id_matches(filter: u16, id: u16) -> bool {
    filter == MATCH_ANY_ID || filter == id
}

/// Find the template slot for a device, keyed the way the enumeration
/// sequence learns the values: ids from the device descriptor, length and
/// interface count from the configuration descriptor header.
pub(crate) fn find_template(
    vendor_id: u16,
    product_id: u16,
    total_length: u16,
    n_interfaces: u8,
) -> Option<u8> {
    TEMPLATES
        .iter()
        .position(|t| {
            id_matches(t.vendor_id, vendor_id)
                && id_matches(t.product_id, product_id)
                && t.total_length == total_length
                && t.n_interfaces == n_interfaces
        })
        .map(|i| i as u8)
}

pub(crate) fn interface_count(cte: u8) -> u8 {
    TEMPLATES[cte as usize].n_interfaces
}

pub(crate) fn endpoint_count(cte: u8, interface: u8) -> u8 {
    TEMPLATES[cte as usize].endpoints[interface as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_template_by_shape() {
        let hub = find_template(0x0424, 0x2514, 25, 1).unwrap();
        assert_eq!(interface_count(hub), 1);
        assert_eq!(endpoint_count(hub, 0), 1);

        let hid = find_template(0x1234, 0x5678, 32, 1).unwrap();
        assert_eq!(endpoint_count(hid, 0), 2);
    }

    #[test]
    fn test_find_template_rejects_unknown_shape() {
        assert!(find_template(0x1234, 0x5678, 99, 1).is_none());
        assert!(find_template(0x1234, 0x5678, 32, 2).is_none());
    }
}
