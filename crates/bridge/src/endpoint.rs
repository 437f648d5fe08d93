//! Endpoint descriptors and bulk-pair discovery

use crate::error::{BridgeError, Result};

/// Direction bit of an endpoint address
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// USB transfer type of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// The parts of an endpoint descriptor the bridge cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address including the direction bit
    pub address: u8,
    pub kind: TransferKind,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn new(address: u8, kind: TransferKind, max_packet_size: u16) -> Self {
        Self {
            address,
            kind,
            max_packet_size,
        }
    }

    /// Bulk IN endpoint with the given number (1..=15)
    pub fn bulk_in(number: u8, max_packet_size: u16) -> Self {
        Self::new(ENDPOINT_DIR_IN | (number & 0x0f), TransferKind::Bulk, max_packet_size)
    }

    /// Bulk OUT endpoint with the given number (1..=15)
    pub fn bulk_out(number: u8, max_packet_size: u16) -> Self {
        Self::new(number & 0x0f, TransferKind::Bulk, max_packet_size)
    }

    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIR_IN != 0
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }
}

/// The endpoint pair a bridged device is driven through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub bulk_in: EndpointDescriptor,
    pub bulk_out: EndpointDescriptor,
}

/// Pick the bulk IN/OUT pair out of an interface's endpoints
///
/// Exactly one bulk endpoint per direction is required, and both must report
/// a non-zero max packet size since the inbound buffer is sized from it.
pub fn discover_bulk_endpoints(endpoints: &[EndpointDescriptor]) -> Result<BulkEndpoints> {
    let (bulk_in, bulk_out): (Vec<&EndpointDescriptor>, Vec<&EndpointDescriptor>) = endpoints
        .iter()
        .filter(|ep| ep.kind == TransferKind::Bulk)
        .partition(|ep| ep.is_in());

    match (bulk_in.as_slice(), bulk_out.as_slice()) {
        ([ep_in], [ep_out]) if ep_in.max_packet_size > 0 && ep_out.max_packet_size > 0 => {
            Ok(BulkEndpoints {
                bulk_in: **ep_in,
                bulk_out: **ep_out,
            })
        }
        _ => Err(BridgeError::NoBulkEndpoints {
            bulk_in: bulk_in.len(),
            bulk_out: bulk_out.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovers_single_pair() {
        let endpoints = [
            EndpointDescriptor::new(0x83, TransferKind::Interrupt, 8),
            EndpointDescriptor::bulk_in(1, 64),
            EndpointDescriptor::bulk_out(2, 64),
        ];

        let bulk = discover_bulk_endpoints(&endpoints).unwrap();
        assert_eq!(bulk.bulk_in.address, 0x81);
        assert_eq!(bulk.bulk_out.address, 0x02);
        assert_eq!(bulk.bulk_in.max_packet_size, 64);
    }

    #[test]
    fn test_rejects_missing_direction() {
        let endpoints = [EndpointDescriptor::bulk_in(1, 64)];

        assert_eq!(
            discover_bulk_endpoints(&endpoints),
            Err(BridgeError::NoBulkEndpoints {
                bulk_in: 1,
                bulk_out: 0
            })
        );
        assert!(discover_bulk_endpoints(&[]).is_err());
    }

    #[test]
    fn test_rejects_ambiguous_pair() {
        let endpoints = [
            EndpointDescriptor::bulk_in(1, 64),
            EndpointDescriptor::bulk_in(3, 64),
            EndpointDescriptor::bulk_out(2, 64),
        ];

        assert_eq!(
            discover_bulk_endpoints(&endpoints),
            Err(BridgeError::NoBulkEndpoints {
                bulk_in: 2,
                bulk_out: 1
            })
        );
    }

    #[test]
    fn test_rejects_zero_packet_size() {
        let endpoints = [
            EndpointDescriptor::bulk_in(1, 0),
            EndpointDescriptor::bulk_out(2, 64),
        ];

        assert!(discover_bulk_endpoints(&endpoints).is_err());
    }

    #[test]
    fn test_endpoint_direction() {
        // Bit 7 = 1 means IN endpoint
        assert!(EndpointDescriptor::bulk_in(1, 64).is_in());
        assert!(!EndpointDescriptor::bulk_out(1, 64).is_in());
        assert_eq!(EndpointDescriptor::bulk_in(5, 64).number(), 5);
    }
}
