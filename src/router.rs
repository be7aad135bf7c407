//! Bus contract between the host router and the capture endpoint.
//!
//! The router delivers whole, CRC-validated frames as raw bytes and accepts
//! the endpoint's outgoing frames the same way. Transport selection lives
//! entirely on the router side; this endpoint is transport-agnostic.

use bytes::Bytes;
use std::fmt;
use tokio::sync::broadcast;

/// Unique identifier for a routing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub usize);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.0)
    }
}

/// One routed MAVLink frame in wire format.
#[derive(Clone, Debug)]
pub struct RoutedPacket {
    /// Identifier of the endpoint that put this frame on the bus.
    pub source: EndpointId,
    /// The complete framed packet (v1 or v2), CRC included.
    pub bytes: Bytes,
    /// Wall-clock arrival timestamp in microseconds since UNIX_EPOCH.
    pub timestamp_us: u64,
}

/// Type alias for the packet bus sender.
pub type PacketBus = broadcast::Sender<RoutedPacket>;

/// Creates a new packet bus with the specified capacity.
///
/// Slow receivers drop the oldest packets once `capacity` is exceeded; the
/// capture endpoint treats such lag like on-wire loss and resynchronises.
pub fn create_bus(capacity: usize) -> PacketBus {
    let (tx, _) = broadcast::channel(capacity);
    tx
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_carries_raw_frames() {
        let bus = create_bus(16);
        let mut rx = bus.subscribe();

        let pkt = RoutedPacket {
            source: EndpointId(3),
            bytes: Bytes::from_static(&[0xFD, 0x00]),
            timestamp_us: 42,
        };
        bus.send(pkt).expect("send");

        let got = rx.recv().await.expect("recv");
        assert_eq!(got.source, EndpointId(3));
        assert_eq!(&got.bytes[..], &[0xFD, 0x00]);
    }
}
