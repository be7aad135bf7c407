//! Typed views over raw MAVLink packet buffers.
//!
//! The router hands this endpoint whole, CRC-validated frames as raw bytes.
//! `PacketView` exposes the message id and payload without re-parsing the
//! message through a dialect decoder, and accounts for MAVLink v2 payload
//! truncation: trailing zero bytes are trimmed on the wire, so consumers
//! that decode fixed-layout payloads must zero-extend by `trimmed_zeros`.

use crate::error::{Result, SinkError};
use mavlink::MavlinkVersion;

/// MAVLink v1 start-of-frame byte.
pub const MAVLINK_STX_V1: u8 = 0xFE;
/// MAVLink v2 start-of-frame byte.
pub const MAVLINK_STX_V2: u8 = 0xFD;

const V1_HEADER_LEN: usize = 6;
const V2_HEADER_LEN: usize = 10;
const CHECKSUM_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const INCOMPAT_FLAG_SIGNED: u8 = 0x01;

/// COMMAND_LONG message id.
pub const MSG_ID_COMMAND_LONG: u32 = 76;
/// COMMAND_ACK message id.
pub const MSG_ID_COMMAND_ACK: u32 = 77;
/// LOGGING_DATA message id.
pub const MSG_ID_LOGGING_DATA: u32 = 266;
/// LOGGING_DATA_ACKED message id.
pub const MSG_ID_LOGGING_DATA_ACKED: u32 = 267;
/// LOGGING_ACK message id.
pub const MSG_ID_LOGGING_ACK: u32 = 268;

/// ULog file magic: "ULog" 0x01 0x12 0x35.
pub const ULOG_MAGIC: [u8; 7] = [0x55, 0x4C, 0x6F, 0x67, 0x01, 0x12, 0x35];
/// Size of the ULog file header (magic, version, start timestamp).
pub const ULOG_HEADER_LEN: usize = 16;

/// Payload capacity of one LOGGING_DATA[_ACKED] fragment.
pub const FRAGMENT_DATA_LEN: usize = 249;
/// `first_message_offset` sentinel: no record boundary in this fragment.
pub const NO_FIRST_MESSAGE_OFFSET: u8 = 255;

// Full (untrimmed) payload lengths for the messages this endpoint decodes.
const COMMAND_ACK_WIRE_LEN: usize = 10;
const LOGGING_DATA_WIRE_LEN: usize = 255;

fn full_payload_len(msg_id: u32) -> Option<usize> {
    match msg_id {
        MSG_ID_COMMAND_ACK => Some(COMMAND_ACK_WIRE_LEN),
        MSG_ID_LOGGING_DATA | MSG_ID_LOGGING_DATA_ACKED => Some(LOGGING_DATA_WIRE_LEN),
        _ => None,
    }
}

/// A borrowed, classified view of one framed MAVLink packet.
#[derive(Debug)]
pub struct PacketView<'a> {
    /// Protocol version, from the start-of-frame byte.
    pub version: MavlinkVersion,
    /// 24-bit message id (8-bit for v1).
    pub msg_id: u32,
    /// Declared payload bytes, borrowed from the packet buffer.
    pub payload: &'a [u8],
    /// Zero bytes the sender trimmed from the payload tail (v2 only).
    pub trimmed_zeros: u8,
}

impl<'a> PacketView<'a> {
    /// Parses a raw framed packet into a view.
    ///
    /// Framing and CRC are validated upstream by the router; this only
    /// checks that the declared payload length fits the buffer.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let magic = *buf
            .first()
            .ok_or_else(|| SinkError::protocol("empty packet"))?;

        match magic {
            MAVLINK_STX_V2 => Self::parse_v2(buf),
            MAVLINK_STX_V1 => Self::parse_v1(buf),
            other => Err(SinkError::protocol(format!(
                "unknown start-of-frame byte 0x{other:02X}"
            ))),
        }
    }

    fn parse_v1(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < V1_HEADER_LEN {
            return Err(SinkError::protocol(format!(
                "v1 packet too short for header: {} bytes",
                buf.len()
            )));
        }
        let payload_len = buf[1] as usize;
        let total = V1_HEADER_LEN + payload_len + CHECKSUM_LEN;
        if buf.len() < total {
            return Err(SinkError::protocol(format!(
                "truncated v1 payload: have {} bytes, need {total}",
                buf.len()
            )));
        }

        Ok(Self {
            version: MavlinkVersion::V1,
            msg_id: buf[5] as u32,
            payload: &buf[V1_HEADER_LEN..V1_HEADER_LEN + payload_len],
            trimmed_zeros: 0,
        })
    }

    fn parse_v2(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < V2_HEADER_LEN {
            return Err(SinkError::protocol(format!(
                "v2 packet too short for header: {} bytes",
                buf.len()
            )));
        }
        let payload_len = buf[1] as usize;
        let signature_len = if buf[2] & INCOMPAT_FLAG_SIGNED != 0 {
            SIGNATURE_LEN
        } else {
            0
        };
        let total = V2_HEADER_LEN + payload_len + CHECKSUM_LEN + signature_len;
        if buf.len() < total {
            return Err(SinkError::protocol(format!(
                "truncated v2 payload: have {} bytes, need {total}",
                buf.len()
            )));
        }

        let msg_id = buf[7] as u32 | (buf[8] as u32) << 8 | (buf[9] as u32) << 16;
        let trimmed_zeros = full_payload_len(msg_id)
            .map(|full| full.saturating_sub(payload_len))
            .unwrap_or(0) as u8;

        Ok(Self {
            version: MavlinkVersion::V2,
            msg_id,
            payload: &buf[V2_HEADER_LEN..V2_HEADER_LEN + payload_len],
            trimmed_zeros,
        })
    }
}

/// Decoded COMMAND_ACK fields this endpoint acts on.
#[derive(Debug, Clone, Copy)]
pub struct CommandAck {
    /// The command being acknowledged.
    pub command: u16,
    /// MAV_RESULT of the command.
    pub result: u8,
}

impl CommandAck {
    /// Decodes a COMMAND_ACK payload, zero-extending the trimmed tail.
    pub fn decode(view: &PacketView<'_>) -> Result<Self> {
        let mut full = [0u8; COMMAND_ACK_WIRE_LEN];
        let n = view.payload.len().min(COMMAND_ACK_WIRE_LEN);
        full[..n].copy_from_slice(&view.payload[..n]);

        Ok(Self {
            command: u16::from_le_bytes([full[0], full[1]]),
            result: full[2],
        })
    }
}

/// One decoded LOGGING_DATA or LOGGING_DATA_ACKED fragment.
///
/// Wire layout (fields sorted by size): sequence u16, target_system,
/// target_component, length, first_message_offset, data[249].
#[derive(Debug, Clone)]
pub struct LogFragment {
    /// 16-bit fragment sequence number.
    pub sequence: u16,
    /// System the fragment is addressed to.
    pub target_system: u8,
    /// Component the fragment is addressed to.
    pub target_component: u8,
    /// Number of valid bytes in `data`.
    pub length: u8,
    /// Offset of the first fresh ULog record in `data`, or 255 for none.
    pub first_message_offset: u8,
    /// ULog stream bytes.
    pub data: [u8; FRAGMENT_DATA_LEN],
}

impl LogFragment {
    /// Decodes a LOGGING_DATA[_ACKED] payload, zero-extending the trimmed
    /// tail. Fails if the declared `length` exceeds the data capacity.
    pub fn decode(view: &PacketView<'_>) -> Result<Self> {
        let mut full = [0u8; LOGGING_DATA_WIRE_LEN];
        let n = view.payload.len().min(LOGGING_DATA_WIRE_LEN);
        full[..n].copy_from_slice(&view.payload[..n]);

        let length = full[4];
        if length as usize > FRAGMENT_DATA_LEN {
            return Err(SinkError::protocol(format!(
                "fragment length {length} exceeds data capacity {FRAGMENT_DATA_LEN}"
            )));
        }

        let mut data = [0u8; FRAGMENT_DATA_LEN];
        data.copy_from_slice(&full[6..]);

        Ok(Self {
            sequence: u16::from_le_bytes([full[0], full[1]]),
            target_system: full[2],
            target_component: full[3],
            length,
            first_message_offset: full[5],
            data,
        })
    }

    /// The valid portion of `data`.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mavlink::common::{
        MavMessage, COMMAND_ACK_DATA, LOGGING_DATA_DATA,
    };
    use mavlink::{MavHeader, Message};

    fn frame_v2(msg: &MavMessage) -> Vec<u8> {
        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, MavHeader::default(), msg).unwrap();
        buf
    }

    #[test]
    fn test_v2_view_exposes_msg_id_and_payload() {
        let msg = MavMessage::COMMAND_ACK(COMMAND_ACK_DATA::default());
        let buf = frame_v2(&msg);

        let view = PacketView::parse(&buf).unwrap();
        assert_eq!(view.version, MavlinkVersion::V2);
        assert_eq!(view.msg_id, msg.message_id());
        assert_eq!(view.msg_id, MSG_ID_COMMAND_ACK);
    }

    #[test]
    fn test_v1_view_has_no_trimmed_zeros() {
        let msg = MavMessage::COMMAND_ACK(COMMAND_ACK_DATA::default());
        let mut buf = Vec::new();
        mavlink::write_v1_msg(&mut buf, MavHeader::default(), &msg).unwrap();

        let view = PacketView::parse(&buf).unwrap();
        assert_eq!(view.version, MavlinkVersion::V1);
        assert_eq!(view.trimmed_zeros, 0);
    }

    #[test]
    fn test_logging_data_roundtrip_with_trimmed_tail() {
        // Data tail full of zeros: the v2 writer trims it off the wire, the
        // decoder must restore it.
        let mut data = [0u8; 249];
        data[0] = 0xAA;
        data[1] = 0xBB;
        let msg = MavMessage::LOGGING_DATA(LOGGING_DATA_DATA {
            sequence: 0x1234,
            target_system: 1,
            target_component: 0,
            length: 2,
            first_message_offset: 0,
            data,
        });
        let buf = frame_v2(&msg);

        let view = PacketView::parse(&buf).unwrap();
        assert_eq!(view.msg_id, MSG_ID_LOGGING_DATA);
        assert!(view.trimmed_zeros > 0, "zero tail should be trimmed");

        let frag = LogFragment::decode(&view).unwrap();
        assert_eq!(frag.sequence, 0x1234);
        assert_eq!(frag.length, 2);
        assert_eq!(frag.first_message_offset, 0);
        assert_eq!(frag.payload(), &[0xAA, 0xBB]);
        assert!(frag.data[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fragment_length_bound_rejected() {
        let mut data = [0u8; 249];
        data[0] = 1;
        let msg = MavMessage::LOGGING_DATA(LOGGING_DATA_DATA {
            sequence: 0,
            target_system: 1,
            target_component: 0,
            length: 250, // > data capacity
            first_message_offset: 255,
            data,
        });
        let buf = frame_v2(&msg);

        let view = PacketView::parse(&buf).unwrap();
        assert!(matches!(
            LogFragment::decode(&view),
            Err(SinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let msg = MavMessage::LOGGING_DATA(LOGGING_DATA_DATA {
            sequence: 7,
            target_system: 1,
            target_component: 0,
            length: 100,
            first_message_offset: 255,
            data: [0x55; 249],
        });
        let buf = frame_v2(&msg);

        // Chop mid-payload: declared length no longer fits.
        let cut = &buf[..buf.len() - 40];
        assert!(matches!(
            PacketView::parse(cut),
            Err(SinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_magic_rejected() {
        assert!(PacketView::parse(&[0x00, 0x01, 0x02]).is_err());
        assert!(PacketView::parse(&[]).is_err());
    }
}
