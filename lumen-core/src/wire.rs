//! Framing: 2-byte LE size + fixed LE header + bincode payload.
//!
//! The header carries the correlation tuple (source, sequence, target)
//! verbatim so replies can be matched to requests.

use crate::protocol::{pkt_type, Header, Packet, PROTOCOL};
use crate::target::Target;

/// size(2) protocol(2) pkt_type(2) source(4) target(8) sequence(1) flags(1)
pub const HEADER_LEN: usize = 20;
const MAX_FRAME_LEN: usize = u16::MAX as usize;

const FLAG_ACK_REQUIRED: u8 = 0b001;
const FLAG_RES_REQUIRED: u8 = 0b010;
const FLAG_TAGGED: u8 = 0b100;

/// Pack/unpack service consumed by the dispatch engine. The engine never
/// looks at payloads beyond type and ack classification.
pub trait Codec: Send + Sync {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, FrameEncodeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Packet, FrameDecodeError>;

    fn is_ack(&self, protocol: u16, pkt_type: u16) -> bool {
        protocol == PROTOCOL && pkt_type == pkt_type::ACKNOWLEDGEMENT
    }
}

/// Default codec; see module docs for the layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Codec for FrameCodec {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
        encode_frame(packet)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Packet, FrameDecodeError> {
        decode_frame(bytes)
    }
}

/// Encode a packet into a single datagram.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(&packet.payload).map_err(FrameEncodeError::Encode)?;
    let total = HEADER_LEN + payload.len();
    if total > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let h = &packet.header;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_le_bytes());
    out.extend_from_slice(&h.protocol.to_le_bytes());
    out.extend_from_slice(&h.pkt_type.to_le_bytes());
    out.extend_from_slice(&h.source.to_le_bytes());
    let mut target = [0u8; 8];
    if let Some(t) = h.target {
        target[..6].copy_from_slice(t.as_bytes());
    }
    out.extend_from_slice(&target);
    out.push(h.sequence);
    let mut flags = 0u8;
    if h.ack_required {
        flags |= FLAG_ACK_REQUIRED;
    }
    if h.res_required {
        flags |= FLAG_RES_REQUIRED;
    }
    if h.target.is_none() {
        flags |= FLAG_TAGGED;
    }
    out.push(flags);
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one datagram.
pub fn decode_frame(bytes: &[u8]) -> Result<Packet, FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::Truncated);
    }
    let size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    if size < HEADER_LEN || bytes.len() < size {
        return Err(FrameDecodeError::Truncated);
    }
    let protocol = u16::from_le_bytes([bytes[2], bytes[3]]);
    let pkt_type = u16::from_le_bytes([bytes[4], bytes[5]]);
    let source = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let sequence = bytes[18];
    let flags = bytes[19];
    let target = if flags & FLAG_TAGGED != 0 {
        None
    } else {
        Some(Target::from_slice(&bytes[10..18]).map_err(|_| FrameDecodeError::Truncated)?)
    };
    let payload =
        bincode::deserialize(&bytes[HEADER_LEN..size]).map_err(FrameDecodeError::Decode)?;
    let packet = Packet {
        header: Header {
            protocol,
            pkt_type,
            source,
            sequence,
            target,
            ack_required: flags & FLAG_ACK_REQUIRED != 0,
            res_required: flags & FLAG_RES_REQUIRED != 0,
        },
        payload,
    };
    if packet.payload.pkt_type() != pkt_type {
        return Err(FrameDecodeError::TypeMismatch {
            header: pkt_type,
            payload: packet.payload.pkt_type(),
        });
    }
    Ok(packet)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("datagram shorter than its header")]
    Truncated,
    #[error("header says type {header} but payload is type {payload}")]
    TypeMismatch { header: u16, payload: u16 },
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
