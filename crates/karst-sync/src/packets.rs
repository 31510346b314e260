//! The length-prefixed packet framing and payload layouts.
//!
//! Frames are `{u32 size, u32 type, payload[size - 8]}`, little-endian,
//! where `size` covers the whole frame. Payloads are bincode-encoded with
//! the standard configuration.

use karst_core::error::SyncError;
use karst_core::types::{Block, Hash256};

/// Bytes taken by the `size` and `type` fields.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Largest frame a peer may send.
pub const MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;

/// Packet types consumed by the synchronization core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    PushBlock,
    PullBlock,
    ChainInfo,
    BlockHashes,
    PullBlocks,
    PushTransactions,
}

impl PacketType {
    pub fn code(&self) -> u32 {
        match self {
            Self::PushBlock => 0x101,
            Self::PullBlock => 0x102,
            Self::ChainInfo => 0x103,
            Self::BlockHashes => 0x104,
            Self::PullBlocks => 0x105,
            Self::PushTransactions => 0x106,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x101 => Some(Self::PushBlock),
            0x102 => Some(Self::PullBlock),
            0x103 => Some(Self::ChainInfo),
            0x104 => Some(Self::BlockHashes),
            0x105 => Some(Self::PullBlocks),
            0x106 => Some(Self::PushTransactions),
            _ => None,
        }
    }
}

/// A framed packet: type plus raw payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

impl Packet {
    /// A packet with an empty payload (a bare request).
    pub fn empty(packet_type: PacketType) -> Self {
        Self { packet_type, payload: Vec::new() }
    }

    /// A packet carrying a bincode-encoded payload.
    pub fn with_payload<T: bincode::Encode>(
        packet_type: PacketType,
        payload: &T,
    ) -> Result<Self, SyncError> {
        let payload = bincode::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| SyncError::MalformedPacket(e.to_string()))?;
        Ok(Self { packet_type, payload })
    }

    /// Decode this packet's payload.
    pub fn decode_payload<T: bincode::Decode<()>>(&self) -> Result<T, SyncError> {
        let (value, consumed) =
            bincode::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| SyncError::MalformedPacket(e.to_string()))?;
        if consumed != self.payload.len() {
            return Err(SyncError::MalformedPacket("trailing payload bytes".into()));
        }
        Ok(value)
    }

    /// Encode the full frame.
    pub fn encode(&self) -> Vec<u8> {
        let size = (PACKET_HEADER_SIZE + self.payload.len()) as u32;
        let mut frame = Vec::with_capacity(size as usize);
        frame.extend_from_slice(&size.to_le_bytes());
        frame.extend_from_slice(&self.packet_type.code().to_le_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Decode one frame from the front of `bytes`; returns the packet and
    /// the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), SyncError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(SyncError::MalformedPacket("truncated header".into()));
        }
        let size = u32::from_le_bytes(bytes[0..4].try_into().expect("slice is 4 bytes")) as usize;
        if size < PACKET_HEADER_SIZE || size > MAX_PACKET_SIZE {
            return Err(SyncError::MalformedPacket(format!("bad frame size {size}")));
        }
        if bytes.len() < size {
            return Err(SyncError::MalformedPacket("truncated frame".into()));
        }
        let code = u32::from_le_bytes(bytes[4..8].try_into().expect("slice is 4 bytes"));
        let packet_type = PacketType::from_code(code)
            .ok_or_else(|| SyncError::MalformedPacket(format!("unknown packet type {code:#x}")))?;
        Ok((Self { packet_type, payload: bytes[PACKET_HEADER_SIZE..size].to_vec() }, size))
    }
}

/// Response payload for `ChainInfo`.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ChainInfoPayload {
    pub score: u128,
    pub height: u64,
}

/// Request payload for `BlockHashes`.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockHashesRequest {
    pub start_height: u64,
    pub max: u32,
}

/// Response payload for `BlockHashes`.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockHashesResponse {
    pub hashes: Vec<Hash256>,
}

/// Request payload for `PullBlocks`.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct PullBlocksRequest {
    pub start_height: u64,
    pub max: u32,
}

/// Response payload for `PullBlocks` (and `PullBlock`).
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlocksResponse {
    pub blocks: Vec<Block>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_codes_round_trip() {
        for packet_type in [
            PacketType::PushBlock,
            PacketType::PullBlock,
            PacketType::ChainInfo,
            PacketType::BlockHashes,
            PacketType::PullBlocks,
            PacketType::PushTransactions,
        ] {
            assert_eq!(PacketType::from_code(packet_type.code()), Some(packet_type));
        }
        assert_eq!(PacketType::from_code(0xDEAD), None);
    }

    #[test]
    fn frame_layout_is_little_endian() {
        let packet = Packet { packet_type: PacketType::ChainInfo, payload: vec![0xAB, 0xCD] };
        let frame = packet.encode();
        assert_eq!(frame.len(), 10);
        assert_eq!(&frame[0..4], &10u32.to_le_bytes());
        assert_eq!(&frame[4..8], &0x103u32.to_le_bytes());
        assert_eq!(&frame[8..], &[0xAB, 0xCD]);
    }

    #[test]
    fn encode_decode_round_trip() {
        let packet = Packet::with_payload(
            PacketType::BlockHashes,
            &BlockHashesResponse { hashes: vec![Hash256([0x11; 32]), Hash256([0x22; 32])] },
        )
        .unwrap();
        let frame = packet.encode();
        let (decoded, consumed) = Packet::decode(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, packet);

        let response: BlockHashesResponse = decoded.decode_payload().unwrap();
        assert_eq!(response.hashes.len(), 2);
    }

    #[test]
    fn decode_consumes_one_frame_from_stream() {
        let a = Packet::empty(PacketType::ChainInfo).encode();
        let b = Packet::with_payload(
            PacketType::PullBlocks,
            &PullBlocksRequest { start_height: 5, max: 10 },
        )
        .unwrap()
        .encode();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let (first, consumed) = Packet::decode(&stream).unwrap();
        assert_eq!(first.packet_type, PacketType::ChainInfo);
        let (second, _) = Packet::decode(&stream[consumed..]).unwrap();
        assert_eq!(second.packet_type, PacketType::PullBlocks);
    }

    #[test]
    fn decode_rejects_truncation_and_bad_sizes() {
        assert!(Packet::decode(&[0x01, 0x02]).is_err());

        let mut undersized = Packet::empty(PacketType::ChainInfo).encode();
        undersized[0..4].copy_from_slice(&4u32.to_le_bytes());
        assert!(Packet::decode(&undersized).is_err());

        let mut truncated = Packet::with_payload(
            PacketType::BlockHashes,
            &BlockHashesResponse { hashes: vec![Hash256::ZERO] },
        )
        .unwrap()
        .encode();
        truncated.pop();
        assert!(Packet::decode(&truncated).is_err());
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut frame = Packet::empty(PacketType::ChainInfo).encode();
        frame[4..8].copy_from_slice(&0x999u32.to_le_bytes());
        assert!(Packet::decode(&frame).is_err());
    }

    #[test]
    fn payload_with_trailing_bytes_is_rejected() {
        let mut packet = Packet::with_payload(
            PacketType::ChainInfo,
            &ChainInfoPayload { score: 1, height: 2 },
        )
        .unwrap();
        packet.payload.push(0xFF);
        assert!(packet.decode_payload::<ChainInfoPayload>().is_err());
    }

    #[test]
    fn chain_info_payload_preserves_u128_scores() {
        let payload = ChainInfoPayload { score: u128::MAX - 7, height: 42 };
        let packet = Packet::with_payload(PacketType::ChainInfo, &payload).unwrap();
        assert_eq!(packet.decode_payload::<ChainInfoPayload>().unwrap(), payload);
    }
}
