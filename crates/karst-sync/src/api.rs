//! The remote chain API and its packet-level server.
//!
//! [`RemoteChainApi`] turns typed requests into packets over a [`PacketIo`]
//! transport; [`ChainApiServer`] answers those packets from local storage.
//! Connection management is out of scope: a transport is anything that can
//! round-trip one packet, and [`LoopbackIo`] wires a client directly to
//! another node's server in process.

use std::sync::Arc;

use async_trait::async_trait;

use karst_cache::BlockStorage;
use karst_consensus::score::{ChainScore, ScoreTracker};
use karst_core::error::SyncError;
use karst_core::types::{Block, Hash256};

use crate::packets::{
    BlockHashesRequest, BlockHashesResponse, BlocksResponse, ChainInfoPayload, Packet,
    PacketType, PullBlocksRequest,
};

/// A peer's advertised chain summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainInfo {
    pub score: ChainScore,
    pub height: u64,
}

/// Typed view of a remote peer's chain.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn chain_info(&self) -> Result<ChainInfo, SyncError>;

    /// Entity hashes of up to `max` blocks starting at `start_height`,
    /// ascending.
    async fn hashes_from(&self, start_height: u64, max: u32) -> Result<Vec<Hash256>, SyncError>;

    /// Up to `max` full blocks starting at `start_height`, ascending.
    async fn blocks_from(&self, start_height: u64, max: u32) -> Result<Vec<Block>, SyncError>;
}

/// One-packet-in, one-packet-out transport.
#[async_trait]
pub trait PacketIo: Send + Sync {
    async fn round_trip(&self, request: Packet) -> Result<Packet, SyncError>;
}

/// [`ChainApi`] implementation speaking the packet protocol.
pub struct RemoteChainApi<Io: PacketIo> {
    io: Io,
}

impl<Io: PacketIo> RemoteChainApi<Io> {
    pub fn new(io: Io) -> Self {
        Self { io }
    }

    async fn expect(&self, request: Packet, packet_type: PacketType) -> Result<Packet, SyncError> {
        let response = self.io.round_trip(request).await?;
        if response.packet_type != packet_type {
            return Err(SyncError::MalformedPacket(format!(
                "expected {packet_type:?}, got {:?}",
                response.packet_type,
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl<Io: PacketIo> ChainApi for RemoteChainApi<Io> {
    async fn chain_info(&self) -> Result<ChainInfo, SyncError> {
        let response = self
            .expect(Packet::empty(PacketType::ChainInfo), PacketType::ChainInfo)
            .await?;
        let payload: ChainInfoPayload = response.decode_payload()?;
        Ok(ChainInfo { score: ChainScore(payload.score), height: payload.height })
    }

    async fn hashes_from(&self, start_height: u64, max: u32) -> Result<Vec<Hash256>, SyncError> {
        let request = Packet::with_payload(
            PacketType::BlockHashes,
            &BlockHashesRequest { start_height, max },
        )?;
        let response = self.expect(request, PacketType::BlockHashes).await?;
        let payload: BlockHashesResponse = response.decode_payload()?;
        Ok(payload.hashes)
    }

    async fn blocks_from(&self, start_height: u64, max: u32) -> Result<Vec<Block>, SyncError> {
        let request = Packet::with_payload(
            PacketType::PullBlocks,
            &PullBlocksRequest { start_height, max },
        )?;
        let response = self.expect(request, PacketType::PullBlocks).await?;
        let payload: BlocksResponse = response.decode_payload()?;
        Ok(payload.blocks)
    }
}

/// Caps applied to request sizes by the server.
const MAX_HASHES_PER_RESPONSE: u32 = 1_024;
const MAX_BLOCKS_PER_RESPONSE: u32 = 256;

/// Answers chain packets from local storage and the score tracker.
pub struct ChainApiServer {
    storage: Arc<dyn BlockStorage>,
    score: Arc<ScoreTracker>,
}

impl ChainApiServer {
    pub fn new(storage: Arc<dyn BlockStorage>, score: Arc<ScoreTracker>) -> Self {
        Self { storage, score }
    }

    /// Handle one request packet.
    pub fn handle(&self, request: &Packet) -> Result<Packet, SyncError> {
        match request.packet_type {
            PacketType::ChainInfo => {
                let payload = ChainInfoPayload {
                    score: self.score.current().0,
                    height: self.storage.chain_height(),
                };
                Packet::with_payload(PacketType::ChainInfo, &payload)
            }
            PacketType::BlockHashes => {
                let req: BlockHashesRequest = request.decode_payload()?;
                let hashes = self
                    .storage
                    .load_hashes_from(req.start_height, req.max.min(MAX_HASHES_PER_RESPONSE) as usize)
                    .map_err(|e| SyncError::MalformedPacket(e.to_string()))?;
                Packet::with_payload(PacketType::BlockHashes, &BlockHashesResponse { hashes })
            }
            PacketType::PullBlocks => {
                let req: PullBlocksRequest = request.decode_payload()?;
                let mut blocks = Vec::new();
                for height in req.start_height.. {
                    if blocks.len() >= req.max.min(MAX_BLOCKS_PER_RESPONSE) as usize {
                        break;
                    }
                    match self
                        .storage
                        .load_block(height)
                        .map_err(|e| SyncError::MalformedPacket(e.to_string()))?
                    {
                        Some(block) => blocks.push(block),
                        None => break,
                    }
                }
                Packet::with_payload(PacketType::PullBlocks, &BlocksResponse { blocks })
            }
            PacketType::PullBlock => {
                let req: PullBlocksRequest = request.decode_payload()?;
                let blocks = self
                    .storage
                    .load_block(req.start_height)
                    .map_err(|e| SyncError::MalformedPacket(e.to_string()))?
                    .into_iter()
                    .collect();
                Packet::with_payload(PacketType::PullBlock, &BlocksResponse { blocks })
            }
            other => Err(SyncError::MalformedPacket(format!(
                "server cannot answer {other:?}",
            ))),
        }
    }
}

/// In-process transport: requests are encoded, decoded, and answered by a
/// [`ChainApiServer`] directly. Exercises the full packet codec without a
/// socket.
pub struct LoopbackIo {
    server: Arc<ChainApiServer>,
}

impl LoopbackIo {
    pub fn new(server: Arc<ChainApiServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl PacketIo for LoopbackIo {
    async fn round_trip(&self, request: Packet) -> Result<Packet, SyncError> {
        // Force both directions through the frame codec, as a socket would.
        let (request, _) = Packet::decode(&request.encode())?;
        let response = self.server.handle(&request)?;
        let (response, _) = Packet::decode(&response.encode())?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_cache::MemoryBlockStorage;
    use karst_core::element::BlockElement;
    use karst_core::genesis;

    fn server_with_genesis(score: u128) -> (Arc<ChainApiServer>, Arc<MemoryBlockStorage>) {
        let element =
            BlockElement::compute(genesis::genesis_block(), &genesis::genesis_hash()).unwrap();
        let storage = Arc::new(MemoryBlockStorage::with_genesis(element));
        let server = Arc::new(ChainApiServer::new(
            Arc::clone(&storage) as Arc<dyn BlockStorage>,
            Arc::new(ScoreTracker::new(ChainScore(score))),
        ));
        (server, storage)
    }

    #[tokio::test]
    async fn chain_info_reports_score_and_height() {
        let (server, _storage) = server_with_genesis(777);
        let api = RemoteChainApi::new(LoopbackIo::new(server));
        let info = api.chain_info().await.unwrap();
        assert_eq!(info.score, ChainScore(777));
        assert_eq!(info.height, 1);
    }

    #[tokio::test]
    async fn hashes_from_round_trips() {
        let (server, storage) = server_with_genesis(0);
        let api = RemoteChainApi::new(LoopbackIo::new(server));
        let hashes = api.hashes_from(1, 16).await.unwrap();
        assert_eq!(hashes, storage.load_hashes_from(1, 16).unwrap());
        assert!(api.hashes_from(9, 16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocks_from_round_trips() {
        let (server, _storage) = server_with_genesis(0);
        let api = RemoteChainApi::new(LoopbackIo::new(server));
        let blocks = api.blocks_from(1, 16).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], genesis::genesis_block());
        assert!(api.blocks_from(2, 16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_rejects_unanswerable_types() {
        let (server, _storage) = server_with_genesis(0);
        assert!(server.handle(&Packet::empty(PacketType::PushBlock)).is_err());
    }
}
