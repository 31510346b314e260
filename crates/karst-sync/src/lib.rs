//! # karst-sync
//! Periodic chain synchronization: compare scores with peers, negotiate a
//! common ancestor, pull and evaluate the divergent suffix, and hand
//! winning chains to the pipeline.

pub mod api;
pub mod packets;
pub mod peers;
pub mod synchronizer;

pub use api::{ChainApi, ChainApiServer, ChainInfo, LoopbackIo, PacketIo, RemoteChainApi};
pub use peers::{PeerId, PeerRegistry};
pub use synchronizer::{ChainSynchronizer, SyncRoundOutcome};
