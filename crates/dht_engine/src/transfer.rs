//! Wire-level content fetch over `libp2p-request-response`: the "peers"
//! step between the Scheduler/Manifest Service and the Chunk Store
//! (`spec.md` §4.9, §6 `download_file`/`search_file_metadata`). Kept as a
//! thin request/response pair; callers still decide *which* peer to ask
//! and never touch this module directly, matching the `Native` protocol
//! capability slot of `spec.md` §9's tagged-variant dispatch (the other
//! four variants are external collaborators).

use chiral_proto::Cid;
use libp2p::request_response;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferRequest {
    Chunk(Cid),
    Manifest(Cid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferResponse {
    Found(Vec<u8>),
    NotFound,
}

pub type ChunkTransferBehaviour = request_response::cbor::Behaviour<TransferRequest, TransferResponse>;

pub fn new_behaviour() -> ChunkTransferBehaviour {
    request_response::cbor::Behaviour::new(
        [(
            libp2p::StreamProtocol::new("/chiral/chunk-transfer/1.0.0"),
            request_response::ProtocolSupport::Full,
        )],
        request_response::Config::default(),
    )
}

/// Serves inbound content requests. Implemented by the full node's
/// `chunk_store`/`manifest` stack; a bare closure or in-memory map is
/// enough for tests. Kept as a trait so `dht_engine` never depends on
/// `chunk_store`/`manifest` directly: the DHT Engine only knows bytes for
/// a request, never the store's on-disk layout.
pub trait ChunkProvider: Send + Sync {
    fn get_chunk(&self, cid: &Cid) -> Option<Vec<u8>>;
    fn get_manifest(&self, root_cid: &Cid) -> Option<Vec<u8>>;
}
