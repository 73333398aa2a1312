//! The combined `libp2p` behaviour the driver task drives. Kademlia is the
//! routing/provider-record core; identify feeds observed addresses back
//! into Kademlia and the reachability module; ping supplies the RTT
//! samples the reputation/health stores consume; relay client + dcutr +
//! autonat give the transport the wire-level support the `relay`/
//! `holepunch`/`reachability` crates reason about at a higher level.
//!
//! One derived `NetworkBehaviour` struct with its generated event enum,
//! the standard `libp2p` shape for composing several protocol behaviours
//! behind a single `Swarm`.

use crate::transfer::ChunkTransferBehaviour;
use libp2p::{autonat, dcutr, identify, kad, ping, relay, swarm::NetworkBehaviour};

#[derive(NetworkBehaviour)]
pub struct ChiralBehaviour {
    pub kad: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub autonat: autonat::Behaviour,
    pub chunk_transfer: ChunkTransferBehaviour,
}
