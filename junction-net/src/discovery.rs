//! Pubsub peer discovery: peers periodically publish a record of their
//! addresses on a dedicated topic, and subscribers learn dialable peers from it.
//!
//! The record is the protobuf `Peer { bytes publicKey = 1; repeated bytes addrs = 2; }`
//! published without a length prefix. The peer id is derived from the key.

use libp2p::identity::PublicKey;
use libp2p::{Multiaddr, PeerId};
use tracing::warn;

use crate::error::NetworkError;
use crate::wire::{codec_error, FieldValue, ProtoReader, ProtoWriter};

/// Encode this node's advertisement.
pub fn encode_peer_record(public_key: &PublicKey, addrs: &[Multiaddr]) -> Vec<u8> {
    addrs
        .iter()
        .fold(
            ProtoWriter::new().bytes(1, &public_key.encode_protobuf()),
            |writer, addr| writer.bytes(2, &addr.to_vec()),
        )
        .finish()
}

/// Decode an advertisement. Addresses that fail to parse are logged and skipped.
pub fn decode_peer_record(data: &[u8]) -> Result<(PeerId, Vec<Multiaddr>), NetworkError> {
    let mut public_key = None;
    let mut raw_addrs = Vec::new();
    for field in ProtoReader::new(data) {
        match field? {
            (1, FieldValue::Bytes(bytes)) => public_key = Some(bytes),
            (2, FieldValue::Bytes(bytes)) => raw_addrs.push(bytes),
            _ => {}
        }
    }

    let public_key = public_key.ok_or_else(|| codec_error("peer record without public key"))?;
    let peer_id = PublicKey::try_decode_protobuf(public_key)
        .map_err(|e| codec_error(format!("invalid public key: {}", e)))?
        .to_peer_id();

    let addrs = raw_addrs
        .into_iter()
        .filter_map(|bytes| {
            Multiaddr::try_from(bytes.to_vec())
                .map_err(|e| warn!(%peer_id, "invalid advertised multiaddr: {}", e))
                .ok()
        })
        .collect();
    Ok((peer_id, addrs))
}
