//! Wire codec for [`ReplicaDesc`].
//!
//! Uses `postcard`, a length-prefixed, schema-evolvable binary format: new
//! fields can be appended to the end of the struct in a later release
//! without breaking readers that only know the older shape (postcard's
//! `varint` length framing and structural encoding tolerate trailing
//! additions when paired with `#[serde(default)]` on the new field).

use thiserror::Error;

use crate::ReplicaDesc;

/// Errors from encoding or decoding a [`ReplicaDesc`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// The bytes did not decode to a valid `ReplicaDesc`.
    #[error("failed to decode replica descriptor: {0}")]
    Decode(#[from] postcard::Error),
}

/// Encodes a [`ReplicaDesc`] to its wire representation.
pub fn encode(desc: &ReplicaDesc) -> Vec<u8> {
    postcard::to_allocvec(desc).expect("ReplicaDesc encoding is infallible")
}

/// Decodes a [`ReplicaDesc`] from its wire representation.
pub fn decode(bytes: &[u8]) -> Result<ReplicaDesc, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}
