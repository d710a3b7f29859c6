//! Serialization boundary between domain events and stores.
//!
//! A [`Codec`] turns payloads and snapshots into bytes. [`EventSet`] is
//! implemented by an aggregate's closed event enum (normally generated by
//! `#[derive(Aggregate)]`) and routes stored bytes back to the right variant
//! by event kind.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::event::EventKind;

/// Serialization strategy for event payloads and snapshots.
pub trait Codec {
    type Error: std::error::Error + Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns a codec error if the value cannot be encoded.
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize;

    /// # Errors
    ///
    /// Returns a codec error if the bytes do not decode to `T`.
    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize,
    {
        serde_json::to_vec(value)
    }

    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(data)
    }
}

/// Error returned when decoding a stored event fails.
#[derive(Debug, Error)]
pub enum EventDecodeError<CodecError> {
    /// The event kind was not recognized by this event enum.
    #[error("unknown event kind `{kind}`, expected one of {expected:?}")]
    UnknownKind {
        kind: String,
        expected: &'static [&'static str],
    },
    /// The payload did not decode into the type registered for its kind.
    #[error("failed to decode `{kind}` payload as {type_name}: {source}")]
    Codec {
        kind: String,
        type_name: &'static str,
        #[source]
        source: CodecError,
    },
}

/// The closed set of events an aggregate folds.
///
/// Generated by `#[derive(Aggregate)]`. Hand-written enums implement it with a
/// `match` over their variants.
pub trait EventSet: EventKind + Sized {
    /// Every event kind this set can decode.
    const EVENT_KINDS: &'static [&'static str];

    /// Encode the active variant's payload.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    fn encode<C: Codec>(&self, codec: &C) -> Result<Vec<u8>, C::Error>;

    /// Decode a stored payload of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError::UnknownKind`] for kinds outside
    /// [`Self::EVENT_KINDS`], or [`EventDecodeError::Codec`] if the payload
    /// does not decode.
    fn decode<C: Codec>(
        kind: &str,
        data: &[u8],
        codec: &C,
    ) -> Result<Self, EventDecodeError<C::Error>>;
}

/// Decode one variant's payload, tagging failures with the kind and Rust
/// type. Used by generated [`EventSet::decode`] implementations.
///
/// # Errors
///
/// Returns [`EventDecodeError::Codec`] if the payload does not decode.
pub fn decode_variant<T, C>(
    kind: &str,
    data: &[u8],
    codec: &C,
) -> Result<T, EventDecodeError<C::Error>>
where
    T: DeserializeOwned,
    C: Codec,
{
    codec.deserialize(data).map_err(|source| EventDecodeError::Codec {
        kind: kind.to_string(),
        type_name: std::any::type_name::<T>(),
        source,
    })
}
