//! Persistence boundary.
//!
//! This module describes the storage contract ([`AggregateStore`]), the
//! backend-agnostic persisted shapes ([`AggregateRecord`],
//! [`PersistableEvent`], [`StoredEvent`]) and a reference in-memory
//! implementation. Every method that touches storage returns a future; these
//! are the only suspension points of the crate.
use std::{fmt, future::Future};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{codec::Codec, concurrency::ConcurrencyConflict, event::Originator, id::Identifier};

pub mod inmemory;

/// Aggregate row: identity, committed version, tenant and deletion flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord<Id> {
    pub aggregate_id: Id,
    pub version: u64,
    pub tenant_id: Option<String>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Encoded event ready to be written, with its final version.
///
/// This is the boundary between the repository and a store: the repository
/// flushes and encodes, the store persists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistableEvent {
    pub event_id: Uuid,
    pub kind: String,
    pub version: u64,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub originator: Originator,
}

/// Event read back from a store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent<Id> {
    pub aggregate_kind: String,
    pub aggregate_id: Id,
    pub event_id: Uuid,
    pub kind: String,
    pub version: u64,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub originator: Originator,
}

/// Outcome of looking an aggregate up.
///
/// A soft-deleted aggregate is `Found` with `deleted` set; only an archived
/// one is hidden.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup<Id> {
    NotFound,
    Archived,
    Found(AggregateRecord<Id>),
}

impl<Id> Lookup<Id> {
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn into_record(self) -> Option<AggregateRecord<Id>> {
        match self {
            Self::Found(record) => Some(record),
            Self::NotFound | Self::Archived => None,
        }
    }
}

/// Version window for loading one aggregate's events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Only events with a version strictly greater than this.
    pub after_version: Option<u64>,
    /// Only events with a version less than or equal to this.
    pub up_to_version: Option<u64>,
}

impl EventFilter {
    /// The whole history.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            after_version: None,
            up_to_version: None,
        }
    }

    /// Skip events already covered by a snapshot at `version`.
    #[must_use]
    pub const fn after(mut self, version: u64) -> Self {
        self.after_version = Some(version);
        self
    }

    /// Stop at `version`, for historical loads.
    #[must_use]
    pub const fn up_to(mut self, version: u64) -> Self {
        self.up_to_version = Some(version);
        self
    }

    pub fn matches(&self, version: u64) -> bool {
        self.after_version.is_none_or(|after| version > after)
            && self.up_to_version.is_none_or(|up_to| version <= up_to)
    }
}

/// Cold-storage encoding for archived aggregates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    Json,
    PrettyJson,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::PrettyJson => "pretty-json",
        })
    }
}

/// Error from [`AggregateStore::save`]. Nothing is written when it is
/// returned.
#[derive(Debug, Error)]
pub enum SaveError<StoreError>
where
    StoreError: std::error::Error,
{
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    #[error("aggregate is archived; unbox it before saving")]
    Archived,
    #[error("event batch is not contiguous: expected version {expected}, found {found}")]
    NonContiguous { expected: u64, found: u64 },
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError: std::error::Error> SaveError<StoreError> {
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Result of a successful save.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SaveResult {
    /// Stored version after the save.
    pub version: u64,
}

/// Error from boxing or unboxing an aggregate.
#[derive(Debug, Error)]
pub enum ArchiveError<StoreError>
where
    StoreError: std::error::Error,
{
    #[error("aggregate not found")]
    NotFound,
    #[error("aggregate is already archived")]
    AlreadyArchived,
    #[error("aggregate is not archived")]
    NotArchived,
    #[error("archive was written as {stored}, not {requested}")]
    EncodingMismatch {
        stored: Encoding,
        requested: Encoding,
    },
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

/// Storage backend for aggregates and their event streams.
///
/// Streams are keyed by `(aggregate_kind, aggregate_id)`. A backend must make
/// [`save`](AggregateStore::save) atomic across the aggregate record and its
/// new events: either the version check passes and everything is written, or
/// nothing is. A save future dropped before completion must leave prior
/// state untouched.
pub trait AggregateStore: Send + Sync {
    type Id: Identifier;

    type Error: std::error::Error + Send + Sync + 'static;

    /// Serialization codec for event payloads.
    type Codec: Codec + Clone + Send + Sync + 'static;

    fn codec(&self) -> &Self::Codec;

    /// Whether a live (non-archived) record exists. Soft-deleted aggregates
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn exists<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Whether a live aggregate has a committed event at `version`.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn exists_at<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        version: u64,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Fetch the aggregate record.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn get<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
    ) -> impl Future<Output = Result<Lookup<Self::Id>, Self::Error>> + Send + 'a;

    /// Load a live aggregate's events in version order.
    ///
    /// Returns an empty list for unknown or archived aggregates.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when loading fails.
    fn load_events<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        filter: EventFilter,
    ) -> impl Future<Output = Result<Vec<StoredEvent<Self::Id>>, Self::Error>> + Send + 'a;

    /// Atomically write the aggregate record and append `events`.
    ///
    /// `expected_version` is the version the caller loaded; `0` expects a
    /// new aggregate. `events` must carry `expected_version + 1` onwards and
    /// `record.version` must equal the version after the last event. An
    /// empty batch only updates the record (for example its deletion flag).
    ///
    /// # Errors
    ///
    /// Returns [`SaveError::Conflict`] if the stored version differs from
    /// `expected_version`, [`SaveError::Archived`] for archived aggregates,
    /// [`SaveError::NonContiguous`] for a malformed batch, or
    /// [`SaveError::Store`] if persistence fails.
    fn save<'a>(
        &'a self,
        aggregate_kind: &'a str,
        record: AggregateRecord<Self::Id>,
        expected_version: u64,
        events: Vec<PersistableEvent>,
    ) -> impl Future<Output = Result<SaveResult, SaveError<Self::Error>>> + Send + 'a;

    /// Move a live aggregate and its history to cold storage.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotFound`], [`ArchiveError::AlreadyArchived`]
    /// or a store error.
    fn box_aggregate<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        encoding: Encoding,
    ) -> impl Future<Output = Result<(), ArchiveError<Self::Error>>> + Send + 'a;

    /// Restore an archived aggregate and its history. Returns the restored
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NotArchived`],
    /// [`ArchiveError::EncodingMismatch`] or a store error.
    fn unbox_aggregate<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        encoding: Encoding,
    ) -> impl Future<Output = Result<AggregateRecord<Self::Id>, ArchiveError<Self::Error>>> + Send + 'a;

    /// Live aggregates soft-deleted at or before `cutoff`, the candidates for
    /// archiving.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn expired<'a>(
        &'a self,
        aggregate_kind: &'a str,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Self::Id>, Self::Error>> + Send + 'a;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey<Id> {
    aggregate_kind: String,
    aggregate_id: Id,
}

impl<Id> StreamKey<Id> {
    pub(crate) fn new(aggregate_kind: impl Into<String>, aggregate_id: Id) -> Self {
        Self {
            aggregate_kind: aggregate_kind.into(),
            aggregate_id,
        }
    }

    pub(crate) fn aggregate_kind(&self) -> &str {
        &self.aggregate_kind
    }
}
