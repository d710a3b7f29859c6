//! Snapshots bound the replay cost of long-lived aggregates.
//!
//! - [`should_take_snapshot`] - whether a flush crosses a snapshot boundary
//! - [`Snapshot`] - aggregate state captured at a version
//! - [`SnapshotStore`] - snapshot persistence with its own acceptance policy
//! - [`NoSnapshots`] - the repository default; stores nothing
//! - [`inmemory`] - reference store with a configurable [`SnapshotPolicy`]
//!
//! [`SnapshotPolicy`]: inmemory::SnapshotPolicy

use std::{convert::Infallible, marker::PhantomData};

use serde::{Serialize, de::DeserializeOwned};

pub mod inmemory;

/// Whether committing `pending` events on top of `current_version` passes a
/// positive multiple of `interval`.
///
/// Equivalent to advancing the version once per pending event and checking
/// each intermediate value, so a boundary landing mid-flush is not missed.
/// Several boundaries in one flush still call for a single snapshot. An
/// `interval` of zero never snapshots, and neither does an empty flush.
///
/// ```
/// use chronicle_core::snapshot::should_take_snapshot;
///
/// assert!(should_take_snapshot(3, 2, 5));
/// assert!(!should_take_snapshot(3, 1, 5));
/// ```
#[must_use]
pub const fn should_take_snapshot(current_version: u64, pending: u64, interval: u64) -> bool {
    if interval == 0 || pending == 0 {
        return false;
    }
    let last = current_version.saturating_add(pending);
    last / interval > current_version / interval
}

/// Aggregate state captured after the event at `version` was applied.
///
/// Loading replays only the events after `version`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot<Data> {
    pub version: u64,
    pub data: Data,
}

/// Snapshot persistence with built-in policy.
///
/// Implementations decide both how and when to store snapshots. After every
/// successful save the repository calls
/// [`offer_snapshot`](SnapshotStore::offer_snapshot) with the version the
/// flush started from and the number of events it committed.
pub trait SnapshotStore<Id: Sync>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the most recent snapshot for an aggregate.
    ///
    /// Returns `Ok(None)` if no snapshot exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails or the stored data
    /// does not decode to `T`.
    fn load<'a, T>(
        &'a self,
        kind: &'a str,
        id: &'a Id,
    ) -> impl std::future::Future<Output = Result<Option<Snapshot<T>>, Self::Error>> + Send + 'a
    where
        T: DeserializeOwned + Send + 'a;

    /// Decide whether to persist a snapshot, creating it only if accepted.
    ///
    /// `create_snapshot` is not called when the offer is declined, so
    /// declined offers cost no serialization.
    ///
    /// # Errors
    ///
    /// Returns [`OfferSnapshotError::Create`] if `create_snapshot` fails and
    /// [`OfferSnapshotError::Snapshot`] if persistence fails.
    fn offer_snapshot<'a, CE, T, Create>(
        &'a self,
        kind: &'a str,
        id: &'a Id,
        committed_from: u64,
        event_count: u64,
        create_snapshot: Create,
    ) -> impl std::future::Future<Output = Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>>
    + Send
    + 'a
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize + Send + 'a,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send + 'a;
}

/// Result of offering a snapshot to a store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SnapshotOffer {
    Declined,
    Stored,
}

/// Error returned by [`SnapshotStore::offer_snapshot`].
#[derive(Debug, thiserror::Error)]
pub enum OfferSnapshotError<SnapshotError, CreateError>
where
    SnapshotError: std::error::Error + 'static,
    CreateError: std::error::Error + 'static,
{
    #[error("failed to create snapshot: {0}")]
    Create(#[source] CreateError),
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] SnapshotError),
}

/// Snapshot store that never has a snapshot and declines every offer.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSnapshots<Id>(PhantomData<fn() -> Id>);

impl<Id> NoSnapshots<Id> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<Id> SnapshotStore<Id> for NoSnapshots<Id>
where
    Id: Send + Sync,
{
    type Error = Infallible;

    fn load<'a, T>(
        &'a self,
        _kind: &'a str,
        _id: &'a Id,
    ) -> impl std::future::Future<Output = Result<Option<Snapshot<T>>, Self::Error>> + Send + 'a
    where
        T: DeserializeOwned + Send + 'a,
    {
        std::future::ready(Ok(None))
    }

    fn offer_snapshot<'a, CE, T, Create>(
        &'a self,
        _kind: &'a str,
        _id: &'a Id,
        _committed_from: u64,
        _event_count: u64,
        _create_snapshot: Create,
    ) -> impl std::future::Future<Output = Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>>
    + Send
    + 'a
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize + Send + 'a,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send + 'a,
    {
        std::future::ready(Ok(SnapshotOffer::Declined))
    }
}
