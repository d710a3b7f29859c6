//! In-memory snapshot store.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};

use super::{OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore, should_take_snapshot};

/// When a snapshot store accepts an offer.
///
/// - [`SnapshotPolicy::Always`]: after every save that committed events
/// - [`SnapshotPolicy::Interval`]: whenever a save crosses a multiple of the
///   interval, see [`should_take_snapshot`]
/// - [`SnapshotPolicy::Never`]: load-only, for snapshots maintained elsewhere
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotPolicy {
    Always,
    Interval(u64),
    Never,
}

impl SnapshotPolicy {
    /// Whether a save that committed `event_count` events on top of
    /// `committed_from` should produce a snapshot.
    #[must_use]
    pub const fn should_snapshot(&self, committed_from: u64, event_count: u64) -> bool {
        match self {
            Self::Always => event_count > 0,
            Self::Interval(interval) => should_take_snapshot(committed_from, event_count, *interval),
            Self::Never => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to serialize snapshot of `{kind}`: {source}")]
    Serialization {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to deserialize snapshot of `{kind}` as {type_name}: {source}")]
    Deserialization {
        kind: String,
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

type SnapshotMap<Id> = HashMap<SnapshotKey<Id>, Snapshot<serde_json::Value>>;

/// In-memory snapshot store with a configurable [`SnapshotPolicy`].
///
/// Reference implementation for tests and development. A stored snapshot is
/// never replaced by one at the same or an older version.
///
/// ```ignore
/// let repo = Repository::new(store::inmemory::Store::new())
///     .with_snapshots(snapshot::inmemory::Store::every(100));
/// ```
#[derive(Clone, Debug)]
pub struct Store<Id> {
    snapshots: Arc<RwLock<SnapshotMap<Id>>>,
    policy: SnapshotPolicy,
}

impl<Id> Store<Id> {
    #[must_use]
    pub fn with_policy(policy: SnapshotPolicy) -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    #[must_use]
    pub fn always() -> Self {
        Self::with_policy(SnapshotPolicy::Always)
    }

    /// Snapshot whenever the version crosses a multiple of `interval`.
    #[must_use]
    pub fn every(interval: u64) -> Self {
        Self::with_policy(SnapshotPolicy::Interval(interval))
    }

    #[must_use]
    pub fn never() -> Self {
        Self::with_policy(SnapshotPolicy::Never)
    }

    pub const fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Id: Clone + Eq + Hash> Store<Id> {
    /// Version of the stored snapshot, if any.
    pub fn version_of(&self, kind: &str, id: &Id) -> Option<u64> {
        let key = SnapshotKey::new(kind, id.clone());
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .get(&key)
            .map(|snapshot| snapshot.version)
    }

    /// Overwrite the stored snapshot with raw JSON, bypassing the policy and
    /// the version check.
    pub fn put_raw(&self, kind: &str, id: &Id, version: u64, data: serde_json::Value) {
        let key = SnapshotKey::new(kind, id.clone());
        self.snapshots
            .write()
            .expect("snapshot store lock poisoned")
            .insert(key, Snapshot { version, data });
    }
}

impl<Id> Default for Store<Id> {
    fn default() -> Self {
        Self::always()
    }
}

impl<Id> SnapshotStore<Id> for Store<Id>
where
    Id: Clone + Eq + Hash + Send + Sync,
{
    type Error = Error;

    #[tracing::instrument(skip(self, id))]
    async fn load<'a, T>(&'a self, kind: &'a str, id: &'a Id) -> Result<Option<Snapshot<T>>, Self::Error>
    where
        T: DeserializeOwned + Send + 'a,
    {
        let key = SnapshotKey::new(kind, id.clone());
        let stored = {
            let snapshots = self.snapshots.read().expect("snapshot store lock poisoned");
            snapshots.get(&key).cloned()
        };
        let snapshot = match stored {
            Some(snapshot) => {
                let data = serde_json::from_value(snapshot.data).map_err(|source| {
                    Error::Deserialization {
                        kind: kind.to_string(),
                        type_name: std::any::type_name::<T>(),
                        source,
                    }
                })?;
                Some(Snapshot {
                    version: snapshot.version,
                    data,
                })
            }
            None => None,
        };
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    #[tracing::instrument(skip(self, id, create_snapshot))]
    async fn offer_snapshot<'a, CE, T, Create>(
        &'a self,
        kind: &'a str,
        id: &'a Id,
        committed_from: u64,
        event_count: u64,
        create_snapshot: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize + Send + 'a,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send + 'a,
    {
        if !self.policy.should_snapshot(committed_from, event_count) {
            tracing::trace!(policy = ?self.policy, "snapshot offer declined by policy");
            return Ok(SnapshotOffer::Declined);
        }

        let snapshot = create_snapshot().map_err(OfferSnapshotError::Create)?;
        let data = serde_json::to_value(&snapshot.data).map_err(|source| {
            OfferSnapshotError::Snapshot(Error::Serialization {
                kind: kind.to_string(),
                source,
            })
        })?;
        let key = SnapshotKey::new(kind, id.clone());
        let stored = Snapshot {
            version: snapshot.version,
            data,
        };

        let offer = {
            let mut snapshots = self
                .snapshots
                .write()
                .expect("snapshot store lock poisoned");
            match snapshots.get(&key) {
                Some(existing) if existing.version >= stored.version => SnapshotOffer::Declined,
                _ => {
                    snapshots.insert(key, stored);
                    SnapshotOffer::Stored
                }
            }
        };

        tracing::debug!(committed_from, event_count, ?offer, "snapshot offer evaluated");
        Ok(offer)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct SnapshotKey<Id> {
    kind: String,
    id: Id,
}

impl<Id> SnapshotKey<Id> {
    fn new(kind: &str, id: Id) -> Self {
        Self {
            kind: kind.to_string(),
            id,
        }
    }
}
