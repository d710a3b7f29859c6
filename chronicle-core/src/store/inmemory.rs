//! In-memory aggregate store for tests and examples.
//!
//! ```
//! use chronicle_core::store::inmemory;
//!
//! let store: inmemory::Store<String> = inmemory::Store::new();
//! ```

use std::{
    collections::{HashMap, hash_map::Entry},
    future::Future,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    codec::{Codec, JsonCodec},
    concurrency::ConcurrencyConflict,
    id::Identifier,
    store::{
        AggregateRecord, AggregateStore, ArchiveError, Encoding, EventFilter, Lookup,
        PersistableEvent, SaveError, SaveResult, StoredEvent, StreamKey,
    },
};

/// Thread-safe in-memory store.
///
/// Every operation completes inside one critical section, so a save is
/// all-or-nothing and a dropped future never leaves a partial write.
/// Archived aggregates are kept as an encoded blob in place of their live
/// stream.
#[derive(Clone)]
pub struct Store<Id, C = JsonCodec> {
    inner: Arc<RwLock<Inner<Id>>>,
    codec: C,
}

struct Inner<Id> {
    aggregates: HashMap<StreamKey<Id>, Slot<Id>>,
}

enum Slot<Id> {
    Live(Stream<Id>),
    Archived(Archive),
}

struct Stream<Id> {
    record: AggregateRecord<Id>,
    events: Vec<StoredEvent<Id>>,
}

struct Archive {
    encoding: Encoding,
    bytes: Vec<u8>,
}

#[derive(Serialize)]
struct ArchiveRef<'s, Id> {
    record: &'s AggregateRecord<Id>,
    events: &'s [StoredEvent<Id>],
}

#[derive(Deserialize)]
struct ArchivedStream<Id> {
    record: AggregateRecord<Id>,
    events: Vec<StoredEvent<Id>>,
}

impl<Id> Store<Id> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_codec(JsonCodec)
    }
}

impl<Id, C> Store<Id, C> {
    #[must_use]
    pub fn with_codec(codec: C) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                aggregates: HashMap::new(),
            })),
            codec,
        }
    }
}

impl<Id: Identifier, C> Store<Id, C> {
    /// Encoding of the archived blob, `None` unless the aggregate is boxed.
    pub fn archive_encoding(&self, aggregate_kind: &str, aggregate_id: &Id) -> Option<Encoding> {
        let key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let inner = self.inner.read().expect("in-memory store lock poisoned");
        match inner.aggregates.get(&key) {
            Some(Slot::Archived(archive)) => Some(archive.encoding),
            Some(Slot::Live(_)) | None => None,
        }
    }
}

impl<Id> Default for Store<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id, C> std::fmt::Debug for Store<Id, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let aggregates = self
            .inner
            .read()
            .expect("in-memory store lock poisoned")
            .aggregates
            .len();
        f.debug_struct("Store")
            .field("aggregates", &aggregates)
            .finish_non_exhaustive()
    }
}

/// Error type for the in-memory store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to encode archive of `{aggregate_kind}` as {encoding}: {source}")]
    ArchiveEncode {
        aggregate_kind: String,
        encoding: Encoding,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode archive of `{aggregate_kind}` as {type_name}: {source}")]
    ArchiveDecode {
        aggregate_kind: String,
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl<Id, C> Store<Id, C>
where
    Id: Identifier + Serialize + DeserializeOwned,
{
    fn save_now(
        &self,
        aggregate_kind: &str,
        record: AggregateRecord<Id>,
        expected_version: u64,
        events: Vec<PersistableEvent>,
    ) -> Result<SaveResult, SaveError<Error>> {
        for (expected, event) in (expected_version + 1..).zip(&events) {
            if event.version != expected {
                return Err(SaveError::NonContiguous {
                    expected,
                    found: event.version,
                });
            }
        }
        let new_version = expected_version + events.len() as u64;
        if record.version != new_version {
            return Err(SaveError::NonContiguous {
                expected: new_version,
                found: record.version,
            });
        }

        let stored: Vec<StoredEvent<Id>> = events
            .into_iter()
            .map(|event| StoredEvent {
                aggregate_kind: aggregate_kind.to_string(),
                aggregate_id: record.aggregate_id.clone(),
                event_id: event.event_id,
                kind: event.kind,
                version: event.version,
                data: event.data,
                created_at: event.created_at,
                originator: event.originator,
            })
            .collect();
        let event_count = stored.len();

        let key = StreamKey::new(aggregate_kind, record.aggregate_id.clone());
        let mut inner = self.inner.write().expect("in-memory store lock poisoned");
        match inner.aggregates.entry(key) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                Slot::Archived(_) => return Err(SaveError::Archived),
                Slot::Live(stream) => {
                    if stream.record.version != expected_version {
                        tracing::debug!(
                            expected_version,
                            actual_version = stream.record.version,
                            "save rejected: version conflict"
                        );
                        return Err(ConcurrencyConflict {
                            expected: expected_version,
                            actual: stream.record.version,
                        }
                        .into());
                    }
                    stream.events.extend(stored);
                    stream.record = record;
                }
            },
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(ConcurrencyConflict {
                        expected: expected_version,
                        actual: 0,
                    }
                    .into());
                }
                // An aggregate with no events has nothing to persist yet.
                if event_count > 0 {
                    vacant.insert(Slot::Live(Stream {
                        record,
                        events: stored,
                    }));
                }
            }
        }
        drop(inner);

        tracing::debug!(event_count, version = new_version, "aggregate saved");
        Ok(SaveResult {
            version: new_version,
        })
    }

    fn box_now(
        &self,
        aggregate_kind: &str,
        aggregate_id: &Id,
        encoding: Encoding,
    ) -> Result<(), ArchiveError<Error>> {
        let key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let mut inner = self.inner.write().expect("in-memory store lock poisoned");
        let Some(slot) = inner.aggregates.get_mut(&key) else {
            return Err(ArchiveError::NotFound);
        };
        let bytes = match slot {
            Slot::Archived(_) => return Err(ArchiveError::AlreadyArchived),
            Slot::Live(stream) => {
                let archive = ArchiveRef {
                    record: &stream.record,
                    events: &stream.events,
                };
                let encoded = match encoding {
                    Encoding::Json => serde_json::to_vec(&archive),
                    Encoding::PrettyJson => serde_json::to_vec_pretty(&archive),
                };
                encoded.map_err(|source| {
                    ArchiveError::Store(Error::ArchiveEncode {
                        aggregate_kind: aggregate_kind.to_string(),
                        encoding,
                        source,
                    })
                })?
            }
        };
        let archived_bytes = bytes.len();
        *slot = Slot::Archived(Archive { encoding, bytes });
        drop(inner);

        tracing::debug!(%encoding, archived_bytes, "aggregate boxed");
        Ok(())
    }

    fn unbox_now(
        &self,
        aggregate_kind: &str,
        aggregate_id: &Id,
        encoding: Encoding,
    ) -> Result<AggregateRecord<Id>, ArchiveError<Error>> {
        let key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let mut inner = self.inner.write().expect("in-memory store lock poisoned");
        let Some(slot) = inner.aggregates.get_mut(&key) else {
            return Err(ArchiveError::NotFound);
        };
        let restored: ArchivedStream<Id> = match slot {
            Slot::Live(_) => return Err(ArchiveError::NotArchived),
            Slot::Archived(archive) => {
                if archive.encoding != encoding {
                    return Err(ArchiveError::EncodingMismatch {
                        stored: archive.encoding,
                        requested: encoding,
                    });
                }
                serde_json::from_slice(&archive.bytes).map_err(|source| {
                    ArchiveError::Store(Error::ArchiveDecode {
                        aggregate_kind: aggregate_kind.to_string(),
                        type_name: std::any::type_name::<ArchivedStream<Id>>(),
                        source,
                    })
                })?
            }
        };
        let record = restored.record.clone();
        *slot = Slot::Live(Stream {
            record: restored.record,
            events: restored.events,
        });
        drop(inner);

        tracing::debug!(version = record.version, "aggregate unboxed");
        Ok(record)
    }
}

impl<Id, C> AggregateStore for Store<Id, C>
where
    Id: Identifier + Serialize + DeserializeOwned,
    C: Codec + Clone + Send + Sync + 'static,
{
    type Codec = C;
    type Error = Error;
    type Id = Id;

    fn codec(&self) -> &Self::Codec {
        &self.codec
    }

    #[tracing::instrument(skip(self, aggregate_id))]
    fn exists<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        let key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let exists = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            matches!(inner.aggregates.get(&key), Some(Slot::Live(_)))
        };
        std::future::ready(Ok(exists))
    }

    #[tracing::instrument(skip(self, aggregate_id))]
    fn exists_at<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        version: u64,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a {
        let key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let exists = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            match inner.aggregates.get(&key) {
                Some(Slot::Live(stream)) => version >= 1 && version <= stream.record.version,
                Some(Slot::Archived(_)) | None => false,
            }
        };
        std::future::ready(Ok(exists))
    }

    #[tracing::instrument(skip(self, aggregate_id))]
    fn get<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
    ) -> impl Future<Output = Result<Lookup<Self::Id>, Self::Error>> + Send + 'a {
        let key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let lookup = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            match inner.aggregates.get(&key) {
                Some(Slot::Live(stream)) => Lookup::Found(stream.record.clone()),
                Some(Slot::Archived(_)) => Lookup::Archived,
                None => Lookup::NotFound,
            }
        };
        tracing::trace!(found = lookup.is_found(), "aggregate lookup");
        std::future::ready(Ok(lookup))
    }

    #[tracing::instrument(skip(self, aggregate_id))]
    fn load_events<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        filter: EventFilter,
    ) -> impl Future<Output = Result<Vec<StoredEvent<Self::Id>>, Self::Error>> + Send + 'a {
        let key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let events: Vec<StoredEvent<Id>> = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            match inner.aggregates.get(&key) {
                Some(Slot::Live(stream)) => stream
                    .events
                    .iter()
                    .filter(|event| filter.matches(event.version))
                    .cloned()
                    .collect(),
                Some(Slot::Archived(_)) | None => Vec::new(),
            }
        };
        tracing::trace!(event_count = events.len(), "events loaded");
        std::future::ready(Ok(events))
    }

    #[tracing::instrument(
        skip(self, record, events),
        fields(event_count = events.len(), new_version = record.version)
    )]
    fn save<'a>(
        &'a self,
        aggregate_kind: &'a str,
        record: AggregateRecord<Self::Id>,
        expected_version: u64,
        events: Vec<PersistableEvent>,
    ) -> impl Future<Output = Result<SaveResult, SaveError<Self::Error>>> + Send + 'a {
        std::future::ready(self.save_now(aggregate_kind, record, expected_version, events))
    }

    #[tracing::instrument(skip(self, aggregate_id))]
    fn box_aggregate<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        encoding: Encoding,
    ) -> impl Future<Output = Result<(), ArchiveError<Self::Error>>> + Send + 'a {
        std::future::ready(self.box_now(aggregate_kind, aggregate_id, encoding))
    }

    #[tracing::instrument(skip(self, aggregate_id))]
    fn unbox_aggregate<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        encoding: Encoding,
    ) -> impl Future<Output = Result<AggregateRecord<Self::Id>, ArchiveError<Self::Error>>> + Send + 'a
    {
        std::future::ready(self.unbox_now(aggregate_kind, aggregate_id, encoding))
    }

    #[tracing::instrument(skip(self))]
    fn expired<'a>(
        &'a self,
        aggregate_kind: &'a str,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Self::Id>, Self::Error>> + Send + 'a {
        let mut expired: Vec<(DateTime<Utc>, Id)> = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .aggregates
                .iter()
                .filter(|(key, _)| key.aggregate_kind() == aggregate_kind)
                .filter_map(|(_, slot)| match slot {
                    Slot::Live(stream) if stream.record.deleted => stream
                        .record
                        .deleted_at
                        .filter(|deleted_at| *deleted_at <= cutoff)
                        .map(|deleted_at| (deleted_at, stream.record.aggregate_id.clone())),
                    Slot::Live(_) | Slot::Archived(_) => None,
                })
                .collect()
        };
        expired.sort_by_key(|(deleted_at, _)| *deleted_at);
        tracing::trace!(expired = expired.len(), "expired aggregates enumerated");
        std::future::ready(Ok(expired.into_iter().map(|(_, id)| id).collect()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    use super::*;
    use crate::event::Originator;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn event(version: u64) -> PersistableEvent {
        PersistableEvent {
            event_id: Uuid::now_v7(),
            kind: "value-added".to_string(),
            version,
            data: br#"{"amount":1}"#.to_vec(),
            created_at: at(0),
            originator: Originator::default(),
        }
    }

    fn record(id: &str, version: u64) -> AggregateRecord<String> {
        AggregateRecord {
            aggregate_id: id.to_string(),
            version,
            tenant_id: None,
            deleted: false,
            deleted_at: None,
        }
    }

    async fn seed(store: &Store<String>, id: &str, count: u64) {
        let events = (1..=count).map(event).collect();
        store
            .save("counter", record(id, count), 0, events)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn save_new_aggregate_persists_record_and_events() {
        let store = Store::<String>::new();
        let result = store
            .save("counter", record("c1", 2), 0, vec![event(1), event(2)])
            .await
            .unwrap();
        assert_eq!(result.version, 2);

        let Lookup::Found(stored) = store.get("counter", &"c1".to_string()).await.unwrap() else {
            panic!("expected record");
        };
        assert_eq!(stored, record("c1", 2));

        let events = store
            .load_events("counter", &"c1".to_string(), EventFilter::all())
            .await
            .unwrap();
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(events[0].aggregate_kind, "counter");
        assert_eq!(events[0].aggregate_id, "c1");
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts_and_writes_nothing() {
        let store = Store::<String>::new();
        seed(&store, "c1", 3).await;

        let err = store
            .save("counter", record("c1", 3), 2, vec![event(3)])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SaveError::Conflict(ConcurrencyConflict {
                expected: 2,
                actual: 3
            })
        ));
        let events = store
            .load_events("counter", &"c1".to_string(), EventFilter::all())
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            store.get("counter", &"c1".to_string()).await.unwrap(),
            Lookup::Found(record("c1", 3))
        );
    }

    #[tokio::test]
    async fn expecting_new_aggregate_conflicts_with_existing_one() {
        let store = Store::<String>::new();
        seed(&store, "c1", 1).await;

        let err = store
            .save("counter", record("c1", 1), 0, vec![event(1)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected new aggregate"));
    }

    #[tokio::test]
    async fn expecting_existing_version_of_missing_aggregate_conflicts() {
        let store = Store::<String>::new();
        let err = store
            .save("counter", record("c1", 5), 4, vec![event(5)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SaveError::Conflict(ConcurrencyConflict {
                expected: 4,
                actual: 0
            })
        ));
        assert!(!store.exists("counter", &"c1".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn non_contiguous_batch_is_rejected() {
        let store = Store::<String>::new();
        let err = store
            .save("counter", record("c1", 2), 0, vec![event(1), event(3)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SaveError::NonContiguous {
                expected: 2,
                found: 3
            }
        ));

        let err = store
            .save("counter", record("c1", 7), 0, vec![event(1)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SaveError::NonContiguous {
                expected: 1,
                found: 7
            }
        ));
        assert_eq!(
            store.get("counter", &"c1".to_string()).await.unwrap(),
            Lookup::NotFound
        );
    }

    #[tokio::test]
    async fn empty_batch_updates_record_only() {
        let store = Store::<String>::new();
        seed(&store, "c1", 2).await;

        let mut deleted = record("c1", 2);
        deleted.deleted = true;
        deleted.deleted_at = Some(at(5));
        store
            .save("counter", deleted.clone(), 2, Vec::new())
            .await
            .unwrap();

        assert_eq!(
            store.get("counter", &"c1".to_string()).await.unwrap(),
            Lookup::Found(deleted)
        );
    }

    #[tokio::test]
    async fn empty_batch_for_unknown_aggregate_creates_nothing() {
        let store = Store::<String>::new();
        store
            .save("counter", record("c1", 0), 0, Vec::new())
            .await
            .unwrap();

        assert!(!store.exists("counter", &"c1".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn exists_and_exists_at_follow_committed_versions() {
        let store = Store::<String>::new();
        let id = "c1".to_string();
        assert!(!store.exists("counter", &id).await.unwrap());

        seed(&store, "c1", 2).await;
        assert!(store.exists("counter", &id).await.unwrap());
        assert!(!store.exists("other-kind", &id).await.unwrap());
        assert!(!store.exists_at("counter", &id, 0).await.unwrap());
        assert!(store.exists_at("counter", &id, 1).await.unwrap());
        assert!(store.exists_at("counter", &id, 2).await.unwrap());
        assert!(!store.exists_at("counter", &id, 3).await.unwrap());
    }

    #[tokio::test]
    async fn load_events_applies_version_window() {
        let store = Store::<String>::new();
        seed(&store, "c1", 5).await;

        let events = store
            .load_events(
                "counter",
                &"c1".to_string(),
                EventFilter::all().after(1).up_to(3),
            )
            .await
            .unwrap();
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![2, 3]);
    }

    #[tokio::test]
    async fn box_and_unbox_round_trip_history() {
        let store = Store::<String>::new();
        let id = "c1".to_string();
        seed(&store, "c1", 3).await;
        let before = store
            .load_events("counter", &id, EventFilter::all())
            .await
            .unwrap();

        store
            .box_aggregate("counter", &id, Encoding::PrettyJson)
            .await
            .unwrap();
        assert_eq!(store.get("counter", &id).await.unwrap(), Lookup::Archived);
        assert!(!store.exists("counter", &id).await.unwrap());
        assert!(store
            .load_events("counter", &id, EventFilter::all())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.archive_encoding("counter", &id),
            Some(Encoding::PrettyJson)
        );

        let restored = store
            .unbox_aggregate("counter", &id, Encoding::PrettyJson)
            .await
            .unwrap();
        assert_eq!(restored, record("c1", 3));
        let after = store
            .load_events("counter", &id, EventFilter::all())
            .await
            .unwrap();
        assert_eq!(after, before);
        assert_eq!(store.archive_encoding("counter", &id), None);
    }

    #[tokio::test]
    async fn archive_state_errors_are_distinct() {
        let store = Store::<String>::new();
        let id = "c1".to_string();

        assert!(matches!(
            store.box_aggregate("counter", &id, Encoding::Json).await,
            Err(ArchiveError::NotFound)
        ));

        seed(&store, "c1", 1).await;
        assert!(matches!(
            store.unbox_aggregate("counter", &id, Encoding::Json).await,
            Err(ArchiveError::NotArchived)
        ));

        store
            .box_aggregate("counter", &id, Encoding::Json)
            .await
            .unwrap();
        assert!(matches!(
            store.box_aggregate("counter", &id, Encoding::Json).await,
            Err(ArchiveError::AlreadyArchived)
        ));
        assert!(matches!(
            store
                .unbox_aggregate("counter", &id, Encoding::PrettyJson)
                .await,
            Err(ArchiveError::EncodingMismatch {
                stored: Encoding::Json,
                requested: Encoding::PrettyJson
            })
        ));
        assert!(matches!(
            store
                .save("counter", record("c1", 2), 1, vec![event(2)])
                .await,
            Err(SaveError::Archived)
        ));
    }

    #[tokio::test]
    async fn expired_lists_deleted_aggregates_up_to_cutoff() {
        let store = Store::<String>::new();
        for (id, deleted_at) in [("old", Some(at(1))), ("recent", Some(at(9))), ("live", None)] {
            let mut rec = record(id, 1);
            rec.deleted = deleted_at.is_some();
            rec.deleted_at = deleted_at;
            store
                .save("counter", rec, 0, vec![event(1)])
                .await
                .unwrap();
        }

        let expired = store.expired("counter", at(5)).await.unwrap();
        assert_eq!(expired, vec!["old".to_string()]);

        let expired = store
            .expired("counter", at(9) + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(expired, vec!["old".to_string(), "recent".to_string()]);

        store
            .box_aggregate("counter", &"old".to_string(), Encoding::Json)
            .await
            .unwrap();
        let expired = store.expired("counter", at(23)).await.unwrap();
        assert_eq!(expired, vec!["recent".to_string()]);
        assert!(store.expired("ledger", at(23)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_saves_from_same_version_have_one_winner() {
        let store = Store::<String>::new();
        seed(&store, "c1", 1).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .save("counter", record("c1", 2), 1, vec![event(2)])
                    .await
                    .is_ok()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let events = store
            .load_events("counter", &"c1".to_string(), EventFilter::all())
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }
}
