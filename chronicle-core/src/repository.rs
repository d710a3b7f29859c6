//! Aggregate lifecycle over a store.
//!
//! `Repository` loads aggregates (factory shell plus replay), saves them with
//! optimistic concurrency, and moves them to and from cold storage.
//!
//! Snapshot support is opt-in via `Repository<_, Snapshots<_>>`. This keeps
//! the default repository lightweight: no snapshot load or serialize work and
//! no serde bounds on aggregate state unless snapshots are enabled.
//!
//! Nothing here retries. A [`SaveError::Conflict`] means the caller reloads
//! and runs its behavior again.

use std::{convert::Infallible, fmt, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, AggregateRoot, ConstructionError, EventOf, FlushError, ReplayError},
    clock::{self, Clock},
    codec::{Codec, EventDecodeError, EventSet},
    concurrency::ConcurrencyConflict,
    event::{Envelope, EnvelopeParts},
    factory::{AggregateFactory, ShellArgs},
    snapshot::{NoSnapshots, OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore},
    store::{
        self, AggregateRecord, AggregateStore, ArchiveError, Encoding, EventFilter, Lookup,
        PersistableEvent, StoredEvent,
    },
};

type CodecErrorOf<S> = <<S as AggregateStore>::Codec as Codec>::Error;

/// Error loading an aggregate or its history.
#[derive(Debug, Error)]
pub enum LoadError<Id, StoreError, CodecError>
where
    Id: fmt::Debug + fmt::Display + 'static,
    StoreError: std::error::Error + 'static,
    CodecError: std::error::Error + 'static,
{
    #[error("aggregate `{kind}` {id} not found")]
    NotFound { kind: &'static str, id: Id },
    #[error("aggregate `{kind}` {id} is archived")]
    Archived { kind: &'static str, id: Id },
    #[error("aggregate `{kind}` {id} has no version {requested}; current version is {current}")]
    VersionNotFound {
        kind: &'static str,
        id: Id,
        requested: u64,
        current: u64,
    },
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error("failed to replay history: {0}")]
    Replay(#[source] ReplayError<Id>),
    #[error("failed to decode stored event: {0}")]
    EventDecode(#[source] EventDecodeError<CodecError>),
    #[error("stored history ends at version {found}, expected {recorded}")]
    Inconsistent { recorded: u64, found: u64 },
    #[error("failed to load aggregate: {0}")]
    Store(#[source] StoreError),
}

/// Error saving an aggregate. The aggregate's committed version and buffer
/// are untouched when it is returned.
#[derive(Debug, Error)]
pub enum SaveError<Id, StoreError, CodecError>
where
    Id: fmt::Debug + fmt::Display + 'static,
    StoreError: std::error::Error + 'static,
    CodecError: std::error::Error + 'static,
{
    #[error(transparent)]
    Conflict(ConcurrencyConflict),
    #[error("cannot commit buffered events: {0}")]
    Flush(#[source] FlushError<Id>),
    #[error("failed to encode `{kind}` event: {source}")]
    Codec {
        kind: &'static str,
        #[source]
        source: CodecError,
    },
    #[error("aggregate `{kind}` {id} is archived")]
    Archived { kind: &'static str, id: Id },
    #[error("store rejected event batch: expected version {expected}, found {found}")]
    InvalidBatch { expected: u64, found: u64 },
    #[error("failed to persist events: {0}")]
    Store(#[source] StoreError),
}

pub type LoadErrorOf<S> = LoadError<
    <S as AggregateStore>::Id,
    <S as AggregateStore>::Error,
    CodecErrorOf<S>,
>;

pub type SaveErrorOf<S> = SaveError<
    <S as AggregateStore>::Id,
    <S as AggregateStore>::Error,
    CodecErrorOf<S>,
>;

/// Result type alias for loads.
pub type LoadResult<A, S> = Result<AggregateRoot<A>, LoadErrorOf<S>>;

/// Result type alias for saves: the committed events, versions stamped.
pub type SaveResult<A, S> = Result<Vec<EventOf<A>>, SaveErrorOf<S>>;

/// Snapshot-enabled repository mode wrapper.
#[derive(Debug)]
pub struct Snapshots<SS>(pub SS);

/// Repository.
pub struct Repository<S, M = NoSnapshots<<S as AggregateStore>::Id>>
where
    S: AggregateStore,
{
    store: S,
    snapshots: M,
    factory: AggregateFactory,
}

impl<S> Repository<S>
where
    S: AggregateStore,
{
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            snapshots: NoSnapshots::new(),
            factory: AggregateFactory::new(clock::system()),
        }
    }
}

impl<S, M> Repository<S, M>
where
    S: AggregateStore,
{
    /// Use `clock` for event and soft-delete timestamps of aggregates this
    /// repository creates or loads.
    #[must_use]
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            factory: AggregateFactory::new(clock),
            ..self
        }
    }

    #[must_use]
    pub fn with_snapshots<SS>(self, snapshots: SS) -> Repository<S, Snapshots<SS>>
    where
        SS: SnapshotStore<S::Id>,
    {
        Repository {
            store: self.store,
            snapshots: Snapshots(snapshots),
            factory: self.factory,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub const fn factory(&self) -> &AggregateFactory {
        &self.factory
    }

    /// Start a new aggregate at version 0 with this repository's clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::EmptyId`] for the empty identifier.
    pub fn create<A>(&self, id: S::Id) -> Result<AggregateRoot<A>, ConstructionError>
    where
        A: Aggregate<Id = S::Id>,
    {
        AggregateRoot::new(id, Arc::clone(self.factory.clock()))
    }

    /// Whether a live record exists. Soft-deleted aggregates exist; archived
    /// ones do not.
    ///
    /// # Errors
    ///
    /// Returns the store error if the lookup fails.
    pub fn exists<'a, A>(
        &'a self,
        id: &'a S::Id,
    ) -> impl Future<Output = Result<bool, S::Error>> + Send + 'a
    where
        A: Aggregate<Id = S::Id>,
    {
        self.store.exists(A::KIND, id)
    }

    /// Whether the aggregate has a committed event at `version`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the lookup fails.
    pub fn exists_at<'a, A>(
        &'a self,
        id: &'a S::Id,
        version: u64,
    ) -> impl Future<Output = Result<bool, S::Error>> + Send + 'a
    where
        A: Aggregate<Id = S::Id>,
    {
        self.store.exists_at(A::KIND, id, version)
    }

    /// Decoded history, optionally stopping at `up_to`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::NotFound`] or [`LoadError::Archived`] if there
    /// is no live aggregate, or a decode or store error.
    #[tracing::instrument(skip(self), fields(aggregate_kind = A::KIND))]
    pub async fn events<A>(
        &self,
        id: &S::Id,
        up_to: Option<u64>,
    ) -> Result<Vec<EventOf<A>>, LoadErrorOf<S>>
    where
        A: Aggregate<Id = S::Id>,
    {
        self.record::<A>(id).await?;
        let filter = up_to.map_or(EventFilter::all(), |version| EventFilter::all().up_to(version));
        self.decoded_events::<A>(id, filter).await
    }

    /// Rebuild the aggregate as it was right after the event at `version`.
    ///
    /// Always replays from the start of the stream; snapshots are not used.
    /// The deletion flag is current state, not history, and stays clear.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::VersionNotFound`] if `version` is past the stored
    /// version, plus the errors of [`Repository::events`] and replay errors.
    #[tracing::instrument(skip(self), fields(aggregate_kind = A::KIND))]
    pub async fn load_at<A>(&self, id: &S::Id, version: u64) -> LoadResult<A, S>
    where
        A: Aggregate<Id = S::Id>,
    {
        let record = self.record::<A>(id).await?;
        if version > record.version {
            return Err(LoadError::VersionNotFound {
                kind: A::KIND,
                id: id.clone(),
                requested: version,
                current: record.version,
            });
        }
        let mut root = self.shell::<A>(&record, 0)?;
        let history = self
            .decoded_events::<A>(id, EventFilter::all().up_to(version))
            .await?;
        root.rehydrate(history).map_err(LoadError::Replay)?;
        if root.version() != version {
            return Err(LoadError::Inconsistent {
                recorded: version,
                found: root.version(),
            });
        }
        Ok(root)
    }

    /// Move an aggregate and its history to cold storage.
    ///
    /// # Errors
    ///
    /// See [`AggregateStore::box_aggregate`].
    pub fn box_aggregate<'a, A>(
        &'a self,
        id: &'a S::Id,
        encoding: Encoding,
    ) -> impl Future<Output = Result<(), ArchiveError<S::Error>>> + Send + 'a
    where
        A: Aggregate<Id = S::Id>,
    {
        self.store.box_aggregate(A::KIND, id, encoding)
    }

    /// Restore an archived aggregate. Load it afterwards to get a root.
    ///
    /// # Errors
    ///
    /// See [`AggregateStore::unbox_aggregate`].
    pub fn unbox_aggregate<'a, A>(
        &'a self,
        id: &'a S::Id,
        encoding: Encoding,
    ) -> impl Future<Output = Result<AggregateRecord<S::Id>, ArchiveError<S::Error>>> + Send + 'a
    where
        A: Aggregate<Id = S::Id>,
    {
        self.store.unbox_aggregate(A::KIND, id, encoding)
    }

    /// Aggregates soft-deleted at or before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns the store error if enumeration fails.
    pub fn expired<'a, A>(
        &'a self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<S::Id>, S::Error>> + Send + 'a
    where
        A: Aggregate<Id = S::Id>,
    {
        self.store.expired(A::KIND, cutoff)
    }

    async fn record<A>(&self, id: &S::Id) -> Result<AggregateRecord<S::Id>, LoadErrorOf<S>>
    where
        A: Aggregate<Id = S::Id>,
    {
        match self.store.get(A::KIND, id).await.map_err(LoadError::Store)? {
            Lookup::Found(record) => Ok(record),
            Lookup::NotFound => Err(LoadError::NotFound {
                kind: A::KIND,
                id: id.clone(),
            }),
            Lookup::Archived => Err(LoadError::Archived {
                kind: A::KIND,
                id: id.clone(),
            }),
        }
    }

    fn shell<A>(
        &self,
        record: &AggregateRecord<S::Id>,
        version: u64,
    ) -> Result<AggregateRoot<A>, ConstructionError>
    where
        A: Aggregate<Id = S::Id>,
    {
        let mut args = ShellArgs::new(record.aggregate_id.clone()).at_version(version);
        if let Some(tenant_id) = &record.tenant_id {
            args = args.for_tenant(tenant_id.clone());
        }
        self.factory.shell(args)
    }

    async fn decoded_events<A>(
        &self,
        id: &S::Id,
        filter: EventFilter,
    ) -> Result<Vec<EventOf<A>>, LoadErrorOf<S>>
    where
        A: Aggregate<Id = S::Id>,
    {
        let stored = self
            .store
            .load_events(A::KIND, id, filter)
            .await
            .map_err(LoadError::Store)?;
        let codec = self.store.codec();
        stored
            .into_iter()
            .map(|event| decode_event::<A, _>(event, codec).map_err(LoadError::EventDecode))
            .collect()
    }

    /// Replay the stored tail onto `root` and copy the record's deletion
    /// state.
    async fn replay_tail<A>(
        &self,
        root: &mut AggregateRoot<A>,
        record: &AggregateRecord<S::Id>,
    ) -> Result<(), LoadErrorOf<S>>
    where
        A: Aggregate<Id = S::Id>,
    {
        let filter = EventFilter::all().after(root.version());
        let history = self.decoded_events::<A>(root.id(), filter).await?;
        root.rehydrate(history).map_err(|err| {
            tracing::error!(error = %err, "stored history rejected during replay");
            LoadError::Replay(err)
        })?;
        if root.version() != record.version {
            return Err(LoadError::Inconsistent {
                recorded: record.version,
                found: root.version(),
            });
        }
        root.set_deletion(record.deleted, record.deleted_at);
        Ok(())
    }

    /// Flush, encode and atomically persist. Returns the version the commit
    /// started from and the committed events.
    async fn commit<A>(
        &self,
        root: &mut AggregateRoot<A>,
        expected_version: Option<u64>,
    ) -> Result<(u64, Vec<EventOf<A>>), SaveErrorOf<S>>
    where
        A: Aggregate<Id = S::Id>,
    {
        let loaded = root.version();
        let expected = expected_version.unwrap_or(loaded);
        if expected != loaded {
            tracing::debug!(
                expected_version = expected,
                loaded,
                "save rejected: stale expected version"
            );
            return Err(SaveError::Conflict(ConcurrencyConflict {
                expected,
                actual: loaded,
            }));
        }

        let commit = root.stage_commit().map_err(SaveError::Flush)?;
        let codec = self.store.codec();
        let mut persistable = Vec::with_capacity(commit.events.len());
        for (version, event) in (loaded + 1..).zip(&commit.events) {
            let data = event
                .payload()
                .encode(codec)
                .map_err(|source| SaveError::Codec {
                    kind: event.kind(),
                    source,
                })?;
            persistable.push(PersistableEvent {
                event_id: event.event_id(),
                kind: event.kind().to_string(),
                version,
                data,
                created_at: event.created_at(),
                originator: event.originator().clone(),
            });
        }

        let record = AggregateRecord {
            aggregate_id: root.id().clone(),
            version: commit.version,
            tenant_id: root.tenant_id().map(str::to_string),
            deleted: root.is_deleted(),
            deleted_at: root.deleted_at(),
        };
        let event_count = persistable.len();
        tracing::debug!(expected_version = expected, event_count, "committing aggregate");

        self.store
            .save(A::KIND, record, expected, persistable)
            .await
            .map_err(|err| match err {
                store::SaveError::Conflict(conflict) => {
                    tracing::debug!(%conflict, "save rejected by concurrency check");
                    SaveError::Conflict(conflict)
                }
                store::SaveError::Archived => SaveError::Archived {
                    kind: A::KIND,
                    id: root.id().clone(),
                },
                store::SaveError::NonContiguous { expected, found } => {
                    SaveError::InvalidBatch { expected, found }
                }
                store::SaveError::Store(err) => SaveError::Store(err),
            })?;

        Ok((loaded, root.complete_commit(commit)))
    }
}

impl<S> Repository<S, NoSnapshots<S::Id>>
where
    S: AggregateStore,
{
    /// Load an aggregate by replaying all of its events.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::NotFound`] or [`LoadError::Archived`] if there is
    /// no live aggregate, and decode, replay or store errors otherwise.
    #[tracing::instrument(skip(self), fields(aggregate_kind = A::KIND))]
    pub async fn load<A>(&self, id: &S::Id) -> LoadResult<A, S>
    where
        A: Aggregate<Id = S::Id>,
    {
        let record = self.record::<A>(id).await?;
        let mut root = self.shell::<A>(&record, 0)?;
        self.replay_tail(&mut root, &record).await?;
        tracing::trace!(version = root.version(), "aggregate loaded");
        Ok(root)
    }

    /// Persist the aggregate's buffered events and record.
    ///
    /// `expected_version` defaults to the aggregate's committed version. On
    /// success the aggregate's buffer is flushed and its version advanced;
    /// on any error it is left as it was.
    ///
    /// # Errors
    ///
    /// Returns [`SaveError::Conflict`] if another writer got there first or
    /// `expected_version` is not the aggregate's committed version, and the
    /// other [`SaveError`] variants for flush, encode and store failures.
    #[tracing::instrument(
        skip(self, root),
        fields(aggregate_kind = A::KIND, version = root.version())
    )]
    pub async fn save<A>(
        &self,
        root: &mut AggregateRoot<A>,
        expected_version: Option<u64>,
    ) -> SaveResult<A, S>
    where
        A: Aggregate<Id = S::Id>,
    {
        let (_, committed) = self.commit(root, expected_version).await?;
        Ok(committed)
    }
}

impl<S, SS> Repository<S, Snapshots<SS>>
where
    S: AggregateStore,
    SS: SnapshotStore<S::Id>,
{
    #[must_use]
    pub const fn snapshot_store(&self) -> &SS {
        &self.snapshots.0
    }

    /// Load an aggregate from its latest snapshot plus the events after it.
    ///
    /// A snapshot that fails to load, or claims a version past the stored
    /// aggregate, is logged and ignored in favor of a full replay.
    ///
    /// # Errors
    ///
    /// Same as the plain repository's `load`.
    #[tracing::instrument(skip(self), fields(aggregate_kind = A::KIND))]
    pub async fn load<A>(&self, id: &S::Id) -> LoadResult<A, S>
    where
        A: Aggregate<Id = S::Id> + Serialize + DeserializeOwned,
    {
        let record = self.record::<A>(id).await?;

        let snapshot = self
            .snapshots
            .0
            .load::<A>(A::KIND, id)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    error = %e,
                    "failed to load snapshot, falling back to full replay"
                );
            })
            .ok()
            .flatten()
            .filter(|snapshot| {
                let usable = snapshot.version <= record.version;
                if !usable {
                    tracing::warn!(
                        snapshot_version = snapshot.version,
                        stored_version = record.version,
                        "snapshot is ahead of stored aggregate, falling back to full replay"
                    );
                }
                usable
            });

        let mut root = match snapshot {
            Some(snapshot) => {
                let mut root = self.shell::<A>(&record, snapshot.version)?;
                root.restore_state(snapshot.data);
                tracing::trace!(snapshot_version = snapshot.version, "snapshot restored");
                root
            }
            None => self.shell::<A>(&record, 0)?,
        };
        self.replay_tail(&mut root, &record).await?;
        tracing::trace!(version = root.version(), "aggregate loaded");
        Ok(root)
    }

    /// Persist like the plain repository's `save`, then offer a snapshot.
    ///
    /// The snapshot store's policy decides whether one is taken. A failed
    /// snapshot is logged and does not fail the save; the events are already
    /// committed.
    ///
    /// # Errors
    ///
    /// Same as the plain repository's `save`.
    #[tracing::instrument(
        skip(self, root),
        fields(aggregate_kind = A::KIND, version = root.version())
    )]
    pub async fn save<A>(
        &self,
        root: &mut AggregateRoot<A>,
        expected_version: Option<u64>,
    ) -> SaveResult<A, S>
    where
        A: Aggregate<Id = S::Id> + Serialize + DeserializeOwned,
    {
        let (committed_from, committed) = self.commit(root, expected_version).await?;

        if let Some(state) = root.state() {
            let version = root.version();
            let offer = self
                .snapshots
                .0
                .offer_snapshot::<Infallible, &A, _>(
                    A::KIND,
                    root.id(),
                    committed_from,
                    committed.len() as u64,
                    move || {
                        Ok(Snapshot {
                            version,
                            data: state,
                        })
                    },
                )
                .await;
            match offer {
                Ok(SnapshotOffer::Stored) => {
                    tracing::debug!(snapshot_version = version, "snapshot stored");
                }
                Ok(SnapshotOffer::Declined) => {}
                Err(OfferSnapshotError::Create(never)) => match never {},
                Err(OfferSnapshotError::Snapshot(e)) => {
                    tracing::warn!(error = %e, "failed to store snapshot");
                }
            }
        }

        Ok(committed)
    }
}

impl<S, M> fmt::Debug for Repository<S, M>
where
    S: AggregateStore + fmt::Debug,
    M: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("store", &self.store)
            .field("snapshots", &self.snapshots)
            .finish_non_exhaustive()
    }
}

fn decode_event<A, C>(
    stored: StoredEvent<A::Id>,
    codec: &C,
) -> Result<EventOf<A>, EventDecodeError<C::Error>>
where
    A: Aggregate,
    C: Codec,
{
    let payload = A::Event::decode(&stored.kind, &stored.data, codec)?;
    Ok(Envelope::from_parts(EnvelopeParts {
        event_id: stored.event_id,
        aggregate_id: stored.aggregate_id,
        version: stored.version,
        created_at: stored.created_at,
        originator: stored.originator,
        payload,
    }))
}
