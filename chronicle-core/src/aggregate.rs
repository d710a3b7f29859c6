//! Command-side domain primitives.
//!
//! An aggregate's state is a plain struct implementing [`Aggregate`]: it folds
//! events through one [`Apply<E>`] implementation per event type and validates
//! commands through [`Handle<C>`]. `#[derive(Aggregate)]` generates the closed
//! event enum and the `match` that dispatches each variant to its `Apply`
//! implementation, so a missing handler is a compile error.
//!
//! [`AggregateRoot`] owns one such state together with the identifier, the
//! committed version, the buffer of uncommitted events and the soft-delete
//! flag. Behavior appends events with [`AggregateRoot::apply`]; the repository
//! persists them through [`AggregateRoot::flush_uncommitted_changes`];
//! loading replays history with [`AggregateRoot::rehydrate`].

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    clock::Clock,
    codec::EventSet,
    event::{Envelope, Originator},
    factory::ShellShape,
    id::Identifier,
    rule::RuleViolation,
};

/// Aggregate state rebuilt from events.
///
/// The state has no identity of its own; it lives inside exactly one
/// [`AggregateRoot`]. If snapshots are enabled the state must also be
/// `Serialize + DeserializeOwned`.
pub trait Aggregate: Default + Sized + Send + Sync + 'static {
    /// Aggregate type identifier used by stores to key records and event
    /// streams. Use lowercase kebab-case: `"post"`, `"user-account"`.
    const KIND: &'static str;

    /// Whether persisted instances carry a tenant id. Decides which
    /// construction shape the factory accepts.
    const TENANT_SCOPED: bool = false;

    type Event: EventSet + Clone + Send + Sync + 'static;
    type Error: From<RuleViolation>;
    type Id: Identifier;

    /// Fold an event into the state.
    ///
    /// With `#[derive(Aggregate)]` this dispatches to the `Apply<E>`
    /// implementations; hand-written aggregates use a `match`.
    fn apply(&mut self, event: &Self::Event);
}

/// Fold one event type into aggregate state.
///
/// ```ignore
/// impl Apply<PostPublished> for Post {
///     fn apply(&mut self, event: &PostPublished) {
///         self.published_at = Some(event.at);
///     }
/// }
/// ```
pub trait Apply<E> {
    fn apply(&mut self, event: &E);
}

/// Behavior entry point for one command type.
///
/// Implementations check their invariants with
/// [`check_rule`](crate::rule::check_rule) and return the events describing
/// what happened. They never mutate state directly.
///
/// ```ignore
/// impl Handle<Publish> for Post {
///     fn handle(&self, command: &Publish) -> Result<Vec<Self::Event>, Self::Error> {
///         check_rule(&NotYetPublished(self))?;
///         Ok(vec![PostPublished { at: command.at }.into()])
///     }
/// }
/// ```
pub trait Handle<C>: Aggregate {
    /// # Errors
    ///
    /// Returns `Self::Error` if the command violates an invariant.
    fn handle(&self, command: &C) -> Result<Vec<Self::Event>, Self::Error>;
}

/// Envelope type carried by an aggregate's buffer and history.
pub type EventOf<A> = Envelope<<A as Aggregate>::Id, <A as Aggregate>::Event>;

/// Failure to build an aggregate root. Never recoverable by retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstructionError {
    #[error("aggregate `{kind}` requires a non-empty identifier")]
    EmptyId { kind: &'static str },
    #[error("aggregate `{kind}` has no construction path of shape {shape}")]
    MissingConstructor {
        kind: &'static str,
        shape: ShellShape,
    },
}

/// History rejected during replay. The aggregate must be treated as corrupt
/// for this load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError<Id> {
    #[error("event {event_id} belongs to aggregate {found}, not {expected}")]
    AggregateMismatch {
        expected: Id,
        found: Id,
        event_id: Uuid,
    },
    #[error("event {event_id} is out of sequence: expected version {expected}, found {found:?}")]
    OutOfSequence {
        expected: u64,
        found: Option<u64>,
        event_id: Uuid,
    },
    #[error("cannot replay history beneath {pending} uncommitted event(s)")]
    PendingChanges { pending: usize },
}

/// A buffered event cannot be committed. Indicates a programming error, not
/// a business failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlushError<Id> {
    #[error("event {event_id} has an empty aggregate identifier")]
    EmptyAggregateId { event_id: Uuid },
    #[error("event {event_id} belongs to aggregate {found}, not {expected}")]
    AggregateMismatch {
        expected: Id,
        found: Id,
        event_id: Uuid,
    },
    #[error("event {event_id} was already committed at version {version}")]
    AlreadyCommitted { event_id: Uuid, version: u64 },
}

/// Finalized events plus the version they advance the aggregate to.
pub(crate) struct Commit<A: Aggregate> {
    pub(crate) events: Vec<EventOf<A>>,
    pub(crate) version: u64,
}

/// Identity, version, uncommitted buffer and soft-delete flag around one
/// aggregate state.
///
/// Mutation goes through `&mut self`; share a root between tasks with
/// [`SharedAggregate`].
pub struct AggregateRoot<A: Aggregate> {
    id: A::Id,
    version: u64,
    tenant_id: Option<String>,
    state: Option<A>,
    uncommitted: Vec<EventOf<A>>,
    deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
    originator: Originator,
    clock: Arc<dyn Clock>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Start a new aggregate at version 0.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::EmptyId`] if `id` is the empty sentinel.
    pub fn new(id: A::Id, clock: Arc<dyn Clock>) -> Result<Self, ConstructionError> {
        Self::starting_at(id, 0, clock)
    }

    /// Start a new aggregate whose committed version is `version`.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::EmptyId`] if `id` is the empty sentinel.
    pub fn starting_at(
        id: A::Id,
        version: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConstructionError> {
        if id.is_empty() {
            return Err(ConstructionError::EmptyId { kind: A::KIND });
        }
        Ok(Self::shell(id, version, None, clock))
    }

    /// Bare instance for replay. No validation, no events.
    pub(crate) fn shell(
        id: A::Id,
        version: u64,
        tenant_id: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id,
            version,
            tenant_id,
            state: None,
            uncommitted: Vec::new(),
            deleted: false,
            deleted_at: None,
            originator: Originator::default(),
            clock,
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Originator stamped onto events applied from now on.
    #[must_use]
    pub fn with_originator(mut self, originator: Originator) -> Self {
        self.originator = originator;
        self
    }

    pub fn set_originator(&mut self, originator: Originator) {
        self.originator = originator;
    }

    pub const fn id(&self) -> &A::Id {
        &self.id
    }

    /// Version of the last committed event.
    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Current state, `None` until the first event is applied.
    pub const fn state(&self) -> Option<&A> {
        self.state.as_ref()
    }

    pub const fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub const fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub const fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fold a new event into the state and buffer it as uncommitted.
    ///
    /// Performs no business validation: callers check their rules first.
    pub fn apply(&mut self, event: impl Into<A::Event>) {
        let envelope = Envelope::new(
            self.id.clone(),
            event.into(),
            self.clock.now(),
            self.originator.clone(),
        );
        self.record(envelope);
    }

    /// Fold and buffer an envelope built by the caller.
    ///
    /// The envelope is checked against this aggregate when flushed.
    pub fn record(&mut self, envelope: EventOf<A>) {
        let state = self.state.get_or_insert_with(A::default);
        Aggregate::apply(state, envelope.payload());
        tracing::trace!(
            aggregate_kind = A::KIND,
            event_kind = envelope.kind(),
            pending = self.uncommitted.len() + 1,
            "event applied"
        );
        self.uncommitted.push(envelope);
    }

    /// Run a command handler against the current state and apply the events
    /// it produces. Returns the number of events applied.
    ///
    /// # Errors
    ///
    /// Returns the handler's error; nothing is applied in that case.
    pub fn execute<C>(&mut self, command: &C) -> Result<usize, A::Error>
    where
        A: Handle<C>,
    {
        let events = match &self.state {
            Some(state) => state.handle(command)?,
            None => A::default().handle(command)?,
        };
        let count = events.len();
        for event in events {
            self.apply(event);
        }
        Ok(count)
    }

    /// Copy of the uncommitted buffer. Does not clear it.
    pub fn uncommitted_changes(&self) -> Vec<EventOf<A>> {
        self.uncommitted.clone()
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    pub fn uncommitted_count(&self) -> usize {
        self.uncommitted.len()
    }

    /// Stamp every buffered event with its final version, advance the
    /// committed version by the buffer length and clear the buffer.
    ///
    /// The i-th buffered event (1-based) receives `version + i`.
    ///
    /// # Errors
    ///
    /// Returns [`FlushError`] if a buffered event has an empty or foreign
    /// aggregate id, or already carries a version. Nothing changes in that
    /// case.
    pub fn flush_uncommitted_changes(&mut self) -> Result<Vec<EventOf<A>>, FlushError<A::Id>> {
        let commit = self.stage_commit()?;
        Ok(self.complete_commit(commit))
    }

    /// Finalize the buffer without touching the aggregate.
    pub(crate) fn stage_commit(&self) -> Result<Commit<A>, FlushError<A::Id>> {
        let mut events = self.uncommitted.clone();
        for (offset, event) in (1_u64..).zip(events.iter_mut()) {
            let event_id = event.event_id();
            if event.aggregate_id().is_empty() {
                return Err(FlushError::EmptyAggregateId { event_id });
            }
            if *event.aggregate_id() != self.id {
                return Err(FlushError::AggregateMismatch {
                    expected: self.id.clone(),
                    found: event.aggregate_id().clone(),
                    event_id,
                });
            }
            if let Some(version) = event.version() {
                return Err(FlushError::AlreadyCommitted { event_id, version });
            }
            event.stamp_version(self.version + offset);
        }
        let version = self.version + events.len() as u64;
        Ok(Commit { events, version })
    }

    pub(crate) fn complete_commit(&mut self, commit: Commit<A>) -> Vec<EventOf<A>> {
        tracing::debug!(
            aggregate_kind = A::KIND,
            from_version = self.version,
            to_version = commit.version,
            event_count = commit.events.len(),
            "uncommitted events flushed"
        );
        self.version = commit.version;
        self.uncommitted.clear();
        commit.events
    }

    /// Replay committed history onto this aggregate.
    ///
    /// Every event must belong to this aggregate and carry
    /// `current_version + 1`. The whole history is checked before anything is
    /// folded, so a rejected call leaves the aggregate untouched. History is
    /// never added to the uncommitted buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] for foreign, out-of-sequence or unversioned
    /// events, or if uncommitted events are pending.
    pub fn rehydrate<I>(&mut self, history: I) -> Result<(), ReplayError<A::Id>>
    where
        I: IntoIterator<Item = EventOf<A>>,
    {
        if !self.uncommitted.is_empty() {
            return Err(ReplayError::PendingChanges {
                pending: self.uncommitted.len(),
            });
        }

        let history: Vec<EventOf<A>> = history.into_iter().collect();
        let mut expected = self.version;
        for event in &history {
            if *event.aggregate_id() != self.id {
                tracing::warn!(
                    aggregate_kind = A::KIND,
                    event_id = %event.event_id(),
                    "replay rejected: foreign aggregate id"
                );
                return Err(ReplayError::AggregateMismatch {
                    expected: self.id.clone(),
                    found: event.aggregate_id().clone(),
                    event_id: event.event_id(),
                });
            }
            expected += 1;
            if event.version() != Some(expected) {
                tracing::warn!(
                    aggregate_kind = A::KIND,
                    expected,
                    found = ?event.version(),
                    "replay rejected: out-of-sequence version"
                );
                return Err(ReplayError::OutOfSequence {
                    expected,
                    found: event.version(),
                    event_id: event.event_id(),
                });
            }
        }

        if history.is_empty() {
            return Ok(());
        }

        let state = self.state.get_or_insert_with(A::default);
        for event in &history {
            Aggregate::apply(state, event.payload());
        }
        tracing::trace!(
            aggregate_kind = A::KIND,
            from_version = self.version,
            to_version = expected,
            "history replayed"
        );
        self.version = expected;
        Ok(())
    }

    /// Soft delete. Keeps the state; only sets the flag and timestamp.
    pub fn mark_deleted(&mut self) {
        if !self.deleted {
            self.deleted = true;
            self.deleted_at = Some(self.clock.now());
        }
    }

    /// Reverse a soft delete.
    pub fn undelete(&mut self) {
        self.deleted = false;
        self.deleted_at = None;
    }

    pub(crate) fn set_deletion(&mut self, deleted: bool, deleted_at: Option<DateTime<Utc>>) {
        self.deleted = deleted;
        self.deleted_at = deleted_at;
    }

    pub(crate) fn restore_state(&mut self, state: A) {
        self.state = Some(state);
    }
}

impl<A: Aggregate> fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("kind", &A::KIND)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("tenant_id", &self.tenant_id)
            .field("initialized", &self.state.is_some())
            .field("uncommitted", &self.uncommitted.len())
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}

/// One aggregate root shared between tasks.
///
/// Every mutation takes the same mutex, so concurrent command executions on
/// one in-process instance serialize instead of racing on the buffer. This
/// does not protect against other processes; that is the store's version
/// check.
pub struct SharedAggregate<A: Aggregate> {
    inner: Arc<tokio::sync::Mutex<AggregateRoot<A>>>,
}

impl<A: Aggregate> SharedAggregate<A> {
    pub fn new(root: AggregateRoot<A>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(root)),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, AggregateRoot<A>> {
        self.inner.lock().await
    }

    /// # Errors
    ///
    /// Returns the handler's error; nothing is applied in that case.
    pub async fn execute<C>(&self, command: &C) -> Result<usize, A::Error>
    where
        A: Handle<C>,
    {
        self.inner.lock().await.execute(command)
    }

    pub async fn uncommitted_changes(&self) -> Vec<EventOf<A>> {
        self.inner.lock().await.uncommitted_changes()
    }

    /// Take the root back if this is the last handle.
    ///
    /// # Errors
    ///
    /// Returns `self` if other handles are still alive.
    pub fn try_unwrap(self) -> Result<AggregateRoot<A>, Self> {
        Arc::try_unwrap(self.inner)
            .map(tokio::sync::Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

impl<A: Aggregate> Clone for SharedAggregate<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Aggregate> fmt::Debug for SharedAggregate<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAggregate")
            .field("kind", &A::KIND)
            .finish_non_exhaustive()
    }
}
