//! Domain events and their envelopes.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. It avoids persistence concerns; the [`Envelope`] wraps a
//! payload with the bookkeeping an aggregate root and a store need: event id,
//! owning aggregate, commit-time version, creation timestamp and originator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker trait for events that can be persisted by a store.
///
/// Each event carries a unique [`Self::KIND`] identifier so the repository can
/// route stored bytes back to the correct type when rehydrating aggregates.
///
/// `#[derive(Aggregate)]` generates [`EventKind`] for the event enums it
/// creates, so only the individual event structs implement this by hand.
pub trait DomainEvent {
    const KIND: &'static str;
}

/// Extension trait for getting the event kind from an event instance.
///
/// Blanket-implemented for every [`DomainEvent`]; event enums implement it by
/// dispatching to their variants.
pub trait EventKind {
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// Who caused an event.
///
/// Supplied by the caller's identity/context layer; the core only carries it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Originator {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub service_id: Option<String>,
    pub correlation_id: Option<Uuid>,
}

impl Originator {
    #[must_use]
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    #[must_use]
    pub const fn correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// An event payload plus its bookkeeping.
///
/// Everything except the version is fixed at construction. The version is
/// `None` until the owning aggregate flushes the event, which stamps it
/// exactly once.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<Id, E> {
    event_id: Uuid,
    aggregate_id: Id,
    version: Option<u64>,
    created_at: DateTime<Utc>,
    originator: Originator,
    payload: E,
}

/// Field set used by stores to reassemble a persisted envelope.
#[derive(Clone, Debug)]
pub struct EnvelopeParts<Id, E> {
    pub event_id: Uuid,
    pub aggregate_id: Id,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub originator: Originator,
    pub payload: E,
}

impl<Id, E> Envelope<Id, E> {
    /// Wrap a freshly produced event. The version stays unassigned.
    pub fn new(
        aggregate_id: Id,
        payload: E,
        created_at: DateTime<Utc>,
        originator: Originator,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            aggregate_id,
            version: None,
            created_at,
            originator,
            payload,
        }
    }

    /// Reassemble an already-committed envelope.
    pub fn from_parts(parts: EnvelopeParts<Id, E>) -> Self {
        Self {
            event_id: parts.event_id,
            aggregate_id: parts.aggregate_id,
            version: Some(parts.version),
            created_at: parts.created_at,
            originator: parts.originator,
            payload: parts.payload,
        }
    }

    pub const fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub const fn aggregate_id(&self) -> &Id {
        &self.aggregate_id
    }

    /// Commit-time version, `None` while the event is uncommitted.
    pub const fn version(&self) -> Option<u64> {
        self.version
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub const fn originator(&self) -> &Originator {
        &self.originator
    }

    pub const fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    pub(crate) fn stamp_version(&mut self, version: u64) {
        debug_assert!(
            self.version.is_none(),
            "event {} already carries version {:?}",
            self.event_id,
            self.version
        );
        self.version = Some(version);
    }
}

impl<Id, E: EventKind> Envelope<Id, E> {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}
