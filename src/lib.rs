#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use chronicle_core::test;
pub use chronicle_core::{
    aggregate,
    aggregate::{
        Aggregate, AggregateRoot, Apply, ConstructionError, EventOf, FlushError, Handle,
        ReplayError, SharedAggregate,
    },
    clock,
    clock::{Clock, ManualClock, SystemClock},
    codec,
    codec::{Codec, EventDecodeError, EventSet, JsonCodec},
    concurrency::ConcurrencyConflict,
    event,
    event::{EventKind, Envelope, Originator},
    factory,
    factory::{AggregateFactory, ShellArgs, ShellShape},
    id,
    id::{Identifier, ValueObject},
    repository,
    repository::{LoadError, Repository, SaveError, Snapshots},
    rule,
    rule::{BusinessRule, Parameters, RuleViolation, check_rule},
    typed_id, value_object_eq,
};
// Re-export proc macro derives so consumers only depend on `chronicle`.
pub use chronicle_macros::{Aggregate, DomainEvent};

pub mod store {
    pub use chronicle_core::store::{
        AggregateRecord, AggregateStore, ArchiveError, Encoding, EventFilter, Lookup,
        PersistableEvent, SaveError, SaveResult, StoredEvent,
    };

    pub use chronicle_core::store::inmemory;
}

pub mod snapshot {
    pub use chronicle_core::snapshot::{
        NoSnapshots, OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore,
        should_take_snapshot,
    };

    pub use chronicle_core::snapshot::inmemory;
}
