//! Core traits and types for the chronicle event-sourcing library.
//!
//! - [`id`] - value objects and typed identifiers (`ValueObject`, `Identifier`, `typed_id!`)
//! - [`rule`] - business rules checked before events are emitted (`BusinessRule`, `check_rule`)
//! - [`event`] - domain events and their envelope (`DomainEvent`, `Envelope`, `Originator`)
//! - [`codec`] - payload encoding (`Codec`, `JsonCodec`, `EventSet`)
//! - [`aggregate`] - the aggregate root and its fold (`Aggregate`, `AggregateRoot`, `Handle`)
//! - [`factory`] - uninitialized shells for replay (`AggregateFactory`)
//! - [`snapshot`] - replay shortcuts (`SnapshotStore`, `should_take_snapshot`)
//! - [`store`] - the persistence contract (`AggregateStore`)
//! - [`repository`] - load, save and archive (`Repository`)
//! - [`concurrency`] - the optimistic concurrency error
//! - [`clock`] - injectable time
//!
//! # Example
//!
//! ```
//! use chronicle_core::{repository::Repository, store::inmemory};
//!
//! let store: inmemory::Store<String> = inmemory::Store::new();
//! let repo = Repository::new(store);
//! ```
//!
//! Most users should depend on the `chronicle` crate, which re-exports these
//! types together with the derive macros.

pub mod aggregate;
pub mod clock;
pub mod codec;
pub mod concurrency;
pub mod event;
pub mod factory;
pub mod id;
pub mod repository;
pub mod rule;
pub mod snapshot;
pub mod store;



#[cfg(test)]
mod fixture;

#[doc(hidden)]
pub mod __private {
    pub use serde;
    pub use uuid;
}
