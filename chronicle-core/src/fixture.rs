//! Hand-written counter aggregate shared by the crate's unit tests.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, AggregateRoot, Handle},
    clock,
    codec::{Codec, EventDecodeError, EventSet, decode_variant},
    event::{DomainEvent, EventKind},
    rule::{BusinessRule, Parameters, RuleViolation, check_rule},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueAdded {
    pub amount: i64,
}

impl DomainEvent for ValueAdded {
    const KIND: &'static str = "value-added";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reset;

impl DomainEvent for Reset {
    const KIND: &'static str = "reset";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterEvent {
    Added(ValueAdded),
    Reset(Reset),
}

impl From<ValueAdded> for CounterEvent {
    fn from(event: ValueAdded) -> Self {
        Self::Added(event)
    }
}

impl From<Reset> for CounterEvent {
    fn from(event: Reset) -> Self {
        Self::Reset(event)
    }
}

impl EventKind for CounterEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => ValueAdded::KIND,
            Self::Reset(_) => Reset::KIND,
        }
    }
}

impl EventSet for CounterEvent {
    const EVENT_KINDS: &'static [&'static str] = &[ValueAdded::KIND, Reset::KIND];

    fn encode<C: Codec>(&self, codec: &C) -> Result<Vec<u8>, C::Error> {
        match self {
            Self::Added(event) => codec.serialize(event),
            Self::Reset(event) => codec.serialize(event),
        }
    }

    fn decode<C: Codec>(
        kind: &str,
        data: &[u8],
        codec: &C,
    ) -> Result<Self, EventDecodeError<C::Error>> {
        match kind {
            ValueAdded::KIND => decode_variant(kind, data, codec).map(Self::Added),
            Reset::KIND => decode_variant(kind, data, codec).map(Self::Reset),
            _ => Err(EventDecodeError::UnknownKind {
                kind: kind.to_string(),
                expected: Self::EVENT_KINDS,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum CounterError {
    #[error(transparent)]
    Rule(#[from] RuleViolation),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub value: i64,
    pub resets: u32,
}

impl Aggregate for Counter {
    const KIND: &'static str = "counter";

    type Event = CounterEvent;
    type Error = CounterError;
    type Id = String;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CounterEvent::Added(added) => self.value += added.amount,
            CounterEvent::Reset(_) => {
                self.value = 0;
                self.resets += 1;
            }
        }
    }
}

struct AmountPositive(i64);

impl BusinessRule for AmountPositive {
    fn is_broken(&self) -> bool {
        self.0 <= 0
    }

    fn message(&self) -> String {
        "amount must be positive".to_string()
    }

    fn describe(&self, parameters: &mut Parameters) {
        parameters.insert("amount".to_string(), self.0.into());
    }
}

pub struct Add(pub i64);

impl Handle<Add> for Counter {
    fn handle(&self, command: &Add) -> Result<Vec<Self::Event>, Self::Error> {
        check_rule(&AmountPositive(command.0))?;
        Ok(vec![ValueAdded { amount: command.0 }.into()])
    }
}

/// Counter that is both tenant-scoped and a distinct kind, for factory and
/// store tests.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub balance: i64,
}

impl Aggregate for Ledger {
    const KIND: &'static str = "ledger";
    const TENANT_SCOPED: bool = true;

    type Event = CounterEvent;
    type Error = CounterError;
    type Id = String;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CounterEvent::Added(added) => self.balance += added.amount,
            CounterEvent::Reset(_) => self.balance = 0,
        }
    }
}

pub fn counter_root(id: &str) -> AggregateRoot<Counter> {
    AggregateRoot::new(id.to_string(), clock::system()).expect("fixture id is non-empty")
}
