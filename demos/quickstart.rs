//! A tour of the aggregate lifecycle: author, save, reload, conflict,
//! snapshot and archive.
//!
//! Run with: `RUST_LOG=chronicle_core=debug cargo run --example quickstart --features test-util`

use chronicle::{
    Aggregate, Apply, BusinessRule, DomainEvent, Handle, Parameters, Repository, RuleViolation,
    SaveError, check_rule,
    snapshot::inmemory as snapshots,
    store::{Encoding, inmemory},
    test::RepositoryTestExt,
    typed_id,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

typed_id! {
    pub struct AccountId(uuid::Uuid);
}

// =============================================================================
// Domain Events
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, DomainEvent)]
#[event(kind = "account.opened")]
pub struct AccountOpened {
    pub owner: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, DomainEvent)]
#[event(kind = "account.deposited")]
pub struct FundsDeposited {
    pub amount: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, DomainEvent)]
#[event(kind = "account.withdrawn")]
pub struct FundsWithdrawn {
    pub amount: i64,
}

// =============================================================================
// Aggregate
// =============================================================================

#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Rule(#[from] RuleViolation),
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Aggregate)]
#[aggregate(
    id = AccountId,
    error = AccountError,
    events(AccountOpened, FundsDeposited, FundsWithdrawn),
    derives(Debug)
)]
pub struct Account {
    owner: String,
    balance: i64,
}

impl Apply<AccountOpened> for Account {
    fn apply(&mut self, event: &AccountOpened) {
        self.owner.clone_from(&event.owner);
    }
}

impl Apply<FundsDeposited> for Account {
    fn apply(&mut self, event: &FundsDeposited) {
        self.balance += event.amount;
    }
}

impl Apply<FundsWithdrawn> for Account {
    fn apply(&mut self, event: &FundsWithdrawn) {
        self.balance -= event.amount;
    }
}

struct SufficientFunds {
    balance: i64,
    requested: i64,
}

impl BusinessRule for SufficientFunds {
    fn is_broken(&self) -> bool {
        self.requested > self.balance
    }

    fn message(&self) -> String {
        "insufficient funds".to_string()
    }

    fn describe(&self, parameters: &mut Parameters) {
        parameters.insert("balance".to_string(), self.balance.into());
        parameters.insert("requested".to_string(), self.requested.into());
    }
}

// =============================================================================
// Commands
// =============================================================================

pub struct Open(pub String);

pub struct Deposit(pub i64);

pub struct Withdraw(pub i64);

impl Handle<Open> for Account {
    fn handle(&self, command: &Open) -> Result<Vec<Self::Event>, Self::Error> {
        Ok(vec![
            AccountOpened {
                owner: command.0.clone(),
            }
            .into(),
        ])
    }
}

impl Handle<Deposit> for Account {
    fn handle(&self, command: &Deposit) -> Result<Vec<Self::Event>, Self::Error> {
        Ok(vec![FundsDeposited { amount: command.0 }.into()])
    }
}

impl Handle<Withdraw> for Account {
    fn handle(&self, command: &Withdraw) -> Result<Vec<Self::Event>, Self::Error> {
        check_rule(&SufficientFunds {
            balance: self.balance,
            requested: command.0,
        })?;
        Ok(vec![FundsWithdrawn { amount: command.0 }.into()])
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let repository =
        Repository::new(inmemory::Store::new()).with_snapshots(snapshots::Store::every(5));
    let id = AccountId::generate();

    // Author and save.
    let mut account = repository.create::<Account>(id.clone())?;
    account.execute(&Open("ada".to_string()))?;
    account.execute(&Deposit(100))?;
    account.execute(&Withdraw(30))?;
    let committed = repository.save(&mut account, None).await?;
    println!("committed {} events, now at version {}", committed.len(), account.version());

    // Business rules reject behavior before any event exists.
    if let Err(AccountError::Rule(violation)) = account.execute(&Withdraw(500)) {
        println!("rejected: {} {:?}", violation.message, violation.parameters);
    }

    // Another writer gets in first; the stale save is refused wholesale.
    repository
        .inject_concurrent_event::<Account>(&id, FundsDeposited { amount: 1 }.into())
        .await?;
    account.execute(&Deposit(5))?;
    match repository.save(&mut account, None).await {
        Err(SaveError::Conflict(conflict)) => println!("{conflict}"),
        other => println!("unexpected: {other:?}"),
    }

    // Reload and retry the behavior.
    let mut account = repository.load::<Account>(&id).await?;
    account.execute(&Deposit(5))?;
    repository.save(&mut account, None).await?;
    println!(
        "balance {} at version {}, snapshot at {:?}",
        account.state().map_or(0, |state| state.balance),
        account.version(),
        repository.snapshot_store().version_of(Account::KIND, &id),
    );

    // Retire the account to cold storage and bring it back.
    account.mark_deleted();
    repository.save(&mut account, None).await?;
    repository
        .box_aggregate::<Account>(&id, Encoding::Json)
        .await?;
    println!("archived: exists = {}", repository.exists::<Account>(&id).await?);
    repository
        .unbox_aggregate::<Account>(&id, Encoding::Json)
        .await?;
    let restored = repository.load::<Account>(&id).await?;
    println!(
        "restored version {} (deleted = {})",
        restored.version(),
        restored.is_deleted()
    );

    Ok(())
}
