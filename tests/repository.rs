//! Integration tests for repository functionality.

#![cfg(feature = "test-util")]

mod common;

use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use chrono::{Duration, TimeZone, Utc};
use chronicle::{
    Clock, LoadError, ManualClock, Repository, SaveError, SharedAggregate,
    snapshot::{
        OfferSnapshotError, Snapshot, SnapshotOffer, SnapshotStore,
        inmemory::Store as InMemorySnapshotStore,
    },
    store::{ArchiveError, Encoding, inmemory},
    test::RepositoryTestExt,
};
use common::{Post, PostId, PostRetitled, Publish, Retitle, draft, init_tracing};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

type Store = inmemory::Store<PostId>;

async fn published_post(repo: &Repository<Store>) -> PostId {
    let id = PostId::generate();
    let mut post = repo.create::<Post>(id.clone()).unwrap();
    post.execute(&draft("Hello")).unwrap();
    post.execute(&Publish).unwrap();
    repo.save(&mut post, None).await.unwrap();
    id
}

#[tokio::test]
async fn save_with_correct_version_advances_by_buffer_length() {
    init_tracing();
    let repo = Repository::new(Store::new());
    let id = published_post(&repo).await;

    let post = repo.load::<Post>(&id).await.unwrap();
    assert_eq!(post.version(), 2);
    assert!(post.state().unwrap().published);
    assert!(repo.exists_at::<Post>(&id, 2).await.unwrap());
}

#[tokio::test]
async fn concurrent_writer_causes_conflict_without_partial_write() {
    init_tracing();
    let repo = Repository::new(Store::new());
    let id = PostId::generate();
    let mut post = repo.create::<Post>(id.clone()).unwrap();
    post.execute(&draft("Hello")).unwrap();
    repo.save(&mut post, None).await.unwrap();

    repo.inject_concurrent_event::<Post>(
        &id,
        PostRetitled {
            title: "Elsewhere".to_string(),
        }
        .into(),
    )
    .await
    .unwrap();

    post.execute(&Retitle("Mine".to_string())).unwrap();
    post.execute(&Publish).unwrap();
    let err = repo.save(&mut post, None).await.unwrap_err();

    let SaveError::Conflict(conflict) = err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!((conflict.expected, conflict.actual), (1, 2));
    assert!(conflict.to_string().contains("reload and retry"));
    assert_eq!(post.version(), 1);
    assert_eq!(post.uncommitted_count(), 2);

    let stored = repo.events::<Post>(&id, None).await.unwrap();
    assert_eq!(stored.len(), 2);
    let reloaded = repo.load::<Post>(&id).await.unwrap();
    assert_eq!(reloaded.state().unwrap().title, "Elsewhere");
}

#[tokio::test]
async fn retry_after_conflict_succeeds_on_fresh_load() {
    let repo = Repository::new(Store::new());
    let id = published_post(&repo).await;

    let mut first = repo.load::<Post>(&id).await.unwrap();
    let mut second = repo.load::<Post>(&id).await.unwrap();
    first.apply(PostRetitled {
        title: "One".to_string(),
    });
    repo.save(&mut first, None).await.unwrap();
    second.apply(PostRetitled {
        title: "Two".to_string(),
    });
    assert!(matches!(
        repo.save(&mut second, None).await,
        Err(SaveError::Conflict(_))
    ));

    let mut retry = repo.load::<Post>(&id).await.unwrap();
    retry.apply(PostRetitled {
        title: "Two".to_string(),
    });
    repo.save(&mut retry, None).await.unwrap();
    assert_eq!(retry.version(), 4);
}

#[tokio::test]
async fn creating_an_existing_aggregate_conflicts() {
    let repo = Repository::new(Store::new());
    let id = published_post(&repo).await;

    let mut duplicate = repo.create::<Post>(id.clone()).unwrap();
    duplicate.execute(&draft("Again")).unwrap();
    let err = repo.save(&mut duplicate, None).await.unwrap_err();

    assert!(matches!(
        err,
        SaveError::Conflict(conflict) if conflict.expected == 0 && conflict.actual == 2
    ));
}

#[tokio::test]
async fn not_found_deleted_and_archived_are_distinguishable() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let repo = Repository::new(Store::new()).with_clock(Arc::new(clock.clone()));

    let missing = PostId::generate();
    assert!(matches!(
        repo.load::<Post>(&missing).await,
        Err(LoadError::NotFound { .. })
    ));

    let id = published_post(&repo).await;
    let mut post = repo.load::<Post>(&id).await.unwrap();
    post.mark_deleted();
    repo.save(&mut post, None).await.unwrap();
    let deleted = repo.load::<Post>(&id).await.unwrap();
    assert!(deleted.is_deleted());

    repo.box_aggregate::<Post>(&id, Encoding::PrettyJson)
        .await
        .unwrap();
    assert!(matches!(
        repo.load::<Post>(&id).await,
        Err(LoadError::Archived { .. })
    ));
    assert!(!repo.exists::<Post>(&id).await.unwrap());
}

#[tokio::test]
async fn expired_posts_can_be_archived_and_restored() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let repo = Repository::new(Store::new()).with_clock(Arc::new(clock.clone()));
    let kept = published_post(&repo).await;
    let stale = published_post(&repo).await;

    let mut post = repo.load::<Post>(&stale).await.unwrap();
    post.mark_deleted();
    repo.save(&mut post, None).await.unwrap();
    clock.advance(Duration::days(30));

    let cutoff = clock.now() - Duration::days(7);
    let expired = repo.expired::<Post>(cutoff).await.unwrap();
    assert_eq!(expired, vec![stale.clone()]);

    for id in &expired {
        repo.box_aggregate::<Post>(id, Encoding::Json).await.unwrap();
    }
    assert!(repo.expired::<Post>(cutoff).await.unwrap().is_empty());
    assert!(repo.exists::<Post>(&kept).await.unwrap());

    let err = repo
        .unbox_aggregate::<Post>(&stale, Encoding::PrettyJson)
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::EncodingMismatch { .. }));

    let record = repo
        .unbox_aggregate::<Post>(&stale, Encoding::Json)
        .await
        .unwrap();
    assert_eq!(record.version, 2);
    assert!(record.deleted);
    let restored = repo.load::<Post>(&stale).await.unwrap();
    assert_eq!(restored.state().unwrap().title, "Hello");
}

#[tokio::test]
async fn archived_post_rejects_saves() {
    let repo = Repository::new(Store::new());
    let id = published_post(&repo).await;
    let mut post = repo.load::<Post>(&id).await.unwrap();
    repo.box_aggregate::<Post>(&id, Encoding::Json).await.unwrap();

    post.apply(PostRetitled {
        title: "Late".to_string(),
    });
    assert!(matches!(
        repo.save(&mut post, None).await,
        Err(SaveError::Archived { kind: "post", .. })
    ));
}

#[tokio::test]
async fn historical_load_and_events_up_to_version() {
    let repo = Repository::new(Store::new());
    let id = published_post(&repo).await;

    let draft_only = repo.load_at::<Post>(&id, 1).await.unwrap();
    assert!(!draft_only.state().unwrap().published);
    assert_eq!(repo.events::<Post>(&id, Some(1)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn interval_snapshots_bound_replay() {
    init_tracing();
    let snapshots = InMemorySnapshotStore::every(3);
    let repo = Repository::new(Store::new()).with_snapshots(snapshots.clone());
    let id = PostId::generate();
    let mut post = repo.create::<Post>(id.clone()).unwrap();

    post.execute(&draft("v1")).unwrap();
    repo.save(&mut post, None).await.unwrap();
    assert_eq!(snapshots.version_of("post", &id), None);

    // 1 -> 5 crosses the boundary at 3 mid-flush.
    for title in ["v2", "v3", "v4", "v5"] {
        post.execute(&Retitle(title.to_string())).unwrap();
    }
    repo.save(&mut post, None).await.unwrap();
    assert_eq!(snapshots.version_of("post", &id), Some(5));

    let loaded = repo.load::<Post>(&id).await.unwrap();
    assert_eq!(loaded.version(), 5);
    assert_eq!(loaded.state(), post.state());
}

#[derive(Debug, Error)]
#[error("snapshot backend unavailable")]
struct Unavailable;

/// Snapshot store whose every call fails, counting the calls.
#[derive(Debug, Default)]
struct BrokenSnapshots {
    calls: AtomicUsize,
}

impl SnapshotStore<PostId> for BrokenSnapshots {
    type Error = Unavailable;

    async fn load<'a, T>(
        &'a self,
        _: &'a str,
        _: &'a PostId,
    ) -> Result<Option<Snapshot<T>>, Self::Error>
    where
        T: DeserializeOwned + Send + 'a,
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Unavailable)
    }

    async fn offer_snapshot<'a, CE, T, Create>(
        &'a self,
        _: &'a str,
        _: &'a PostId,
        _: u64,
        _: u64,
        _: Create,
    ) -> Result<SnapshotOffer, OfferSnapshotError<Self::Error, CE>>
    where
        CE: std::error::Error + Send + Sync + 'static,
        T: Serialize + Send + 'a,
        Create: FnOnce() -> Result<Snapshot<T>, CE> + Send + 'a,
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(OfferSnapshotError::Snapshot(Unavailable))
    }
}

#[tokio::test]
async fn snapshot_failures_never_fail_saves_or_loads() {
    init_tracing();
    let repo = Repository::new(Store::new()).with_snapshots(BrokenSnapshots::default());
    let id = PostId::generate();
    let mut post = repo.create::<Post>(id.clone()).unwrap();
    post.execute(&draft("Hello")).unwrap();

    repo.save(&mut post, None).await.unwrap();
    let loaded = repo.load::<Post>(&id).await.unwrap();

    assert_eq!(loaded.state(), post.state());
    assert_eq!(repo.snapshot_store().calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shared_aggregate_serializes_in_process_commands() {
    let repo = Repository::new(Store::new());
    let id = PostId::generate();
    let mut post = repo.create::<Post>(id.clone()).unwrap();
    post.execute(&draft("start")).unwrap();
    repo.save(&mut post, None).await.unwrap();

    let shared = SharedAggregate::new(post);
    let tasks: Vec<_> = (0..8)
        .map(|n| {
            let shared = shared.clone();
            tokio::spawn(async move { shared.execute(&Retitle(format!("t{n}"))).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut guard = shared.lock().await;
    assert_eq!(guard.uncommitted_count(), 8);
    repo.save(&mut guard, None).await.unwrap();
    assert_eq!(guard.version(), 9);
    assert_eq!(guard.state().unwrap().revisions, 8);
}

#[tokio::test]
async fn never_policy_declines_without_building_a_snapshot() {
    let snapshots = InMemorySnapshotStore::<PostId>::never();
    let offer = snapshots
        .offer_snapshot::<Infallible, &Post, _>("post", &PostId::generate(), 0, 10, || {
            panic!("never policy must not build snapshots")
        })
        .await
        .unwrap();
    assert_eq!(offer, SnapshotOffer::Declined);
}
