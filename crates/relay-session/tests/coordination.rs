//! End-to-end coordination tests over the in-memory backends.
//!
//! Every test builds the same stack a production process would, with the
//! Postgres repository and Redis store swapped for their in-memory
//! implementations. Several tests build two services over one shared
//! store/repository pair to stand in for two cluster instances.

use std::sync::Arc;
use std::time::Duration;

use relay_session::{
    DistributedLock, MemorySessionRepository, SessionConfig, SessionError, SessionService,
    SessionStatus, SessionUpdate,
};
use relay_store::{CacheStore, MemoryCacheStore};

struct Harness {
    repository: Arc<MemorySessionRepository>,
    cache: Arc<MemoryCacheStore>,
    config: SessionConfig,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    fn with_config(config: SessionConfig) -> Self {
        Self {
            repository: Arc::new(MemorySessionRepository::new()),
            cache: Arc::new(MemoryCacheStore::new()),
            config,
        }
    }

    /// Build a service over the shared backends, as one cluster instance.
    fn instance(&self) -> SessionService {
        SessionService::new(
            Arc::clone(&self.repository) as Arc<dyn relay_session::SessionRepository>,
            Arc::clone(&self.cache) as Arc<dyn CacheStore>,
            self.config.clone(),
        )
    }
}

/// Lock settings that keep heavily contended tests fast and starvation-free.
fn contended_config() -> SessionConfig {
    SessionConfig::default()
        .with_lock_retry_initial(Duration::from_millis(1))
        .with_lock_retry_cap(Duration::from_millis(10))
        .with_lock_acquire_timeout(Duration::from_secs(30))
}

#[tokio::test]
async fn test_create_then_get_round_trip() {
    let harness = Harness::new();
    let service = harness.instance();

    let created = service
        .create_session("sonnet", None, Some("sk-owner"))
        .await
        .unwrap();

    let fetched = service.get_session(&created.id).await.unwrap();
    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.model, "sonnet");
    assert_eq!(fetched.status, SessionStatus::Active);
    assert_eq!(fetched.owner_api_key_hash, created.owner_api_key_hash);
}

#[tokio::test]
async fn test_fork_requires_existing_parent() {
    let harness = Harness::new();
    let service = harness.instance();

    let parent = service.create_session("sonnet", None, None).await.unwrap();
    let fork = service
        .create_session("sonnet", Some(&parent.id), None)
        .await
        .unwrap();
    assert_eq!(fork.parent_session_id.as_deref(), Some(parent.id.as_str()));

    let bogus = service
        .create_session("sonnet", Some("no-such-session"), None)
        .await;
    assert!(matches!(bogus, Err(SessionError::NotFound)));
}

#[tokio::test]
async fn test_concurrent_updates_lose_nothing() {
    let harness = Harness::with_config(contended_config());
    let service = Arc::new(harness.instance());

    let session = service.create_session("sonnet", None, None).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let service = Arc::clone(&service);
        let id = session.id.clone();
        tasks.push(tokio::spawn(async move {
            service
                .update_session(&id, SessionUpdate::new().add_turns(1))
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let final_state = service.get_session(&session.id).await.unwrap();
    assert_eq!(final_state.total_turns, 50);
}

#[tokio::test]
async fn test_reader_never_sees_pre_update_projection() {
    let harness = Harness::new();
    let service = harness.instance();

    let session = service.create_session("sonnet", None, None).await.unwrap();

    // Populate the projection, then mutate.
    service.get_session(&session.id).await.unwrap();
    service
        .update_session(
            &session.id,
            SessionUpdate::new().with_status(SessionStatus::Completed),
        )
        .await
        .unwrap();

    // The update invalidated the projection, so this read repopulates
    // from the repository and must reflect the new status.
    let fetched = service.get_session(&session.id).await.unwrap();
    assert_eq!(fetched.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_missing_and_unauthorized_are_indistinguishable() {
    let harness = Harness::new();
    let service = harness.instance();

    let owned = service
        .create_session("sonnet", None, Some("sk-owner"))
        .await
        .unwrap();

    let missing = service.get_session("no-such-session").await.unwrap_err();
    let wrong_key = service
        .enforce_owner(owned.clone(), Some("sk-intruder"))
        .unwrap_err();
    let no_key = service.enforce_owner(owned.clone(), None).unwrap_err();

    for err in [&missing, &wrong_key, &no_key] {
        assert!(matches!(err, SessionError::NotFound));
    }
    // Identical messages too: nothing to tell the cases apart by.
    assert_eq!(missing.to_string(), wrong_key.to_string());
    assert_eq!(wrong_key.to_string(), no_key.to_string());

    // The right key (and public sessions) pass.
    service.enforce_owner(owned, Some("sk-owner")).unwrap();
    let public = service.create_session("sonnet", None, None).await.unwrap();
    service.enforce_owner(public, None).unwrap();
}

#[tokio::test]
async fn test_update_under_held_lock_times_out() {
    let harness = Harness::with_config(
        SessionConfig::default().with_lock_acquire_timeout(Duration::from_millis(100)),
    );
    let service = harness.instance();

    let session = service.create_session("sonnet", None, None).await.unwrap();

    // Another instance holds the mutation lock and never releases it.
    let foreign_lock = DistributedLock::new(
        Arc::clone(&harness.cache) as Arc<dyn CacheStore>,
        &harness.config,
    );
    let _held = foreign_lock.acquire(&session.id).await.unwrap();

    let result = service
        .update_session(&session.id, SessionUpdate::new().add_turns(1))
        .await;
    // Contention is reported as its own kind, never folded into NotFound.
    assert!(matches!(result, Err(SessionError::LockTimeout(_))));
}

#[tokio::test]
async fn test_interrupt_is_visible_across_instances() {
    let harness = Harness::new();
    let streaming_instance = harness.instance();
    let api_instance = harness.instance();

    let session = streaming_instance
        .create_session("sonnet", None, None)
        .await
        .unwrap();

    streaming_instance.register_active(&session.id).await;
    assert!(api_instance.is_active(&session.id).await);

    // The interrupt lands on a different instance than the stream.
    api_instance.mark_interrupted(&session.id).await;
    assert!(streaming_instance.is_interrupted(&session.id).await);

    streaming_instance.unregister_active(&session.id).await;
    assert!(!api_instance.is_active(&session.id).await);
}

#[tokio::test]
async fn test_scenario_tenant_scoped_listing() {
    let harness = Harness::new();
    let service = harness.instance();

    let mine = service
        .create_session("sonnet", None, Some("sk-mine"))
        .await
        .unwrap();
    service
        .create_session("sonnet", None, Some("sk-other"))
        .await
        .unwrap();

    service
        .update_session(
            &mine.id,
            SessionUpdate::new().with_status(SessionStatus::Completed),
        )
        .await
        .unwrap();

    let (items, total) = service
        .list_sessions(Some("sk-mine"), 1, 10)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, mine.id);
    assert_eq!(items[0].status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_scenario_cache_outage_degrades_to_repository() {
    let harness = Harness::new();
    let service = harness.instance();

    let session = service
        .create_session("sonnet", None, Some("sk-owner"))
        .await
        .unwrap();

    harness.cache.set_unavailable(true);

    let fetched = service.get_session(&session.id).await.unwrap();
    assert_eq!(fetched.id, session.id);
    assert_eq!(fetched.model, "sonnet");

    // Listing degrades too.
    let (items, total) = service
        .list_sessions(Some("sk-owner"), 1, 10)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(items[0].id, session.id);
}

#[tokio::test]
async fn test_scenario_listing_ignores_other_tenants_volume() {
    let harness = Harness::new();
    let service = harness.instance();

    for i in 0..9_000 {
        service
            .create_session("sonnet", None, Some(&format!("sk-tenant-{}", i % 9)))
            .await
            .unwrap();
    }
    for _ in 0..1_000 {
        service
            .create_session("sonnet", None, Some("sk-mine"))
            .await
            .unwrap();
    }

    let (page, total) = service
        .list_sessions(Some("sk-mine"), 1, 50)
        .await
        .unwrap();
    assert_eq!(total, 1_000);
    assert_eq!(page.len(), 50);

    let owner_hash = relay_session::hash_api_key("sk-mine");
    assert!(
        page.iter()
            .all(|s| s.owner_api_key_hash.as_deref() == Some(owner_hash.as_str()))
    );
}

#[tokio::test]
async fn test_bounded_cache_listing_fast_path() {
    let harness = Harness::with_config(SessionConfig::default().with_cache_list_limit(100));
    let service = harness.instance();

    for _ in 0..5 {
        service.create_session("sonnet", None, None).await.unwrap();
    }

    let before = harness.cache.batched_fetches();
    let (items, total) = service.list_sessions(None, 1, 10).await.unwrap();
    assert_eq!(total, 5);
    assert_eq!(items.len(), 5);
    // Served from the shared store with a single bulk read.
    assert_eq!(harness.cache.batched_fetches(), before + 1);

    // Newest first.
    for pair in items.windows(2) {
        assert!(pair[0].created_at >= pair[1].created_at);
    }
}

#[tokio::test]
async fn test_listing_survives_invalidated_projections() {
    let harness = Harness::with_config(SessionConfig::default().with_cache_list_limit(100));
    let service = harness.instance();

    let kept = service.create_session("sonnet", None, None).await.unwrap();
    let updated = service.create_session("sonnet", None, None).await.unwrap();

    // The update invalidates its projection, leaving the cached
    // population one short of the live session population.
    service
        .update_session(
            &updated.id,
            SessionUpdate::new().with_status(SessionStatus::Completed),
        )
        .await
        .unwrap();

    let (items, total) = service.list_sessions(None, 1, 10).await.unwrap();
    assert_eq!(total, 2);
    let ids: Vec<&str> = items.iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&kept.id.as_str()));
    assert!(ids.contains(&updated.id.as_str()));
    assert_eq!(
        items.iter().find(|s| s.id == updated.id).unwrap().status,
        SessionStatus::Completed
    );
}

#[tokio::test]
async fn test_update_of_missing_session_is_not_found() {
    let harness = Harness::new();
    let service = harness.instance();

    let result = service
        .update_session("no-such-session", SessionUpdate::new().add_turns(1))
        .await;
    assert!(matches!(result, Err(SessionError::NotFound)));
}

#[tokio::test]
async fn test_cost_accumulates_monotonically() {
    let harness = Harness::new();
    let service = harness.instance();

    let session = service.create_session("sonnet", None, None).await.unwrap();
    assert_eq!(session.total_cost_usd, None);

    let after_first = service
        .update_session(&session.id, SessionUpdate::new().add_cost(0.10))
        .await
        .unwrap();
    assert_eq!(after_first.total_cost_usd, Some(0.10));

    let after_second = service
        .update_session(&session.id, SessionUpdate::new().add_cost(0.15))
        .await
        .unwrap();
    assert!(after_second.total_cost_usd.unwrap() > after_first.total_cost_usd.unwrap());
    assert!(after_second.updated_at >= after_first.updated_at);
}
