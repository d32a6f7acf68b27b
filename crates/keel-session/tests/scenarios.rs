mod common;

use std::time::Duration;

use assert_matches::assert_matches;

use keel_cache::{CacheKeys, CacheStore};
use keel_core::{MessageRole, NewMessage, OwnerKey, SessionError, SessionId, SessionStatus};
use keel_session::{CacheMode, CreateSession, ForkOptions, SessionFilter};

#[tokio::test]
async fn create_returns_fresh_active_session() {
    let (service, _cache) = common::cached_service();
    let session = service
        .create_session(CreateSession::new(OwnerKey::new("alice"), "sonnet"))
        .await
        .unwrap();
    assert_eq!(session.model, "sonnet");
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.total_turns, 0);
    assert_eq!(session.total_cost, 0.0);
    assert_eq!(session.message_count, 0);
    assert!(session.parent_session_id.is_none());
}

#[tokio::test]
async fn read_after_create_matches_regardless_of_cache() {
    let (service, cache) = common::cached_service();
    let session = common::create(&service, "alice").await;
    assert_eq!(service.get_session(&session.id).await.unwrap(), session);

    cache.delete(&CacheKeys::default().session(&session.id)).await.unwrap();
    assert_eq!(service.get_session(&session.id).await.unwrap(), session);

    // Garbage in the cache is dropped, not returned.
    cache
        .set_ex(&CacheKeys::default().session(&session.id), "{not json", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(service.get_session(&session.id).await.unwrap(), session);
}

#[tokio::test]
async fn missing_session_is_not_found() {
    let (service, _cache) = common::cached_service();
    let err = service
        .get_session(&SessionId::from_raw("nonexistent"))
        .await
        .unwrap_err();
    assert_matches!(&err, SessionError::NotFound { session_id } if session_id.as_str() == "nonexistent");
    assert_eq!(err.error_kind(), "session_not_found");
    assert!(!err.is_retryable());

    let err = service
        .update_session(&SessionId::from_raw("nonexistent"), |_| Ok(()))
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::NotFound { .. });
}

#[tokio::test]
async fn foreign_token_cannot_release_lock() {
    let (_service, cache) = common::cached_service();
    let key = CacheKeys::default().lock(&SessionId::from_raw("s1"));

    let x = cache.acquire_lock(&key, Duration::from_secs(5)).await.unwrap().unwrap();
    let y = "token-from-y";
    assert!(!cache.release_lock(&key, y).await.unwrap());
    assert!(cache.acquire_lock(&key, Duration::from_secs(5)).await.unwrap().is_none());

    assert!(cache.release_lock(&key, &x).await.unwrap());
    assert!(cache.acquire_lock(&key, Duration::from_secs(5)).await.unwrap().is_some());
}

#[tokio::test]
async fn create_validates_arguments() {
    let service = common::local_service();
    let owner = OwnerKey::new("alice");

    let err = service
        .create_session(CreateSession::new(owner.clone(), "  "))
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::InvalidConfiguration(_));

    let err = service
        .create_session(CreateSession::new(owner.clone(), "sonnet").with_id("bad id!"))
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::InvalidConfiguration(_));

    service
        .create_session(CreateSession::new(owner.clone(), "sonnet").with_id("s1"))
        .await
        .unwrap();
    let err = service
        .create_session(CreateSession::new(owner.clone(), "sonnet").with_id("s1"))
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::InvalidConfiguration(m) if m.contains("already in use"));

    let err = service
        .create_session(CreateSession::new(owner, "sonnet").with_parent(SessionId::from_raw("ghost")))
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::InvalidConfiguration(m) if m.contains("ghost"));
}

#[tokio::test]
async fn fork_inherits_and_leaves_parent_alone() {
    let service = common::local_service();
    let parent = service
        .create_session(
            CreateSession::new(OwnerKey::new("alice"), "sonnet")
                .with_working_directory("/repo")
                .with_metadata(serde_json::json!({"title": "refactor"})),
        )
        .await
        .unwrap();

    let child = service
        .fork_session(
            &parent.id,
            ForkOptions {
                model: Some("opus".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(child.parent_session_id.as_ref(), Some(&parent.id));
    assert_eq!(child.owner_key, parent.owner_key);
    assert_eq!(child.model, "opus");
    assert_eq!(child.working_directory.as_deref(), Some("/repo"));
    assert_eq!(child.metadata["title"], "refactor");
    assert_eq!(child.total_turns, 0);

    assert_eq!(service.get_session(&parent.id).await.unwrap(), parent);

    let err = service
        .fork_session(&SessionId::from_raw("ghost"), ForkOptions::default())
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::NotFound { .. });
}

#[tokio::test]
async fn parent_must_share_owner() {
    let service = common::local_service();
    let parent = common::create(&service, "alice").await;
    let err = service
        .create_session(CreateSession::new(OwnerKey::new("mallory"), "sonnet").with_parent(parent.id))
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::InvalidConfiguration(_));
}

#[tokio::test]
async fn listing_is_paginated_and_filtered() {
    let service = common::local_service();
    let owner = OwnerKey::new("alice");
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(common::create(&service, "alice").await.id);
    }
    service
        .update_session(&ids[0], |s| {
            s.status = SessionStatus::Completed;
            Ok(())
        })
        .await
        .unwrap();

    let first = service
        .list_sessions(&owner, SessionFilter { page_size: Some(2), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(first.sessions.len(), 2);
    assert_eq!(first.total, 5);
    assert!(first.has_more());

    let last = service
        .list_sessions(
            &owner,
            SessionFilter {
                page: Some(3),
                page_size: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(last.sessions.len(), 1);
    assert!(!last.has_more());

    let completed = service
        .list_sessions(
            &owner,
            SessionFilter {
                status: Some(SessionStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(completed.total, 1);
    assert_eq!(completed.sessions[0].id, ids[0]);

    // Oversized pages are clamped.
    let clamped = service
        .list_sessions(&owner, SessionFilter { page_size: Some(10_000), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(clamped.page_size, 100);
}

#[tokio::test]
async fn appended_messages_invalidate_cached_projection() {
    let (service, _cache) = common::cached_service();
    let session = common::create(&service, "alice").await;

    let m1 = service
        .append_message(&session.id, NewMessage::text(MessageRole::User, "hello"))
        .await
        .unwrap();
    let m2 = service
        .append_message(&session.id, NewMessage::text(MessageRole::Assistant, "hi"))
        .await
        .unwrap();
    assert_eq!((m1.sequence, m2.sequence), (1, 2));
    assert_eq!(service.get_session(&session.id).await.unwrap().message_count, 2);

    let tail = service.list_messages(&session.id, 1, 10).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].role, MessageRole::Assistant);

    let err = service
        .append_message(&SessionId::from_raw("ghost"), NewMessage::text(MessageRole::User, "x"))
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::NotFound { .. });
}

#[tokio::test]
async fn mutator_errors_abort_without_writing() {
    let service = common::local_service();
    let session = common::create(&service, "alice").await;
    let err = service
        .update_session(&session.id, |_| Err(SessionError::InvalidConfiguration("nope".into())))
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::InvalidConfiguration(_));
    assert_eq!(service.get_session(&session.id).await.unwrap().version, session.version);

    // No-op mutations do not bump the version.
    let same = service.update_session(&session.id, |_| Ok(())).await.unwrap();
    assert_eq!(same.version, session.version);
}

#[tokio::test]
async fn health_and_eviction() {
    let (service, cache) = common::cached_service();
    let a = common::create(&service, "alice").await;
    common::create(&service, "bob").await;

    let health = service.health().await;
    assert!(health.is_healthy());
    assert_eq!(health.cache_mode, CacheMode::Distributed);
    assert_eq!(health.store_backend, "sqlite");
    assert_eq!(health.cached_sessions, Some(2));

    assert!(service.evict(&a.id).await);
    assert!(!service.evict(&a.id).await);
    assert!(cache
        .get(&CacheKeys::default().session(&a.id))
        .await
        .unwrap()
        .is_none());
}
