mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use keel_cache::{CacheKeys, CacheStore, MemoryCache};

use keel_core::events::AgentEvent;
use keel_core::{MessageRole, NewMessage, SessionError, SessionId, SessionStatus};
use keel_session::SessionService;

async fn turn(service: &SessionService, id: &SessionId, turn: u32, cost: f64) {
    let outcome = service
        .apply_agent_event(AgentEvent::Turn {
            session_id: id.clone(),
            turn,
            total_cost: cost,
            messages: vec![
                NewMessage::text(MessageRole::User, format!("prompt {turn}")),
                NewMessage::text(MessageRole::Assistant, format!("reply {turn}")),
            ],
        })
        .await
        .unwrap();
    assert!(outcome.is_applied());
}

#[tokio::test]
async fn rewind_restores_counters_after_three_turns() {
    let (service, _cache) = common::cached_service();
    let session = common::create(&service, "alice").await;
    turn(&service, &session.id, 1, 0.1).await;

    let checkpoint = service
        .create_checkpoint(&session.id, "before-refactor", Some("git:abc123".into()))
        .await
        .unwrap();
    assert_eq!(checkpoint.total_turns, 1);
    assert_eq!(checkpoint.message_sequence, 2);
    assert_eq!(checkpoint.sequence, 1);

    for n in 2..=4 {
        turn(&service, &session.id, n, 0.1 * f64::from(n)).await;
    }
    assert_eq!(service.get_session(&session.id).await.unwrap().total_turns, 4);

    let rewound = service.rewind(&session.id, &checkpoint.id).await.unwrap();
    assert_eq!(rewound.total_turns, 1);
    assert_eq!(rewound.total_cost, 0.1);
    assert_eq!(rewound.message_count, 2);
    assert_eq!(rewound.status, SessionStatus::Active);

    // The cached projection follows the rewind.
    assert_eq!(service.get_session(&session.id).await.unwrap(), rewound);

    let messages = service.list_messages(&session.id, 0, 100).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages.last().unwrap().sequence, 2);

    // Turn numbering resumes from the checkpoint.
    turn(&service, &session.id, 2, 0.2).await;
    assert_eq!(service.get_session(&session.id).await.unwrap().message_count, 4);
}

#[tokio::test]
async fn foreign_checkpoint_is_rejected() {
    let service = common::local_service();
    let a = common::create(&service, "alice").await;
    let b = common::create(&service, "alice").await;
    let theirs = service.create_checkpoint(&b.id, "b-start", None).await.unwrap();

    let err = service.rewind(&a.id, &theirs.id).await.unwrap_err();
    assert_matches!(&err, SessionError::InvalidCheckpoint { session_id, .. } if *session_id == a.id);
    assert!(err.to_string().contains(a.id.as_str()));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unknown_checkpoint_is_rejected() {
    let service = common::local_service();
    let session = common::create(&service, "alice").await;
    let err = service
        .rewind(&session.id, &keel_core::CheckpointId::new())
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::InvalidCheckpoint { .. });
}

#[tokio::test]
async fn rewind_invalidates_later_checkpoints() {
    let service = common::local_service();
    let session = common::create(&service, "alice").await;

    let first = service.create_checkpoint(&session.id, "first", None).await.unwrap();
    turn(&service, &session.id, 1, 0.1).await;
    let second = service.create_checkpoint(&session.id, "second", None).await.unwrap();

    service.rewind(&session.id, &first.id).await.unwrap();

    let listed = service.list_checkpoints(&session.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].is_valid());
    assert!(!listed[1].is_valid());

    let err = service.rewind(&session.id, &second.id).await.unwrap_err();
    assert_matches!(err, SessionError::InvalidCheckpoint { reason, .. } if reason.contains("earlier rewind"));

    // The surviving checkpoint can be reused.
    service.rewind(&session.id, &first.id).await.unwrap();
}

#[tokio::test]
async fn rewind_reactivates_interrupted_session() {
    let service = common::local_service();
    let session = common::create(&service, "alice").await;
    let checkpoint = service.create_checkpoint(&session.id, "start", None).await.unwrap();

    let token = service.interrupt_token(&session.id).await.unwrap();
    assert!(service.interrupt(&session.id).await.unwrap());
    assert!(token.is_cancelled());
    service
        .apply_agent_event(AgentEvent::Done {
            session_id: session.id.clone(),
            total_cost: None,
            interrupted: false,
        })
        .await
        .unwrap();
    assert_eq!(
        service.get_session(&session.id).await.unwrap().status,
        SessionStatus::Interrupted
    );

    let rewound = service.rewind(&session.id, &checkpoint.id).await.unwrap();
    assert_eq!(rewound.status, SessionStatus::Active);
    assert!(!service.is_interrupted(&session.id).await);
    assert_eq!(service.pending_interrupts(), 0);
}

#[tokio::test]
async fn rewind_keeps_completed_session_completed() {
    let service = common::local_service();
    let session = common::create(&service, "alice").await;
    let checkpoint = service.create_checkpoint(&session.id, "start", None).await.unwrap();
    turn(&service, &session.id, 1, 0.3).await;
    service
        .apply_agent_event(AgentEvent::Done {
            session_id: session.id.clone(),
            total_cost: Some(0.3),
            interrupted: false,
        })
        .await
        .unwrap();

    let rewound = service.rewind(&session.id, &checkpoint.id).await.unwrap();
    assert_eq!(rewound.status, SessionStatus::Completed);
    assert_eq!(rewound.total_turns, 0);
}

#[tokio::test]
async fn checkpoint_preconditions() {
    let service = common::local_service();
    let session = common::create(&service, "alice").await;

    let err = service.create_checkpoint(&session.id, "  ", None).await.unwrap_err();
    assert_matches!(err, SessionError::InvalidConfiguration(_));

    let err = service
        .create_checkpoint(&SessionId::from_raw("missing"), "x", None)
        .await
        .unwrap_err();
    assert_matches!(err, SessionError::NotFound { .. });

    service
        .apply_agent_event(AgentEvent::Error {
            session_id: session.id.clone(),
            message: "model overloaded".into(),
        })
        .await
        .unwrap();
    let err = service.create_checkpoint(&session.id, "late", None).await.unwrap_err();
    assert_matches!(err, SessionError::InvalidConfiguration(m) if m.contains("active"));
}

#[tokio::test]
async fn rewind_waits_for_session_lock() {
    let mut settings = common::settings();
    settings.lock.timeout_ms = 100;
    let cache = Arc::new(MemoryCache::new());
    let service = SessionService::new(common::repo(), Some(cache.clone() as Arc<dyn CacheStore>), &settings);
    let session = common::create(&service, "alice").await;
    let checkpoint = service.create_checkpoint(&session.id, "start", None).await.unwrap();
    turn(&service, &session.id, 1, 0.2).await;

    let key = CacheKeys::default().lock(&session.id);
    let token = cache
        .acquire_lock(&key, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("lock is free");

    let err = service.rewind(&session.id, &checkpoint.id).await.unwrap_err();
    assert_matches!(err, SessionError::LockTimeout { .. });
    assert_eq!(service.get_session(&session.id).await.unwrap().total_turns, 1);

    assert!(cache.release_lock(&key, &token).await.unwrap());
    let rewound = service.rewind(&session.id, &checkpoint.id).await.unwrap();
    assert_eq!(rewound.total_turns, 0);
}
