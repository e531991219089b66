//! Integration tests for optimistic sends, updates, resends and deletes.
//!
//! Verifies:
//! 1. A send shows a pending message immediately and swaps it for the
//!    server's message on success.
//! 2. A failed send stays visible as failed and can be resent.
//! 3. An update issued while the send is pending targets the server id.
//! 4. A failed update restores the previous content.
//! 5. Sends that resolve after a reset leave the new window untouched.
//! 6. Each step publishes the matching bus event.
//! 7. A live echo of a send that beats the send's response replaces the
//!    pending message instead of showing beside it.
//! 8. Results for a message deleted while its edit was in flight are
//!    dropped rather than bringing it back.

use std::sync::Arc;

use chatline::backend::BackendError;
use chatline::backend::memory::{BackendOp, InMemoryBackend};
use chatline::bus::{EventKind, StreamEvent};
use chatline::stream::pending::OperationState;
use chatline::stream::{MessageStream, OperationError};

use chatline_proto::live::LiveEvent;
use chatline_proto::message::{
    ChannelId, FileRef, Message, MessageDraft, MessageId, MessageKey, MessageStatus, Payload,
    Timestamp, UserId,
};
use chatline_proto::page::StartingPoint;

use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A stream showing `m1` (t=10) and `m2` (t=20) from bob, clock at 30.
async fn two_message_stream() -> Arc<MessageStream<InMemoryBackend>> {
    let backend = InMemoryBackend::new(ChannelId::new("general"), UserId::new("alice"));
    let bob = UserId::new("bob");
    backend.seed(&bob, Payload::text("first"), Timestamp::from_millis(10));
    backend.seed(&bob, Payload::text("second"), Timestamp::from_millis(20));
    backend.set_clock(Timestamp::from_millis(30));

    let stream =
        MessageStream::builder(backend, ChannelId::new("general"), UserId::new("alice")).build();
    stream
        .reset_with_starting_point(StartingPoint::Latest)
        .await
        .unwrap();
    Arc::new(stream)
}

fn keys(stream: &MessageStream<InMemoryBackend>) -> Vec<String> {
    stream.messages().iter().map(|m| m.key.to_string()).collect()
}

fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for_calls(stream: &MessageStream<InMemoryBackend>, op: BackendOp, calls: usize) {
    while stream.backend().calls(op) < calls {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pending_send_is_shown_last_then_confirmed() {
    let stream = two_message_stream().await;
    let (_sub, mut events) = stream.bus().subscribe_channel(EventKind::Any, 16);
    stream.backend().pause(BackendOp::Send);

    let sending = tokio::spawn({
        let stream = Arc::clone(&stream);
        async move { stream.send_message(MessageDraft::text("hi")).await }
    });
    wait_for_calls(&stream, BackendOp::Send, 1).await;

    let shown = stream.messages();
    assert_eq!(shown.len(), 3);
    let pending = shown[2].clone();
    assert!(pending.key.is_local());
    assert_eq!(pending.status, MessageStatus::Pending);
    assert_eq!(pending.payload, Payload::text("hi"));
    assert_eq!(
        stream.operation_state(&pending.key),
        Some(OperationState::Pending)
    );

    stream.backend().resume(BackendOp::Send);
    let sent = sending.await.unwrap().unwrap();

    assert_eq!(sent.key, MessageKey::Server(MessageId::new("m3")));
    assert_eq!(sent.created_at, Timestamp::from_millis(30));
    assert_eq!(keys(&stream), ["m1", "m2", "m3"]);
    assert_eq!(stream.messages()[2].status, MessageStatus::Succeeded);
    assert!(stream.operation_state(&pending.key).is_none());

    let MessageKey::Local(request_id) = pending.key.clone() else {
        panic!("pending message should use a local key");
    };
    assert_eq!(
        drain(&mut events),
        vec![
            StreamEvent::MessageSentPending { message: pending },
            StreamEvent::MessageSentSuccess {
                request_id,
                message: sent,
            },
        ]
    );
}

#[tokio::test]
async fn own_sends_do_not_count_as_new() {
    let stream = two_message_stream().await;
    stream.on_scrolled_away_from_bottom(true);
    stream
        .send_message(MessageDraft::text("mine"))
        .await
        .unwrap();
    assert_eq!(stream.new_message_count(), 0);
}

/// Start a paused send of "hi" and build the live echo the server will
/// push for it as `m3` at t=30.
async fn send_awaiting_response(
    stream: &Arc<MessageStream<InMemoryBackend>>,
) -> (
    tokio::task::JoinHandle<Result<Message, OperationError>>,
    Message,
    Message,
) {
    stream.backend().pause(BackendOp::Send);
    let sending = tokio::spawn({
        let stream = Arc::clone(stream);
        async move { stream.send_message(MessageDraft::text("hi")).await }
    });
    wait_for_calls(stream, BackendOp::Send, 1).await;

    let pending = stream.messages()[2].clone();
    let echo = Message {
        key: MessageKey::Server(MessageId::new("m3")),
        created_at: Timestamp::from_millis(30),
        updated_at: Timestamp::from_millis(30),
        status: MessageStatus::Succeeded,
        ..pending.clone()
    };
    (sending, pending, echo)
}

#[tokio::test]
async fn live_echo_before_response_replaces_pending_message() {
    let stream = two_message_stream().await;
    let (sending, pending, echo) = send_awaiting_response(&stream).await;
    assert!(echo.request_id.is_some());

    stream.handle_live_event(LiveEvent::MessagesReceived(vec![echo.clone()]));
    assert_eq!(keys(&stream), ["m1", "m2", "m3"]);
    assert!(stream.operation_state(&pending.key).is_none());

    stream.backend().resume(BackendOp::Send);
    let sent = sending.await.unwrap().unwrap();
    assert_eq!(sent, echo);
    assert_eq!(keys(&stream), ["m1", "m2", "m3"]);
    assert_eq!(stream.messages()[2].status, MessageStatus::Succeeded);
    assert_eq!(stream.stale_discards(), 0);
}

#[tokio::test]
async fn failed_response_after_live_echo_keeps_confirmed_message() {
    let stream = two_message_stream().await;
    let (_sub, mut failures) = stream
        .bus()
        .subscribe_channel(EventKind::MessageSendFailed, 4);
    let (sending, _pending, echo) = send_awaiting_response(&stream).await;

    stream.handle_live_event(LiveEvent::MessagesReceived(vec![echo.clone()]));
    stream
        .backend()
        .fail(BackendOp::Send, BackendError::Network("response lost".into()));
    stream.backend().resume(BackendOp::Send);

    assert!(sending.await.unwrap().is_err());
    assert_eq!(stream.messages()[2], echo);
    assert!(failures.try_recv().is_err());
    assert_eq!(stream.stale_discards(), 0);
}

#[tokio::test]
async fn failed_send_then_resend() {
    let stream = two_message_stream().await;
    let (_sub, mut events) = stream.bus().subscribe_channel(EventKind::Any, 16);
    stream
        .backend()
        .fail(BackendOp::Send, BackendError::Network("connection reset".into()));

    let err = stream
        .send_message(MessageDraft::text("retry me"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OperationError::Backend(BackendError::Network("connection reset".into()))
    );

    let failed = stream.messages()[2].clone();
    assert!(failed.key.is_local());
    assert!(failed.status.is_failed());
    let kinds: Vec<_> = drain(&mut events).iter().map(StreamEvent::kind).collect();
    assert_eq!(
        kinds,
        [EventKind::MessageSentPending, EventKind::MessageSendFailed]
    );

    assert_eq!(
        stream.resend_message(&MessageKey::Server(MessageId::new("m1"))).await,
        Err(OperationError::UnknownMessage(MessageKey::Server(
            MessageId::new("m1")
        )))
    );

    stream.backend().heal(BackendOp::Send);
    let sent = stream.resend_message(&failed.key).await.unwrap();
    assert_eq!(sent.payload, Payload::text("retry me"));
    assert_eq!(keys(&stream), ["m1", "m2", "m3"]);

    let kinds: Vec<_> = drain(&mut events).iter().map(StreamEvent::kind).collect();
    assert_eq!(
        kinds,
        [EventKind::MessageSentPending, EventKind::MessageSentSuccess]
    );
}

#[tokio::test]
async fn resend_while_pending_is_refused() {
    let stream = two_message_stream().await;
    stream.backend().pause(BackendOp::Send);

    let sending = tokio::spawn({
        let stream = Arc::clone(&stream);
        async move { stream.send_message(MessageDraft::text("hold")).await }
    });
    wait_for_calls(&stream, BackendOp::Send, 1).await;

    let key = stream.messages()[2].key.clone();
    assert_eq!(
        stream.resend_message(&key).await,
        Err(OperationError::NotRetryable(key.clone()))
    );
    assert_eq!(
        stream.delete_message(&key).await,
        Err(OperationError::InFlight(key))
    );

    stream.backend().resume(BackendOp::Send);
    sending.await.unwrap().unwrap();
}

#[tokio::test]
async fn file_and_reply_drafts_are_sent() {
    let stream = two_message_stream().await;
    let file = FileRef {
        name: "notes.pdf".into(),
        url: "https://files.example/notes.pdf".into(),
        mime_type: Some("application/pdf".into()),
        size: Some(2048),
    };

    let sent = stream
        .send_message(MessageDraft::file(file.clone()).replying_to(MessageId::new("m1")))
        .await
        .unwrap();
    assert_eq!(sent.payload, Payload::File(file));
    assert_eq!(sent.parent, Some(MessageId::new("m1")));

    let invalid = FileRef {
        name: String::new(),
        url: "https://files.example/x".into(),
        mime_type: None,
        size: None,
    };
    assert!(matches!(
        stream.send_message(MessageDraft::file(invalid)).await,
        Err(OperationError::Validation(_))
    ));
    assert_eq!(stream.messages().len(), 3);
}

#[tokio::test]
async fn send_resolving_after_reset_is_discarded() {
    let stream = two_message_stream().await;
    let (_sub, mut events) = stream
        .bus()
        .subscribe_channel(EventKind::MessageSentSuccess, 4);
    stream.backend().pause(BackendOp::Send);

    let sending = tokio::spawn({
        let stream = Arc::clone(&stream);
        async move { stream.send_message(MessageDraft::text("late")).await }
    });
    wait_for_calls(&stream, BackendOp::Send, 1).await;

    stream
        .reset_with_starting_point(StartingPoint::Latest)
        .await
        .unwrap();
    assert_eq!(keys(&stream), ["m1", "m2"]);

    stream.backend().resume(BackendOp::Send);
    let sent = sending.await.unwrap().unwrap();

    assert_eq!(keys(&stream), ["m1", "m2"]);
    assert_eq!(stream.stale_discards(), 1);
    assert!(matches!(
        events.try_recv(),
        Ok(StreamEvent::MessageSentSuccess { message, .. }) if message == sent
    ));
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_waits_for_pending_send() {
    let stream = two_message_stream().await;
    stream.backend().pause(BackendOp::Send);

    let sending = tokio::spawn({
        let stream = Arc::clone(&stream);
        async move { stream.send_message(MessageDraft::text("typo")).await }
    });
    wait_for_calls(&stream, BackendOp::Send, 1).await;
    let local = stream.messages()[2].key.clone();

    let updating = tokio::spawn({
        let stream = Arc::clone(&stream);
        let local = local.clone();
        async move { stream.update_message(&local, Payload::text("fixed")).await }
    });
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(stream.backend().calls(BackendOp::Update), 0);

    stream.backend().resume(BackendOp::Send);
    let sent = sending.await.unwrap().unwrap();
    let updated = updating.await.unwrap().unwrap();

    assert_eq!(updated.key, sent.key);
    assert_eq!(keys(&stream), ["m1", "m2", "m3"]);
    assert_eq!(stream.messages()[2].payload, Payload::text("fixed"));
    assert_eq!(stream.messages()[2].status, MessageStatus::Succeeded);
}

#[tokio::test]
async fn update_applies_optimistically_and_confirms() {
    let stream = two_message_stream().await;
    let (_sub, mut events) = stream.bus().subscribe_channel(EventKind::MessagesUpdated, 4);
    let key = MessageKey::Server(MessageId::new("m2"));
    stream.backend().pause(BackendOp::Update);

    let updating = tokio::spawn({
        let stream = Arc::clone(&stream);
        let key = key.clone();
        async move { stream.update_message(&key, Payload::text("edited")).await }
    });
    wait_for_calls(&stream, BackendOp::Update, 1).await;

    let optimistic = stream.messages()[1].clone();
    assert_eq!(optimistic.payload, Payload::text("edited"));
    assert_eq!(optimistic.status, MessageStatus::Pending);
    assert_eq!(
        stream.delete_message(&key).await,
        Err(OperationError::InFlight(key.clone()))
    );

    stream.backend().resume(BackendOp::Update);
    let updated = updating.await.unwrap().unwrap();
    assert_eq!(updated.status, MessageStatus::Succeeded);
    assert_eq!(updated.created_at, Timestamp::from_millis(20));
    assert_eq!(keys(&stream), ["m1", "m2"]);

    assert_eq!(drain(&mut events).len(), 2);
}

#[tokio::test]
async fn failed_update_restores_content() {
    let stream = two_message_stream().await;
    let (_sub, mut events) = stream
        .bus()
        .subscribe_channel(EventKind::MessageUpdateFailed, 4);
    let key = MessageKey::Server(MessageId::new("m1"));
    stream
        .backend()
        .fail(BackendOp::Update, BackendError::Rejected("too late to edit".into()));

    let err = stream
        .update_message(&key, Payload::text("rewritten"))
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::Backend(BackendError::Rejected(_))));

    let restored = stream.messages()[0].clone();
    assert_eq!(restored.payload, Payload::text("first"));
    assert!(restored.status.is_failed());
    assert!(matches!(
        events.try_recv(),
        Ok(StreamEvent::MessageUpdateFailed { message, .. }) if message == restored
    ));

    // A second failed attempt still restores the original content.
    let _ = stream.update_message(&key, Payload::text("again")).await;
    assert_eq!(stream.messages()[0].payload, Payload::text("first"));
}

#[tokio::test]
async fn live_delete_during_update_is_not_undone() {
    let stream = two_message_stream().await;
    let (_sub, mut updates) = stream.bus().subscribe_channel(EventKind::MessagesUpdated, 4);
    let key = MessageKey::Server(MessageId::new("m1"));
    stream.backend().pause(BackendOp::Update);

    let updating = tokio::spawn({
        let stream = Arc::clone(&stream);
        let key = key.clone();
        async move { stream.update_message(&key, Payload::text("new")).await }
    });
    wait_for_calls(&stream, BackendOp::Update, 1).await;
    assert!(updates.try_recv().is_ok());

    stream.handle_live_event(LiveEvent::MessagesDeleted(vec![MessageId::new("m1")]));
    assert_eq!(keys(&stream), ["m2"]);

    stream.backend().resume(BackendOp::Update);
    let updated = updating.await.unwrap().unwrap();
    assert_eq!(updated.payload, Payload::text("new"));

    assert_eq!(keys(&stream), ["m2"]);
    assert!(updates.try_recv().is_err());
    assert!(stream.operation_state(&key).is_none());
    assert_eq!(stream.stale_discards(), 0);
}

#[tokio::test]
async fn failed_update_of_deleted_message_is_dropped() {
    let stream = two_message_stream().await;
    let (_sub, mut failures) = stream
        .bus()
        .subscribe_channel(EventKind::MessageUpdateFailed, 4);
    let key = MessageKey::Server(MessageId::new("m1"));
    stream.backend().pause(BackendOp::Update);

    let updating = tokio::spawn({
        let stream = Arc::clone(&stream);
        let key = key.clone();
        async move { stream.update_message(&key, Payload::text("new")).await }
    });
    wait_for_calls(&stream, BackendOp::Update, 1).await;

    stream.handle_live_event(LiveEvent::MessagesDeleted(vec![MessageId::new("m1")]));
    stream
        .backend()
        .fail(BackendOp::Update, BackendError::Rejected("gone".into()));
    stream.backend().resume(BackendOp::Update);

    assert!(matches!(
        updating.await.unwrap(),
        Err(OperationError::Backend(BackendError::Rejected(_)))
    ));
    assert_eq!(keys(&stream), ["m2"]);
    assert!(failures.try_recv().is_err());
    assert!(stream.operation_state(&key).is_none());
    assert_eq!(stream.stale_discards(), 0);
}

#[tokio::test]
async fn before_update_hook_rewrites_payload() {
    let backend = InMemoryBackend::new(ChannelId::new("general"), UserId::new("alice"));
    backend.seed(
        &UserId::new("alice"),
        Payload::text("draft"),
        Timestamp::from_millis(10),
    );
    let stream = MessageStream::builder(backend, ChannelId::new("general"), UserId::new("alice"))
        .before_update(|payload| match payload {
            Payload::Text(text) => Payload::text(format!("{text} (edited)")),
            other => other,
        })
        .build();
    stream
        .reset_with_starting_point(StartingPoint::Latest)
        .await
        .unwrap();

    let updated = stream
        .update_message(&MessageKey::Server(MessageId::new("m1")), Payload::text("final"))
        .await
        .unwrap();
    assert_eq!(updated.payload, Payload::text("final (edited)"));
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_server_message() {
    let stream = two_message_stream().await;
    let (_sub, mut events) = stream.bus().subscribe_channel(EventKind::MessagesDeleted, 4);
    let key = MessageKey::Server(MessageId::new("m1"));

    stream.delete_message(&key).await.unwrap();

    assert_eq!(keys(&stream), ["m2"]);
    assert_eq!(stream.backend().messages().len(), 1);
    assert_eq!(
        events.try_recv().ok(),
        Some(StreamEvent::MessagesDeleted { keys: vec![key] })
    );
}

#[tokio::test]
async fn delete_by_temporary_key_after_confirmation() {
    let stream = two_message_stream().await;
    let (_sub, mut events) = stream.bus().subscribe_channel(EventKind::MessageSentPending, 4);
    let sent = stream
        .send_message(MessageDraft::text("oops"))
        .await
        .unwrap();
    let Ok(StreamEvent::MessageSentPending { message }) = events.try_recv() else {
        panic!("expected a pending event");
    };

    stream.delete_message(&message.key).await.unwrap();
    assert!(!stream.messages().iter().any(|m| m.key == sent.key));
    assert_eq!(stream.backend().calls(BackendOp::Delete), 1);
}

#[tokio::test]
async fn delete_unknown_message_is_rejected() {
    let stream = two_message_stream().await;
    let key = MessageKey::Server(MessageId::new("m99"));
    assert_eq!(
        stream.delete_message(&key).await,
        Err(OperationError::UnknownMessage(key))
    );
    assert_eq!(stream.backend().calls(BackendOp::Delete), 0);
}
