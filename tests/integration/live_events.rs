//! Integration tests for live-event handling and the new-message counter.
//!
//! Verifies:
//! 1. Received messages count as new only when they are confirmed, from
//!    someone else, newly inserted, and the viewer is away from the bottom
//!    or the count predicate holds.
//! 2. The scroll flag and predicate are read when the event is processed,
//!    not when it was queued.
//! 3. Redelivered events do not duplicate messages or counts.
//! 4. Updates, deletions, channel deletion and typing changes reach the
//!    collection and the bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chatline::backend::memory::InMemoryBackend;
use chatline::bus::{EventKind, StreamEvent};
use chatline::stream::MessageStream;

use chatline_proto::live::LiveEvent;
use chatline_proto::message::{
    ChannelId, Message, MessageDraft, MessageId, MessageKey, MessageStatus, Payload, RequestId,
    Timestamp, UserId,
};
use chatline_proto::page::StartingPoint;

use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn backend() -> InMemoryBackend {
    InMemoryBackend::new(ChannelId::new("general"), UserId::new("alice"))
}

async fn open(stream: MessageStream<InMemoryBackend>) -> Arc<MessageStream<InMemoryBackend>> {
    stream
        .reset_with_starting_point(StartingPoint::Latest)
        .await
        .unwrap();
    Arc::new(stream)
}

async fn plain_stream() -> Arc<MessageStream<InMemoryBackend>> {
    open(MessageStream::builder(backend(), ChannelId::new("general"), UserId::new("alice")).build())
        .await
}

fn live(id: &str, from: &str, millis: u64) -> Message {
    Message {
        key: MessageKey::Server(MessageId::new(id)),
        channel_id: ChannelId::new("general"),
        sender: UserId::new(from),
        payload: Payload::text(format!("{id} from {from}")),
        created_at: Timestamp::from_millis(millis),
        updated_at: Timestamp::from_millis(millis),
        status: MessageStatus::Succeeded,
        parent: None,
        request_id: None,
    }
}

fn received(messages: Vec<Message>) -> LiveEvent {
    LiveEvent::MessagesReceived(messages)
}

// ---------------------------------------------------------------------------
// New-message counting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn counted_only_when_scrolled_away() {
    let stream = plain_stream().await;

    stream.handle_live_event(received(vec![live("m1", "bob", 10)]));
    assert_eq!(stream.new_message_count(), 0);

    stream.on_scrolled_away_from_bottom(true);
    stream.handle_live_event(received(vec![live("m2", "bob", 20), live("m3", "carol", 30)]));
    assert_eq!(stream.new_message_count(), 2);
    assert_eq!(stream.messages().len(), 3);
}

#[tokio::test]
async fn uncountable_messages_are_skipped() {
    let stream = plain_stream().await;
    stream.on_scrolled_away_from_bottom(true);

    let own = live("m1", "alice", 10);
    let mut pending = live("m2", "bob", 20);
    pending.status = MessageStatus::Pending;
    let mut failed = live("m3", "bob", 30);
    failed.status = MessageStatus::Failed("rejected".into());
    let mut local = live("ignored", "bob", 40);
    local.key = MessageKey::Local(RequestId::new());

    stream.handle_live_event(received(vec![own, pending, failed, local]));
    assert_eq!(stream.messages().len(), 4);
    assert_eq!(stream.new_message_count(), 0);
}

#[tokio::test]
async fn redelivery_is_idempotent() {
    let stream = plain_stream().await;
    stream.on_scrolled_away_from_bottom(true);

    let batch = vec![live("m1", "bob", 10), live("m2", "bob", 20)];
    for _ in 0..3 {
        stream.handle_live_event(received(batch.clone()));
    }

    let keys: Vec<_> = stream.messages().iter().map(|m| m.key.to_string()).collect();
    assert_eq!(keys, ["m1", "m2"]);
    assert_eq!(stream.new_message_count(), 2);
}

#[tokio::test]
async fn predicate_counts_while_at_bottom() {
    let counting = Arc::new(AtomicBool::new(true));
    let stream = open(
        MessageStream::builder(backend(), ChannelId::new("general"), UserId::new("alice"))
            .should_count_new_messages({
                let counting = Arc::clone(&counting);
                move || counting.load(Ordering::SeqCst)
            })
            .build(),
    )
    .await;

    stream.handle_live_event(received(vec![live("m1", "bob", 10)]));
    assert_eq!(stream.new_message_count(), 1);

    counting.store(false, Ordering::SeqCst);
    stream.handle_live_event(received(vec![live("m2", "bob", 20)]));
    assert_eq!(stream.new_message_count(), 1);

    stream.on_scrolled_away_from_bottom(true);
    stream.handle_live_event(received(vec![live("m3", "bob", 30)]));
    assert_eq!(stream.new_message_count(), 2);
}

#[tokio::test]
async fn scroll_flag_is_read_when_event_is_processed() {
    let stream = plain_stream().await;
    let (tx, rx) = mpsc::channel(8);

    // Queued while at the bottom, processed after scrolling away.
    tx.send(received(vec![live("m1", "bob", 10)])).await.unwrap();
    stream.on_scrolled_away_from_bottom(true);
    drop(tx);
    stream.spawn_event_pump(rx).await.unwrap();
    assert_eq!(stream.new_message_count(), 1);

    // Queued while away, processed after returning to the bottom.
    let (tx, rx) = mpsc::channel(8);
    tx.send(received(vec![live("m2", "bob", 20)])).await.unwrap();
    stream.on_scrolled_away_from_bottom(false);
    drop(tx);
    stream.spawn_event_pump(rx).await.unwrap();
    assert_eq!(stream.new_message_count(), 0);
    assert_eq!(stream.messages().len(), 2);
}

#[tokio::test]
async fn count_changes_are_published() {
    let stream = plain_stream().await;
    let (_sub, mut rx) = stream
        .bus()
        .subscribe_channel(EventKind::NewMessageCountChanged, 8);

    stream.on_scrolled_away_from_bottom(true);
    stream.handle_live_event(received(vec![live("m1", "bob", 10)]));
    stream.handle_live_event(received(vec![live("m2", "bob", 20)]));
    stream.handle_live_event(received(vec![live("m2", "bob", 20)]));
    stream.on_scrolled_away_from_bottom(false);

    let counts: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|event| match event {
            StreamEvent::NewMessageCountChanged { count } => count,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(counts, [1, 2, 0]);
    assert_eq!(stream.view().new_message_count, 0);
}

// ---------------------------------------------------------------------------
// Merging with history and local sends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_messages_interleave_with_history() {
    let backend = backend();
    for i in 1..=4 {
        backend.seed(
            &UserId::new("bob"),
            Payload::text(format!("history {i}")),
            Timestamp::from_millis(i * 10),
        );
    }
    let stream =
        open(MessageStream::builder(backend, ChannelId::new("general"), UserId::new("alice")).build())
            .await;

    stream.handle_live_event(received(vec![live("x1", "carol", 25), live("x2", "carol", 50)]));

    let keys: Vec<_> = stream.messages().iter().map(|m| m.key.to_string()).collect();
    assert_eq!(keys, ["m1", "m2", "x1", "m3", "m4", "x2"]);
}

#[tokio::test]
async fn echo_of_own_send_does_not_duplicate() {
    let stream = plain_stream().await;
    let sent = stream
        .send_message(MessageDraft::text("hello"))
        .await
        .unwrap();

    stream.on_scrolled_away_from_bottom(true);
    stream.handle_live_event(received(vec![sent.clone()]));

    assert_eq!(stream.messages().len(), 1);
    assert_eq!(stream.messages()[0], sent);
    assert_eq!(stream.new_message_count(), 0);
}

// ---------------------------------------------------------------------------
// Updates, deletions, channel and typing events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn updates_replace_in_place() {
    let stream = plain_stream().await;
    let (_sub, mut rx) = stream.bus().subscribe_channel(EventKind::MessagesUpdated, 8);
    stream.handle_live_event(received(vec![live("m1", "bob", 10), live("m2", "bob", 20)]));

    let mut edited = live("m1", "bob", 10);
    edited.payload = Payload::text("edited");
    edited.updated_at = Timestamp::from_millis(99);
    stream.handle_live_event(LiveEvent::MessagesUpdated(vec![
        edited.clone(),
        live("m7", "bob", 70),
    ]));

    let messages = stream.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], edited);
    assert_eq!(
        rx.try_recv().ok(),
        Some(StreamEvent::MessagesUpdated {
            messages: vec![edited]
        })
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn deletions_remove_messages() {
    let stream = plain_stream().await;
    stream.handle_live_event(received(vec![live("m1", "bob", 10), live("m2", "bob", 20)]));
    stream.handle_live_event(LiveEvent::MessagesDeleted(vec![MessageId::new("m2")]));

    let keys: Vec<_> = stream.messages().iter().map(|m| m.key.to_string()).collect();
    assert_eq!(keys, ["m1"]);
}

#[tokio::test]
async fn channel_deletion_flags_view_and_keeps_stream_usable() {
    let stream = plain_stream().await;
    let (_sub, mut rx) = stream.bus().subscribe_channel(EventKind::ChannelDeleted, 4);

    stream.handle_live_event(LiveEvent::ChannelDeleted(ChannelId::new("general")));
    assert!(stream.view().channel_deleted);
    assert_eq!(
        rx.try_recv().ok(),
        Some(StreamEvent::ChannelDeleted {
            channel_id: ChannelId::new("general")
        })
    );

    stream.handle_live_event(received(vec![live("m1", "bob", 10)]));
    assert_eq!(stream.messages().len(), 1);
}

#[tokio::test]
async fn typing_changes_are_forwarded() {
    let stream = plain_stream().await;
    let (_sub, mut rx) = stream
        .bus()
        .subscribe_channel(EventKind::TypingStatusChanged, 4);

    stream.handle_live_event(LiveEvent::TypingStatusChanged {
        typing: vec![UserId::new("bob"), UserId::new("carol")],
    });

    assert_eq!(
        rx.try_recv().ok(),
        Some(StreamEvent::TypingStatusChanged {
            typing: vec![UserId::new("bob"), UserId::new("carol")]
        })
    );
    assert!(stream.messages().is_empty());
}
