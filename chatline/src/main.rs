//! `chatline` — scripted walkthrough of a message stream view.
//!
//! Seeds an in-memory channel with history, opens a view on it, and then
//! pages, sends and receives live messages while printing the view after
//! each step. Configuration via CLI flags, environment variables, or
//! config file (`~/.config/chatline/config.toml`).
//!
//! ```bash
//! cargo run --bin chatline -- --page-size 10 --seed-messages 30
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use chatline::backend::memory::InMemoryBackend;
use chatline::bus::{EventBus, EventKind, StreamEvent};
use chatline::config::{CliArgs, ClientConfig};
use chatline::stream::{MessageStream, StreamView};
use chatline_proto::live::LiveEvent;
use chatline_proto::message::{
    ChannelId, Message, MessageDraft, MessageStatus, Payload, Timestamp, UserId,
};
use chatline_proto::page::StartingPoint;

const MINUTE_MS: u64 = 60 * 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(channel = %config.channel_id, user = %config.user_id, "chatline starting");

    let channel = ChannelId::new(config.channel_id.clone());
    let me = UserId::new(config.user_id.clone());
    let bob = UserId::new("bob");

    let backend = InMemoryBackend::new(channel.clone(), me.clone());
    seed_history(&backend, &[&me, &bob], config.seed_messages);

    let bus = EventBus::new();
    let _typing = bus.subscribe(EventKind::TypingStatusChanged, |event| {
        if let StreamEvent::TypingStatusChanged { typing } = event {
            let names: Vec<_> = typing.iter().map(ToString::to_string).collect();
            println!("  [typing] {}", names.join(", "));
        }
    });
    let _badge = bus.subscribe(EventKind::NewMessageCountChanged, |event| {
        if let StreamEvent::NewMessageCountChanged { count } = event {
            println!("  [badge] {count} new");
        }
    });

    let stream = Arc::new(
        MessageStream::builder(backend, channel, me)
            .config(&config.stream)
            .bus(bus)
            .build(),
    );
    let (live_tx, live_rx) = mpsc::channel(config.stream.event_buffer);
    let pump = stream.spawn_event_pump(live_rx);

    stream.reset_with_starting_point(StartingPoint::Latest).await?;
    print_view("latest window", &stream.view(), &config.timestamp_format);

    stream.prev().await?;
    print_view("after loading older history", &stream.view(), &config.timestamp_format);

    stream
        .send_message(MessageDraft::text("hello from chatline"))
        .await?;

    stream.on_scrolled_away_from_bottom(true);
    live_tx
        .send(LiveEvent::TypingStatusChanged {
            typing: vec![bob.clone()],
        })
        .await?;
    for text in ["welcome back", "did you see the release notes?"] {
        let message = stream.backend().post(&bob, Payload::text(text));
        live_tx
            .send(LiveEvent::MessagesReceived(vec![message]))
            .await?;
    }
    drop(live_tx);
    pump.await?;
    print_view("scrolled away, live messages arrived", &stream.view(), &config.timestamp_format);

    stream.on_scrolled_away_from_bottom(false);
    print_view("back at the bottom", &stream.view(), &config.timestamp_format);

    tracing::info!(stale_discards = stream.stale_discards(), "chatline finished");
    Ok(())
}

/// Fill the backend with `count` messages, one per minute, ending now.
fn seed_history(backend: &InMemoryBackend, senders: &[&UserId], count: usize) {
    let now = Timestamp::now().as_millis();
    for i in 0..count {
        let minutes_ago = u64::try_from(count - i).unwrap_or(u64::MAX);
        let at = Timestamp::from_millis(now.saturating_sub(minutes_ago.saturating_mul(MINUTE_MS)));
        let sender = senders[i % senders.len()];
        backend.seed(sender, Payload::text(format!("message #{}", i + 1)), at);
    }
}

fn print_view(title: &str, view: &StreamView, timestamp_format: &str) {
    println!("== {title} ==");
    println!(
        "  {} messages | {} new | older: {} | newer: {}",
        view.messages.len(),
        view.new_message_count,
        if view.has_previous { "yes" } else { "no" },
        if view.has_next { "yes" } else { "no" },
    );
    for message in view.messages.iter() {
        println!("  {}", render(message, timestamp_format));
    }
}

fn render(message: &Message, timestamp_format: &str) -> String {
    let time = i64::try_from(message.created_at.as_millis())
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(
            || "--:--".to_string(),
            |t| t.with_timezone(&chrono::Local).format(timestamp_format).to_string(),
        );
    let body = match &message.payload {
        Payload::Text(text) => text.clone(),
        Payload::File(file) => format!("[file] {}", file.name),
    };
    let status = match &message.status {
        MessageStatus::Pending => " (sending)".to_string(),
        MessageStatus::Failed(reason) => format!(" (failed: {reason})"),
        MessageStatus::Succeeded => String::new(),
    };
    format!("[{time}] {}: {body}{status}", message.sender)
}

/// Initialize tracing to write to a log file.
///
/// Returns the [`WorkerGuard`] that must be held for the lifetime of the
/// application to ensure logs are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("chatline.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
