use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chatterbox_sync::config::{load_config, load_config_from, SyncConfig};
use chatterbox_sync::store::paths;
use chatterbox_sync::sync::{LifecycleEvent, NotificationFanout, PushPayload, PushTransport};
use chatterbox_sync::utils;
use chatterbox_sync::{
    ChatClient, ChatSummary, ChatType, InMemoryStore, LocalUser, Message, PresenceView, Session,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatterbox-sync: plays a scripted two-user conversation through the sync engine.",
    long_about = "Runs two chat clients against an in-process store and prints what each side sees:\n\
    optimistic sends, typing indicators, presence, read status and the chat list."
)]
struct Args {
    /// Write logs to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Sync config file (JSON); defaults to the user config directory
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

// Prints each payload instead of contacting a push service
struct ConsoleTransport;

#[async_trait]
impl PushTransport for ConsoleTransport {
    async fn send(&self, token: &str, payload: &PushPayload) -> Result<()> {
        println!(
            "  push -> {}: {} sent a message in {} ({:?})",
            token, payload.sender_name, payload.chat_id, payload.chat_type
        );
        Ok(())
    }
}

fn print_timeline(heading: &str, messages: &[Message]) {
    println!("{}:", heading);
    for m in messages {
        println!("  [{:?}] {}: {} ({})", m.status, m.sender_id, m.text, m.id);
    }
}

fn client_for(store: &Arc<InMemoryStore>, config: &SyncConfig, uid: &str, name: &str) -> ChatClient {
    let session = Session::new(store.clone())
        .with_config(config.clone())
        .with_user(LocalUser::new(uid, name))
        .into_shared();
    ChatClient::new(session)
}

async fn pause(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level: LevelFilter = args
        .log_level
        .parse()
        .map_err(|_| anyhow!("Unknown log level: {}", args.log_level))?;
    let log_file = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_file, level)?;

    let config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config().unwrap_or_else(|e| {
            warn!("Could not load config, using defaults: {}", e);
            SyncConfig::default()
        }),
    };
    info!("Using sync config: {:?}", config);

    let store = Arc::new(InMemoryStore::with_system_clock());
    let chat_id = "demo-chat";
    let chat = ChatSummary {
        id: chat_id.to_string(),
        chat_type: ChatType::Direct,
        name: None,
        participants: vec!["alice".to_string(), "bob".to_string()],
        last_message: None,
        last_message_time: None,
        updated_at: chrono::Utc::now(),
    };
    store.put(paths::CHATS, chat_id, chat.to_fields()?);

    let alice = client_for(&store, &config, "alice", "Alice");
    let bob = client_for(&store, &config, "bob", "Bob");

    let _alice_feed = alice.messages.open(chat_id);
    let _bob_feed = bob.messages.open(chat_id);

    let _typing = bob.typing.subscribe(chat_id, |update| match update {
        Ok(peers) if peers.is_empty() => println!("bob sees: nobody typing"),
        Ok(peers) => println!("bob sees: {} typing", peers[0].user_name),
        Err(e) => println!("bob's typing feed failed: {}", e),
    });
    let _presence = bob.presence.observe("alice", |update| match update {
        Ok(PresenceView::Known(record)) => println!("bob sees alice {:?}", record.status),
        Ok(PresenceView::Unknown) => println!("bob sees alice: presence unknown"),
        Err(e) => println!("bob's presence feed failed: {}", e),
    });
    let _chats = bob.chats.subscribe("bob", |update| {
        if let Ok(list) = update {
            for summary in list {
                println!(
                    "bob's chat list: {} \"{}\"",
                    summary.id,
                    summary.last_message.unwrap_or_default()
                );
            }
        }
    });

    alice.presence.on_lifecycle(LifecycleEvent::Foreground).await?;
    pause(50).await;

    alice.typing.set_typing(chat_id, true).await;
    pause(config.typing_start_delay_ms + 200).await;

    let temp_id = alice.messages.submit(chat_id, "Hello Bob!", "alice").await?;
    print_timeline("alice right after sending", &alice.messages.timeline(chat_id).await);
    alice.typing.set_typing(chat_id, false).await;
    pause(300).await;

    bob.messages.mark_delivered(chat_id, "bob").await?;
    bob.messages.mark_read(chat_id, "bob").await?;
    pause(100).await;
    print_timeline("alice after bob read it", &alice.messages.timeline(chat_id).await);
    info!("Demo message {} round-tripped", temp_id);

    let fanout = NotificationFanout::new(bob.session().clone(), Arc::new(ConsoleTransport));
    fanout.register_token("bob-device-token").await?;
    let timeline = alice.messages.timeline(chat_id).await;
    if let Some(sent) = timeline.iter().rev().find(|m| !m.is_pending()) {
        let sender = NotificationFanout::new(alice.session().clone(), Arc::new(ConsoleTransport));
        let report = sender.dispatch_for(chat_id, &sent.id).await?;
        println!("fan-out delivered to {:?}", report.delivered);
    }

    alice.presence.on_lifecycle(LifecycleEvent::Background).await?;
    pause(100).await;
    Ok(())
}
