use std::collections::HashSet;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use marketchat::api::ConversationSummary;
use marketchat::notification::MessageNotification;
use marketchat::{
    ChatApi, ChatConfig, ChatError, ChatInvite, ChatSession, ConnectionState, ConversationKey, ConversationUpdate,
    ErrorCode, HttpChatApi, LocalUser, PresenceUpdate,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Chat(#[from] ChatError),
    #[error("io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("timed out waiting for the chat channel")]
    ConnectTimeout,
    #[error("chat channel disabled after repeated connect failures")]
    ChannelDisabled,
}

#[derive(Parser, Debug)]
#[command(name = "marketchat", about = "Marketplace chat client")]
struct Cli {
    #[arg(long, env = "MARKETCHAT_SERVER_URL")]
    server_url: Option<String>,

    #[arg(long, env = "MARKETCHAT_API_BASE_URL")]
    api_url: Option<String>,

    #[arg(long, env = "MARKETCHAT_API_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "MARKETCHAT_USER_ID")]
    user_id: String,

    #[arg(long, env = "MARKETCHAT_USER_NAME", default_value = "")]
    user_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream invites, messages, and notifications until interrupted.
    Watch(WatchArgs),
    /// Chat with one counterpart; each stdin line is sent as a message.
    Chat(ChatArgs),
    /// Ask whether a user is online.
    Online { user_id: String },
    /// List conversation summaries over REST.
    Conversations,
    /// Print one page of message history over REST.
    History(HistoryArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Product rooms to join.
    #[arg(long = "product")]
    products: Vec<String>,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long)]
    product: String,

    #[arg(long)]
    to: String,

    #[arg(long, default_value = "")]
    to_name: String,

    #[arg(long, default_value_t = 50)]
    history: u32,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    #[arg(long)]
    product: String,

    #[arg(long)]
    with: String,

    #[arg(long, default_value_t = 1)]
    page: u32,

    #[arg(long, default_value_t = 50)]
    limit: u32,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let user = LocalUser { id: cli.user_id.clone(), name: cli.user_name.clone() };

    let result = match cli.command {
        Command::Watch(args) => run_watch(config, user, args).await,
        Command::Chat(args) => run_chat(config, user, args).await,
        Command::Online { user_id } => run_online(config, user, &user_id).await,
        Command::Conversations => run_conversations(&config).await,
        Command::History(args) => run_history(&config, args).await,
    };

    if let Err(CliError::Chat(e)) = &result {
        tracing::error!(code = e.error_code(), retryable = e.retryable(), "{e}");
    }
    result
}

fn build_config(cli: &Cli) -> Result<ChatConfig, CliError> {
    let mut config = ChatConfig::from_env()?;
    if let Some(url) = &cli.server_url {
        config.server_url.clone_from(url);
    }
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.trim_end_matches('/').to_owned();
    }
    if cli.token.is_some() {
        config.api_token.clone_from(&cli.token);
    }
    config.validate()?;
    Ok(config)
}

async fn connect(config: ChatConfig, user: LocalUser) -> Result<ChatSession, CliError> {
    let session = ChatSession::from_config(config, user)?;
    session.start();

    let mut state = session.connection().subscribe_state();
    let reached = tokio::time::timeout(
        Duration::from_secs(30),
        state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disabled)),
    )
    .await
    .map_err(|_| CliError::ConnectTimeout)?
    .map(|s| *s);

    match reached {
        Ok(ConnectionState::Connected) => Ok(session),
        _ => {
            session.shutdown();
            Err(CliError::ChannelDisabled)
        }
    }
}

async fn run_watch(config: ChatConfig, user: LocalUser, args: WatchArgs) -> Result<(), CliError> {
    let session = connect(config, user).await?;
    for product in &args.products {
        session.conversations().join_conversation(&session.user().id, product);
    }

    let mut conversations = session.conversations().subscribe();
    let mut presence = session.presence().subscribe();
    let mut invites_seen: HashSet<ConversationKey> = HashSet::new();
    let mut notifications_seen: HashSet<String> = HashSet::new();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            update = conversations.recv() => match recv_update(update, conversation_json) {
                ControlFlow::Continue(Some(value)) => print_json(&value)?,
                ControlFlow::Continue(None) => {}
                ControlFlow::Break(()) => break,
            },
            update = presence.recv() => match recv_update(update, presence_json) {
                ControlFlow::Continue(Some(value)) => print_json(&value)?,
                ControlFlow::Continue(None) => {}
                ControlFlow::Break(()) => break,
            },
            _ = tick.tick() => {
                let invites = session.pending_invites();
                for invite in unseen(&mut invites_seen, &invites, ChatInvite::key) {
                    print_json(&json!({"type": "invite", "invite": invite}))?;
                }

                // Newest first in the dispatcher; print oldest first.
                let mut notifications = session.notifications().notifications();
                notifications.reverse();
                for notification in unseen(&mut notifications_seen, &notifications, |n: &MessageNotification| n.id.clone()) {
                    print_json(&json!({
                        "type": "notification",
                        "id": notification.id,
                        "message": notification.message,
                        "unread": session.notifications().unread_count(),
                    }))?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    print_json(&json!({"type": "unread", "count": session.notifications().unread_count()}))?;
    session.shutdown();
    Ok(())
}

async fn run_chat(config: ChatConfig, user: LocalUser, args: ChatArgs) -> Result<(), CliError> {
    let session = connect(config, user).await?;
    let context = session.open_conversation(&args.product, &args.to, &args.to_name);
    if args.history > 0 {
        session.load_history(&context.product_id, &context.counterpart_id, 1, args.history).await?;
    }
    for message in session.messages(&context.key()) {
        print_json(&serde_json::to_value(&message)?)?;
    }

    let mut updates = session.conversations().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let body = line.trim();
                if body.is_empty() {
                    continue;
                }
                let outcome = session.send_message(&context.counterpart_id, body, &context.product_id).await?;
                tracing::debug!(?outcome, "sent");
            }
            update = updates.recv() => {
                if let Ok(ConversationUpdate::SendFailed { key, client_ref, .. }) = &update {
                    session.conversations().discard_pending(key, client_ref);
                }
                match recv_update(update, conversation_json) {
                    ControlFlow::Continue(Some(value)) => print_json(&value)?,
                    ControlFlow::Continue(None) => {}
                    ControlFlow::Break(()) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close_conversation();
    session.shutdown();
    Ok(())
}

async fn run_online(config: ChatConfig, user: LocalUser, user_id: &str) -> Result<(), CliError> {
    let session = connect(config, user).await?;
    let status = session.check_online(user_id).await;
    print_json(&json!({"userId": user_id, "status": format!("{status:?}").to_lowercase()}))?;
    session.shutdown();
    Ok(())
}

async fn run_conversations(config: &ChatConfig) -> Result<(), CliError> {
    let api = api(config)?;
    let summaries: Vec<ConversationSummary> = api.conversations().await?;
    let total: u64 = summaries.iter().map(|s| s.unread_count).sum();
    print_json(&json!({"conversations": summaries, "unreadTotal": total}))
}

async fn run_history(config: &ChatConfig, args: HistoryArgs) -> Result<(), CliError> {
    let api = api(config)?;
    let page = api.message_history(&args.product, &args.with, args.page, args.limit).await?;
    print_json(&serde_json::to_value(&page)?)
}

fn api(config: &ChatConfig) -> Result<Arc<dyn ChatApi>, CliError> {
    Ok(Arc::new(HttpChatApi::new(&config.api_base_url, config.api_token.clone())?))
}

/// Items of `current` not yet printed. Keys that left `current` are
/// forgotten, so an item that reappears later prints again.
fn unseen<'a, T, K, F>(seen: &mut HashSet<K>, current: &'a [T], key: F) -> Vec<&'a T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let fresh: Vec<&T> = current.iter().filter(|item| seen.insert(key(*item))).collect();
    let live: HashSet<K> = current.iter().map(&key).collect();
    seen.retain(|k| live.contains(k));
    fresh
}

/// Render one broadcast item. Breaks once the sender is gone.
fn recv_update<T>(
    update: Result<T, broadcast::error::RecvError>,
    render: fn(T) -> Value,
) -> ControlFlow<(), Option<Value>> {
    match update {
        Ok(update) => ControlFlow::Continue(Some(render(update))),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "output fell behind");
            ControlFlow::Continue(None)
        }
        Err(broadcast::error::RecvError::Closed) => ControlFlow::Break(()),
    }
}

fn conversation_json(update: ConversationUpdate) -> Value {
    match update {
        ConversationUpdate::Joined { product_id } => json!({"type": "joined", "productId": product_id}),
        ConversationUpdate::Left { product_id } => json!({"type": "left", "productId": product_id}),
        ConversationUpdate::MessageAdded { message, .. } => json!({"type": "message", "message": message}),
        ConversationUpdate::MessageConfirmed { client_ref, message, .. } => {
            json!({"type": "delivered", "clientRef": client_ref, "message": message})
        }
        ConversationUpdate::SendFailed { key, client_ref, error } => json!({
            "type": "failed",
            "conversation": key.to_string(),
            "clientRef": client_ref,
            "error": error,
        }),
        ConversationUpdate::MessagesRead { key, message_ids } => json!({
            "type": "read",
            "conversation": key.to_string(),
            "messageIds": message_ids,
        }),
    }
}

fn presence_json(update: PresenceUpdate) -> Value {
    match update {
        PresenceUpdate::Typing { product_id, user_id, is_typing } => {
            json!({"type": "typing", "productId": product_id, "userId": user_id, "isTyping": is_typing})
        }
        PresenceUpdate::Online { user_id, is_online } => {
            json!({"type": "online", "userId": user_id, "isOnline": is_online})
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
