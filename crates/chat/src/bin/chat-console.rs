//! Terminal chat client
//!
//! Tails one ticket's conversation and sends every stdin line as a message.
//!
//! Usage: `chat-console <ticket-id>`
//!
//! Reads `CHAT_ACCESS_TOKEN` plus the `CHAT_*` settings from the environment
//! (or `.env`). `CHAT_USER_ID`, `CHAT_USER_NAME` and `CHAT_USER_ROLE`
//! describe the local user for optimistic messages.

use std::collections::HashSet;
use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use helpmate_chat::history::HistoryClient;
use helpmate_chat::realtime::{ChannelRegistry, ConnectionState, WsConnector};
use helpmate_chat::sync::{spawn_session, ChatView, SessionNotice};
use helpmate_chat::{telemetry, Config, SystemClock};
use helpmate_shared::{Author, Message, MessageId, TicketId, UserId, UserRole};
use time::macros::format_description;
use time::UtcOffset;
use tokio::io::{AsyncBufReadExt, BufReader};

const CHANNEL: &str = "chat";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let ticket_id = env::args()
        .nth(1)
        .map(TicketId)
        .context("usage: chat-console <ticket-id>")?;

    let config = Config::from_env()?;
    let credential = config.credential()?.to_string();
    let me = local_author()?;

    let registry = ChannelRegistry::new(
        Arc::new(WsConnector::new(config.ws_url.clone())),
        config.reconnect_policy(),
    );
    let channel = registry.connect(CHANNEL, &credential).await;
    let history = HistoryClient::new(config.api_url.clone(), credential.clone())?;

    let session = spawn_session(
        channel,
        Arc::new(history),
        me,
        config.session_config(),
        Arc::new(SystemClock),
    );
    session.open_ticket(ticket_id.clone())?;
    println!("Ticket {} - type a message and press Enter, /quit to leave", ticket_id);

    let printer = tokio::spawn(print_updates(session.watch_view(), session.notices()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line == "/quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        session.keystroke()?;
        if let Err(e) = session.send_message(line, None).await {
            println!("! not sent: {}", e);
        }
    }

    session.shutdown().await;
    registry.disconnect_all().await;
    printer.abort();
    Ok(())
}

fn local_author() -> Result<Author> {
    let role = match env::var("CHAT_USER_ROLE") {
        Ok(raw) => serde_json::from_value::<UserRole>(serde_json::Value::String(raw.to_uppercase()))
            .with_context(|| format!("invalid CHAT_USER_ROLE: {}", raw))?,
        Err(_) => UserRole::Client,
    };
    Ok(Author {
        id: UserId(env::var("CHAT_USER_ID").unwrap_or_else(|_| "me".to_string())),
        first_name: env::var("CHAT_USER_NAME").unwrap_or_else(|_| "You".to_string()),
        last_name: String::new(),
        avatar: None,
        role,
    })
}

async fn print_updates(
    mut view: tokio::sync::watch::Receiver<ChatView>,
    mut notices: tokio::sync::broadcast::Receiver<SessionNotice>,
) {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let mut printed: HashSet<MessageId> = HashSet::new();
    let mut connection = ConnectionState::Disconnected;

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = view.borrow_and_update().clone();
                if current.connection != connection {
                    connection = current.connection.clone();
                    println!("* {}", describe(&connection));
                }
                for message in current.messages.iter().filter(|m| !m.is_pending()) {
                    if printed.insert(message.id.clone()) {
                        print_message(message, offset);
                    }
                }
            }
            notice = notices.recv() => match notice {
                Ok(SessionNotice::Incoming(_)) => print!("\x07"),
                Ok(SessionNotice::Offline(reason)) => println!("* offline: {:?}", reason),
                Ok(SessionNotice::ServiceError(message)) => println!("* service error: {}", message),
                Ok(SessionNotice::HistoryFailed(e)) => println!("* history unavailable: {}", e),
                Ok(SessionNotice::SendsAbandoned(sends)) => {
                    println!("* {} unconfirmed message(s) dropped after reconnect", sends.len())
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

fn print_message(message: &Message, offset: UtcOffset) {
    let format = format_description!("[hour]:[minute]");
    let stamp = message
        .created_at
        .to_offset(offset)
        .format(&format)
        .unwrap_or_default();
    let read = if message.is_read() { " ✓✓" } else { "" };
    println!("[{}] {}: {}{}", stamp, message.author.display_name(), message.content, read);
}

fn describe(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Disconnected => "disconnected".to_string(),
        ConnectionState::Connecting { attempt } => format!("connecting (attempt {})", attempt),
        ConnectionState::Connected => "connected, authenticating".to_string(),
        ConnectionState::Authenticated { user_id } => format!("online as {}", user_id),
        ConnectionState::Failed(reason) => format!("failed: {:?}", reason),
    }
}
