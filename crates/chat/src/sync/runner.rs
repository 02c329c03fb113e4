//! Session runner
//!
//! One tokio task per mounted conversation. It owns the [`ChatSession`] and
//! serializes everything that touches it through a single `select!` loop:
//! view commands, channel events, history results and typing timers.
//! The rendered [`ChatView`] is published through a `watch` channel.

use std::sync::Arc;

use helpmate_shared::{Author, Message, MessageId, SyncError, SyncResult, TempId, TicketId};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;

use super::session::{ChatSession, ChatView, SessionConfig, SessionEffect, SessionNotice};
use crate::clock::SharedClock;
use crate::history::MessageSource;
use crate::realtime::connection::ChannelHandle;

/// Capacity of the notice fan-out
const NOTICE_CHANNEL_CAPACITY: usize = 64;

/// Commands accepted by a running session
#[derive(Debug)]
pub enum SessionCommand {
    Open(TicketId),
    Close,
    Send {
        content: String,
        attachment_ids: Option<Vec<String>>,
        reply: oneshot::Sender<SyncResult<TempId>>,
    },
    Keystroke,
    MarkAsRead(MessageId),
    Shutdown,
}

type HistoryResult = (TicketId, SyncResult<Vec<Message>>);

/// Handle to a running conversation session
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    view: watch::Receiver<ChatView>,
    notices: broadcast::Sender<SessionNotice>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn open_ticket(&self, ticket_id: TicketId) -> SyncResult<()> {
        self.command(SessionCommand::Open(ticket_id))
    }

    pub fn close_ticket(&self) -> SyncResult<()> {
        self.command(SessionCommand::Close)
    }

    /// Resolves once the optimistic message is in the timeline
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        attachment_ids: Option<Vec<String>>,
    ) -> SyncResult<TempId> {
        let (reply, response) = oneshot::channel();
        self.command(SessionCommand::Send {
            content: content.into(),
            attachment_ids,
            reply,
        })?;
        response.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub fn keystroke(&self) -> SyncResult<()> {
        self.command(SessionCommand::Keystroke)
    }

    pub fn mark_as_read(&self, message_id: MessageId) -> SyncResult<()> {
        self.command(SessionCommand::MarkAsRead(message_id))
    }

    /// Latest published view
    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Leave the active ticket and stop the task
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Session task ended abnormally");
        }
    }

    fn command(&self, command: SessionCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// Start a session task on `channel`
pub fn spawn_session(
    channel: ChannelHandle,
    source: Arc<dyn MessageSource>,
    me: Author,
    config: SessionConfig,
    clock: SharedClock,
) -> SessionHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (view_tx, view) = watch::channel(ChatView::default());
    let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
    let (history_tx, history_rx) = mpsc::unbounded_channel();

    let runner = SessionRunner {
        session: ChatSession::new(me, config, clock),
        channel,
        source,
        view: view_tx,
        notices: notices.clone(),
        history: history_tx,
    };
    let task = tokio::spawn(runner.run(command_rx, history_rx));

    SessionHandle {
        commands,
        view,
        notices,
        task,
    }
}

struct SessionRunner {
    session: ChatSession,
    channel: ChannelHandle,
    source: Arc<dyn MessageSource>,
    view: watch::Sender<ChatView>,
    notices: broadcast::Sender<SessionNotice>,
    history: mpsc::UnboundedSender<HistoryResult>,
}

impl SessionRunner {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut history: mpsc::UnboundedReceiver<HistoryResult>,
    ) {
        // Subscribe before reading the state so no transition is missed
        let mut events = self.channel.subscribe();
        self.session.attach(self.channel.state(), &self.channel);
        tracing::debug!(channel = %self.channel.name(), "Session started");

        loop {
            self.publish_view();
            let deadline = self.session.next_deadline();

            let effects = tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },

                event = events.recv() => match event {
                    Ok(event) => self.session.handle_channel_event(event, &self.channel),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Session lagged behind channel events - resyncing");
                        self.session.resync()
                    }
                    Err(RecvError::Closed) => break,
                },

                Some((ticket_id, result)) = history.recv() => {
                    self.session.load_history(&ticket_id, result)
                }

                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.session.tick(&self.channel);
                    Vec::new()
                }
            };

            self.apply(effects);
        }

        self.session.close_ticket(&self.channel);
        self.publish_view();
        tracing::debug!(channel = %self.channel.name(), "Session stopped");
    }

    fn on_command(&mut self, command: SessionCommand) -> Vec<SessionEffect> {
        match command {
            SessionCommand::Open(ticket_id) => self.session.open_ticket(ticket_id, &self.channel),
            SessionCommand::Close => {
                self.session.close_ticket(&self.channel);
                Vec::new()
            }
            SessionCommand::Send {
                content,
                attachment_ids,
                reply,
            } => {
                let result = self
                    .session
                    .send_message(content, attachment_ids, &self.channel);
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "Send rejected");
                }
                let _ = reply.send(result);
                Vec::new()
            }
            SessionCommand::Keystroke => {
                self.session.keystroke(&self.channel);
                Vec::new()
            }
            SessionCommand::MarkAsRead(message_id) => {
                if let Err(e) = self.session.mark_as_read(message_id, &self.channel) {
                    tracing::debug!(error = %e, "mark-as-read not delivered");
                }
                Vec::new()
            }
            // Handled by the loop
            SessionCommand::Shutdown => Vec::new(),
        }
    }

    fn apply(&self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::FetchHistory(ticket_id) => self.fetch_history(ticket_id),
                SessionEffect::Notify(notice) => {
                    if let SessionNotice::Incoming(message) = &notice {
                        tracing::debug!(
                            ticket_id = %message.ticket_id,
                            author = %message.author.display_name(),
                            "Incoming message"
                        );
                    }
                    // No listeners is fine
                    let _ = self.notices.send(notice);
                }
            }
        }
    }

    fn fetch_history(&self, ticket_id: TicketId) {
        let fetch = self.source.fetch_messages(&ticket_id);
        let results = self.history.clone();
        tokio::spawn(async move {
            let result = fetch.await;
            let _ = results.send((ticket_id, result));
        });
    }

    fn publish_view(&self) {
        let next = self.session.view();
        self.view.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(TokioInstant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::realtime::connection::ReconnectPolicy;
    use crate::realtime::state::ChannelRegistry;
    use crate::realtime::transport::{MemoryConnector, MemoryPeer};
    use crate::testing::{author, message};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use helpmate_shared::UserRole;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// History source returning a fixed page and counting calls
    struct StaticSource {
        page: Vec<Message>,
        calls: AtomicUsize,
    }

    impl MessageSource for StaticSource {
        fn fetch_messages(&self, _ticket_id: &TicketId) -> BoxFuture<'static, SyncResult<Vec<Message>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(self.page.clone())).boxed()
        }
    }

    fn registry(connector: &MemoryConnector) -> ChannelRegistry {
        ChannelRegistry::new(
            Arc::new(connector.clone()),
            ReconnectPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(2),
                max_delay: Duration::from_millis(4),
            },
        )
    }

    fn authenticate(peer: &MemoryPeer) {
        assert!(peer.send_json(json!({"event": "connected", "data": {"userId": "me"}})));
    }

    async fn next_frame(peer: &mut MemoryPeer) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), peer.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    async fn wait_for_view(handle: &SessionHandle, wanted: impl Fn(&ChatView) -> bool) -> ChatView {
        let mut view = handle.watch_view();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                {
                    let current = view.borrow_and_update();
                    if wanted(&current) {
                        return current.clone();
                    }
                }
                view.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    fn view_ids(view: &ChatView) -> Vec<&str> {
        view.messages.iter().map(|m| m.id.as_str()).collect()
    }

    async fn start(
        connector: &MemoryConnector,
        peer: &MemoryPeer,
        source: Arc<StaticSource>,
    ) -> (ChannelRegistry, SessionHandle) {
        let registry = registry(connector);
        let channel = registry.connect("chat", "token").await;
        authenticate(peer);
        let mut state = channel.watch_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_authenticated()))
            .await
            .unwrap()
            .unwrap();

        let session = spawn_session(
            channel,
            source,
            author("me", UserRole::Client),
            SessionConfig::default(),
            Arc::new(SystemClock),
        );
        (registry, session)
    }

    #[tokio::test]
    async fn test_open_load_send_confirm() {
        let connector = MemoryConnector::new();
        let mut peer = connector.accept();
        let source = Arc::new(StaticSource {
            page: vec![message("m1", "T1", "u2", 0)],
            calls: AtomicUsize::new(0),
        });
        let (_registry, session) = start(&connector, &peer, Arc::clone(&source)).await;

        session.open_ticket(TicketId::from("T1")).unwrap();
        let join = next_frame(&mut peer).await;
        assert_eq!(join, json!({"event": "join-ticket", "data": {"ticketId": "T1"}}));

        let view = wait_for_view(&session, |v| v.loaded).await;
        assert_eq!(view_ids(&view), vec!["m1"]);

        let temp_id = session.send_message("hello", None).await.unwrap();
        let sent = next_frame(&mut peer).await;
        assert_eq!(sent["event"], "send-message");
        assert_eq!(sent["data"]["tempId"], json!(temp_id.0));
        assert_eq!(sent["data"]["message"]["content"], "hello");

        let temp = format!("temp-{}", temp_id);
        let view = wait_for_view(&session, |v| v.messages.len() == 2).await;
        assert_eq!(view_ids(&view), vec!["m1", temp.as_str()]);

        let mut confirmed = serde_json::to_value(message("m2", "T1", "me", 0)).unwrap();
        confirmed["createdAt"] = json!("2030-01-01T00:00:00Z");
        assert!(peer.send_json(json!({
            "event": "message-sent",
            "data": {"tempId": temp_id.0, "message": confirmed}
        })));

        let view = wait_for_view(&session, |v| !v.messages.iter().any(|m| m.is_pending())).await;
        assert_eq!(view_ids(&view), vec!["m1", "m2"]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        session.shutdown().await;
        let leave = next_frame(&mut peer).await;
        assert_eq!(leave["event"], "leave-ticket");
    }

    #[tokio::test]
    async fn test_incoming_notice_and_typing() {
        let connector = MemoryConnector::new();
        let mut peer = connector.accept();
        let source = Arc::new(StaticSource {
            page: Vec::new(),
            calls: AtomicUsize::new(0),
        });
        let (_registry, session) = start(&connector, &peer, source).await;
        let mut notices = session.notices();

        session.open_ticket(TicketId::from("T1")).unwrap();
        next_frame(&mut peer).await;
        wait_for_view(&session, |v| v.loaded).await;

        assert!(peer.send_json(json!({
            "event": "user-typing",
            "data": {"userId": "u2", "isTyping": true, "ticketId": "T1"}
        })));
        wait_for_view(&session, |v| v.typing.len() == 1).await;

        let incoming = message("m5", "T1", "u2", 3);
        assert!(peer.send_json(json!({
            "event": "new-message",
            "data": serde_json::to_value(&incoming).unwrap()
        })));

        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice, SessionNotice::Incoming(incoming));

        session.keystroke().unwrap();
        let typing = next_frame(&mut peer).await;
        assert_eq!(
            typing,
            json!({"event": "typing", "data": {"ticketId": "T1", "isTyping": true}})
        );
        // Idle window ends the burst on its own
        let stopped = next_frame(&mut peer).await;
        assert_eq!(stopped["data"]["isTyping"], json!(false));
    }

    #[tokio::test]
    async fn test_reconnect_rejoins_and_refetches() {
        let connector = MemoryConnector::new();
        let first = connector.accept();
        let mut second = connector.accept();
        let source = Arc::new(StaticSource {
            page: vec![message("m1", "T1", "u2", 0)],
            calls: AtomicUsize::new(0),
        });
        let (_registry, session) = start(&connector, &first, Arc::clone(&source)).await;
        let mut notices = session.notices();

        session.open_ticket(TicketId::from("T1")).unwrap();
        wait_for_view(&session, |v| v.loaded).await;

        assert!(first.fail("connection reset"));
        wait_for_view(&session, |v| !v.connection.is_authenticated()).await;
        authenticate(&second);

        let join = next_frame(&mut second).await;
        assert_eq!(join["event"], "join-ticket");

        let mut saw_reconnected = false;
        while !saw_reconnected {
            let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
                .await
                .unwrap()
                .unwrap();
            saw_reconnected = notice == SessionNotice::Reconnected;
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(view_ids(&session.view()), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_send_without_ticket_is_rejected() {
        let connector = MemoryConnector::new();
        let peer = connector.accept();
        let source = Arc::new(StaticSource {
            page: Vec::new(),
            calls: AtomicUsize::new(0),
        });
        let (_registry, session) = start(&connector, &peer, source).await;

        assert_eq!(
            session.send_message("hello", None).await,
            Err(SyncError::NotConnected)
        );

        session.shutdown().await;
    }
}
