//! Channel driver task
//!
//! Owns the transport of one channel: connects with bounded exponential
//! backoff, waits for the credential to be acknowledged, fans inbound events
//! out to subscribers and writes outbound commands. A connect attempt only
//! succeeds once the service sends `connected`; a transport that opens and
//! drops before that costs an attempt like a refused one. After losing an
//! authenticated session the driver starts a fresh cycle. An explicit
//! rejection or an exhausted cycle ends the task.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_retry::RetryIf;

use super::connection::{
    ChannelEvent, ChannelShared, ConnectionState, FailureReason, Lifecycle, ReconnectPolicy,
};
use super::events::{InboundEvent, OutboundEvent};
use super::transport::{Connector, Transport, TransportError};

/// How an authenticated session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Lost,
}

/// Drives one channel until it is shut down or fails for good
pub(crate) struct ChannelDriver {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) credential: String,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl ChannelDriver {
    pub(crate) async fn run(mut self) {
        let channel = self.shared.name.clone();

        loop {
            let transport = tokio::select! {
                _ = wait_for_shutdown(self.shutdown.clone()) => {
                    self.finish_disconnected();
                    return;
                }
                result = self.establish() => result,
            };

            let transport = match transport {
                Ok(transport) => transport,
                Err(TransportError::Rejected(reason)) => {
                    self.finish_rejected(reason);
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        channel = %channel,
                        error = %e,
                        max_attempts = self.policy.max_attempts,
                        "Reconnect attempts exhausted - channel offline"
                    );
                    self.shared.transition(
                        ConnectionState::Failed(FailureReason::Offline),
                        Lifecycle::Failed(FailureReason::Offline),
                    );
                    return;
                }
            };

            match self.pump(transport).await {
                SessionEnd::Shutdown => {
                    self.finish_disconnected();
                    return;
                }
                SessionEnd::Lost => {
                    tracing::warn!(channel = %channel, "Channel transport lost - reconnecting");
                    self.shared
                        .transition(ConnectionState::Disconnected, Lifecycle::Disconnected);
                    self.discard_stale_outbound();
                }
            }
        }
    }

    /// One connect cycle: open and authenticate, retrying transient
    /// failures with backoff until the attempt budget is spent
    async fn establish(&self) -> Result<Transport, TransportError> {
        let mut attempt = 0u32;
        let channel = self.shared.name.clone();
        let driver = self;

        RetryIf::spawn(
            self.policy.delays(),
            move || {
                attempt += 1;
                driver.authenticate(attempt)
            },
            |e: &TransportError| {
                if e.is_transient() {
                    tracing::debug!(channel = %channel, error = %e, "Transient error - will retry");
                    true
                } else {
                    tracing::debug!(channel = %channel, error = %e, "Permanent error - will not retry");
                    false
                }
            },
        )
        .await
    }

    /// Open a transport and wait for the credential to be acknowledged
    async fn authenticate(&self, attempt: u32) -> Result<Transport, TransportError> {
        let channel = &self.shared.name;
        self.shared.transition(
            ConnectionState::Connecting { attempt },
            Lifecycle::Connecting { attempt },
        );
        tracing::debug!(channel = %channel, attempt, "Opening channel transport");

        let Transport {
            mut sink,
            mut stream,
        } = self.connector.open(channel, &self.credential).await?;

        self.shared
            .transition(ConnectionState::Connected, Lifecycle::Connected);
        tracing::info!(
            channel = %channel,
            session_id = %self.shared.session_id,
            attempt,
            "Channel transport connected - awaiting authentication"
        );

        let dropped = loop {
            let text = match stream.next().await {
                Some(Ok(text)) => text,
                Some(Err(e)) => break e,
                None => break TransportError::Io("closed before authentication".to_string()),
            };
            let event = match InboundEvent::from_frame(&text) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(
                        channel = %channel,
                        error = %e,
                        frame = %text,
                        "Dropping malformed inbound frame"
                    );
                    continue;
                }
            };

            match event {
                InboundEvent::Connected { .. } => {
                    self.on_inbound(event);
                    return Ok(Transport { sink, stream });
                }
                InboundEvent::Error { message } => {
                    let _ = sink.close().await;
                    return Err(TransportError::Rejected(message));
                }
                InboundEvent::Disconnect => {
                    let _ = sink.close().await;
                    break TransportError::Io("disconnected before authentication".to_string());
                }
                other => {
                    tracing::trace!(channel = %channel, event = other.name(), "Inbound event");
                    self.shared.publish(ChannelEvent::Inbound(other));
                }
            }
        };

        tracing::warn!(
            channel = %channel,
            attempt,
            error = %dropped,
            "Channel transport dropped before authentication"
        );
        self.shared
            .transition(ConnectionState::Disconnected, Lifecycle::Disconnected);
        Err(dropped)
    }

    /// Run an authenticated transport until it ends
    async fn pump(&mut self, transport: Transport) -> SessionEnd {
        let Transport {
            mut sink,
            mut stream,
        } = transport;
        let channel = self.shared.name.clone();

        if *self.shutdown.borrow() {
            return SessionEnd::Shutdown;
        }

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                }

                frame = stream.next() => match frame {
                    Some(Ok(text)) => match InboundEvent::from_frame(&text) {
                        Ok(event) => {
                            if let Some(end) = self.on_inbound(event) {
                                let _ = sink.close().await;
                                return end;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                channel = %channel,
                                error = %e,
                                frame = %text,
                                "Dropping malformed inbound frame"
                            );
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(channel = %channel, error = %e, "Channel transport error");
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                },

                Some(event) = self.outbound.recv() => {
                    let frame = match event.to_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize outbound event");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(frame).await {
                        tracing::warn!(channel = %channel, error = %e, "Failed to write outbound frame");
                        return SessionEnd::Lost;
                    }
                    tracing::trace!(channel = %channel, event = event.name(), "Outbound event sent");
                }
            }
        }
    }

    /// Commands queued for a session that is gone must not reach the next one
    fn discard_stale_outbound(&mut self) {
        let mut discarded = 0usize;
        while self.outbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(
                channel = %self.shared.name,
                discarded,
                "Discarding outbound events queued before reconnect"
            );
        }
    }

    /// Lifecycle bookkeeping for one inbound event, then fan-out
    fn on_inbound(&self, event: InboundEvent) -> Option<SessionEnd> {
        match &event {
            InboundEvent::Connected { user_id } => {
                tracing::info!(
                    channel = %self.shared.name,
                    user_id = %user_id,
                    "Channel authenticated"
                );
                self.shared.transition(
                    ConnectionState::Authenticated {
                        user_id: user_id.clone(),
                    },
                    Lifecycle::Authenticated {
                        user_id: user_id.clone(),
                    },
                );
            }
            InboundEvent::Error { message } => {
                tracing::warn!(channel = %self.shared.name, error = %message, "Service reported an error");
                self.shared
                    .publish(ChannelEvent::Lifecycle(Lifecycle::Error(message.clone())));
            }
            InboundEvent::Disconnect => {
                self.shared
                    .publish(ChannelEvent::Inbound(InboundEvent::Disconnect));
                return Some(SessionEnd::Lost);
            }
            _ => {}
        }

        tracing::trace!(channel = %self.shared.name, event = event.name(), "Inbound event");
        self.shared.publish(ChannelEvent::Inbound(event));
        None
    }

    fn finish_disconnected(&self) {
        tracing::info!(channel = %self.shared.name, "Channel disconnected");
        self.shared
            .transition(ConnectionState::Disconnected, Lifecycle::Disconnected);
    }

    fn finish_rejected(&self, reason: String) {
        tracing::error!(
            channel = %self.shared.name,
            reason = %reason,
            "Channel credential rejected"
        );
        let failure = FailureReason::AuthenticationRejected(reason);
        self.shared.transition(
            ConnectionState::Failed(failure.clone()),
            Lifecycle::Failed(failure),
        );
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // Sender gone: nobody can ask us to stop any more
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::realtime::connection::{ChannelHandle, Emitter};
    use crate::realtime::transport::{MemoryConnector, MemoryPeer};
    use helpmate_shared::{TicketId, UserId};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::task::JoinHandle;

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(5),
        }
    }

    fn spawn_driver(connector: &MemoryConnector) -> (ChannelHandle, JoinHandle<()>) {
        let (handle, outbound) = ChannelHandle::new("chat");
        let driver = ChannelDriver {
            shared: Arc::clone(&handle.shared),
            credential: "token-1".to_string(),
            connector: Arc::new(connector.clone()),
            policy: fast_policy(),
            outbound,
            shutdown: handle.shared.shutdown.subscribe(),
        };
        (handle, tokio::spawn(driver.run()))
    }

    async fn next_lifecycle(events: &mut broadcast::Receiver<ChannelEvent>) -> Lifecycle {
        loop {
            if let ChannelEvent::Lifecycle(l) = events.recv().await.unwrap() {
                return l;
            }
        }
    }

    async fn wait_for_state(handle: &ChannelHandle, wanted: impl Fn(&ConnectionState) -> bool) {
        let mut state = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !wanted(&state.borrow_and_update()) {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    fn authenticate(peer: &MemoryPeer) {
        assert!(peer.send_json(json!({"event": "connect"})));
        assert!(peer.send_json(json!({"event": "connected", "data": {"userId": "u1"}})));
    }

    #[tokio::test]
    async fn test_connect_then_authenticate() {
        let connector = MemoryConnector::new();
        let peer = connector.accept();
        let (handle, _task) = spawn_driver(&connector);
        let mut events = handle.subscribe();

        authenticate(&peer);
        wait_for_state(&handle, |s| s.is_authenticated()).await;

        assert_eq!(
            handle.state(),
            ConnectionState::Authenticated {
                user_id: UserId::from("u1")
            }
        );
        assert_eq!(
            connector.attempts(),
            vec![("chat".to_string(), "token-1".to_string())]
        );

        // Lifecycle notifications precede the raw inbound events
        let mut seen = Vec::new();
        while seen.len() < 3 {
            seen.push(next_lifecycle(&mut events).await);
        }
        assert!(seen.contains(&Lifecycle::Connected));
        assert!(seen.contains(&Lifecycle::Authenticated {
            user_id: UserId::from("u1")
        }));
    }

    #[tokio::test]
    async fn test_outbound_events_reach_transport() {
        let connector = MemoryConnector::new();
        let mut peer = connector.accept();
        let (handle, _task) = spawn_driver(&connector);

        authenticate(&peer);
        wait_for_state(&handle, |s| s.is_authenticated()).await;

        handle
            .emit(OutboundEvent::JoinTicket {
                ticket_id: TicketId::from("T1"),
            })
            .unwrap();
        assert_eq!(
            peer.recv().await.unwrap(),
            r#"{"event":"join-ticket","data":{"ticketId":"T1"}}"#
        );
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let connector = MemoryConnector::new();
        let peer = connector.accept();
        let (handle, _task) = spawn_driver(&connector);
        let mut events = handle.subscribe();

        authenticate(&peer);
        assert!(peer.send_frame("not json at all"));
        assert!(peer.send_json(json!({"event": "joined-ticket", "data": {"ticketId": "T1"}})));

        let joined = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let ChannelEvent::Inbound(InboundEvent::JoinedTicket { ticket_id }) =
                    events.recv().await.unwrap()
                {
                    return ticket_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(joined, TicketId::from("T1"));
        assert!(handle.state().is_authenticated());
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_loss() {
        let connector = MemoryConnector::new();
        let first = connector.accept();
        let second = connector.accept();
        let (handle, _task) = spawn_driver(&connector);

        authenticate(&first);
        wait_for_state(&handle, |s| s.is_authenticated()).await;

        first.close();
        wait_for_state(&handle, |s| *s == ConnectionState::Connected).await;

        authenticate(&second);
        wait_for_state(&handle, |s| s.is_authenticated()).await;
        assert_eq!(connector.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let connector = MemoryConnector::new();
        let (handle, task) = spawn_driver(&connector);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            handle.state(),
            ConnectionState::Failed(FailureReason::Offline)
        );
        assert_eq!(connector.attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_drop_before_authentication_costs_an_attempt() {
        let connector = MemoryConnector::new();
        for _ in 0..10 {
            connector.accept().close();
        }
        let (handle, task) = spawn_driver(&connector);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            handle.state(),
            ConnectionState::Failed(FailureReason::Offline)
        );
        assert_eq!(connector.attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_authentication_restores_attempt_budget() {
        let connector = MemoryConnector::new();
        connector.accept().close();
        connector.accept().close();
        let session = connector.accept();
        authenticate(&session);
        session.close();
        for _ in 0..10 {
            connector.accept().close();
        }
        let (handle, task) = spawn_driver(&connector);
        let mut events = handle.subscribe();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        // Two dropped opens, one session, then a full cycle of three
        assert_eq!(connector.attempts().len(), 6);
        let mut authenticated = 0;
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            if let ChannelEvent::Lifecycle(lifecycle) = event {
                if matches!(lifecycle, Lifecycle::Authenticated { .. }) {
                    authenticated += 1;
                }
                last = Some(lifecycle);
            }
        }
        assert_eq!(authenticated, 1);
        assert_eq!(last, Some(Lifecycle::Failed(FailureReason::Offline)));
    }

    #[tokio::test]
    async fn test_stale_outbound_not_replayed_after_reconnect() {
        let connector = MemoryConnector::new();
        let first = connector.accept();
        let mut second = connector.accept();
        let (handle, _task) = spawn_driver(&connector);

        authenticate(&first);
        wait_for_state(&handle, |s| s.is_authenticated()).await;

        // Queued while the session is still up but written after it ends
        first.close();
        handle
            .emit(OutboundEvent::JoinTicket {
                ticket_id: TicketId::from("T1"),
            })
            .unwrap();
        wait_for_state(&handle, |s| *s == ConnectionState::Connected).await;

        authenticate(&second);
        wait_for_state(&handle, |s| s.is_authenticated()).await;
        handle
            .emit(OutboundEvent::JoinTicket {
                ticket_id: TicketId::from("T2"),
            })
            .unwrap();
        assert_eq!(
            second.recv().await.unwrap(),
            r#"{"event":"join-ticket","data":{"ticketId":"T2"}}"#
        );
    }

    #[tokio::test]
    async fn test_handshake_rejection_is_terminal() {
        let connector = MemoryConnector::new();
        connector.refuse(TransportError::Rejected("handshake returned 401".into()));
        let (handle, task) = spawn_driver(&connector);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            handle.state(),
            ConnectionState::Failed(FailureReason::AuthenticationRejected(
                "handshake returned 401".to_string()
            ))
        );
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_error_before_authentication_is_rejection() {
        let connector = MemoryConnector::new();
        let peer = connector.accept();
        let (handle, task) = spawn_driver(&connector);

        assert!(peer.send_json(json!({"event": "error", "data": {"message": "invalid token"}})));

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            handle.state(),
            ConnectionState::Failed(FailureReason::AuthenticationRejected(
                "invalid token".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let connector = MemoryConnector::new();
        let mut peer = connector.accept();
        let (handle, task) = spawn_driver(&connector);

        authenticate(&peer);
        wait_for_state(&handle, |s| s.is_authenticated()).await;

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(peer.recv().await, None);
    }
}
