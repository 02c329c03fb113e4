//! Ticket message history over the REST API
//!
//! The realtime channel only carries what happens while a view is
//! connected. Everything before that (and anything missed during a
//! reconnect) is bulk-loaded from `GET /tickets/{ticketId}/messages`.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use helpmate_shared::{Message, MessageId, SyncError, SyncResult, TicketId};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::realtime::events::OutgoingMessage;

/// Request timeout for history calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Bulk-load collaborator used by the session runner
pub trait MessageSource: Send + Sync {
    fn fetch_messages(&self, ticket_id: &TicketId) -> BoxFuture<'static, SyncResult<Vec<Message>>>;
}

#[derive(Debug, Deserialize)]
struct UnreadCount {
    count: u64,
}

/// Client for the ticket message endpoints
#[derive(Clone)]
pub struct HistoryClient {
    client: Client,
    base_url: Url,
    credential: String,
}

impl HistoryClient {
    /// Create a client for `base_url` (e.g. `http://localhost:3000/api`)
    pub fn new(base_url: Url, credential: impl Into<String>) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::History(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            credential: credential.into(),
        })
    }

    /// Full message history of a ticket, oldest first
    pub async fn fetch_messages(&self, ticket_id: &TicketId) -> SyncResult<Vec<Message>> {
        let url = self.endpoint(&["tickets", &ticket_id.0, "messages"])?;
        let response = self.send(self.client.get(url)).await?;

        let messages: Vec<Message> = response
            .json()
            .await
            .map_err(|e| SyncError::History(format!("Failed to parse message history: {}", e)))?;

        debug!(ticket_id = %ticket_id, count = messages.len(), "Fetched message history");
        Ok(messages)
    }

    /// Server-side unread count for the current user
    pub async fn unread_count(&self, ticket_id: &TicketId) -> SyncResult<u64> {
        let url = self.endpoint(&["tickets", &ticket_id.0, "messages", "unread-count"])?;
        let response = self.send(self.client.get(url)).await?;

        let body: UnreadCount = response
            .json()
            .await
            .map_err(|e| SyncError::History(format!("Failed to parse unread count: {}", e)))?;
        Ok(body.count)
    }

    /// REST fallback for `mark-as-read`
    pub async fn mark_as_read(&self, ticket_id: &TicketId, message_id: &MessageId) -> SyncResult<()> {
        let url = self.endpoint(&["tickets", &ticket_id.0, "messages", message_id.as_str(), "read"])?;
        self.send(self.client.patch(url)).await?;
        debug!(ticket_id = %ticket_id, message_id = %message_id, "Marked message as read");
        Ok(())
    }

    /// REST fallback for `send-message`; returns the stored message
    pub async fn post_message(&self, ticket_id: &TicketId, message: &OutgoingMessage) -> SyncResult<Message> {
        let url = self.endpoint(&["tickets", &ticket_id.0, "messages"])?;
        let response = self.send(self.client.post(url).json(message)).await?;

        response
            .json()
            .await
            .map_err(|e| SyncError::History(format!("Failed to parse created message: {}", e)))
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::History(format!("Invalid API base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> SyncResult<Response> {
        let response = request
            .bearer_auth(&self.credential)
            .send()
            .await
            .map_err(|e| SyncError::History(format!("Failed to call history API: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "History API returned error status");
            return Err(SyncError::History(format!("{} - {}", status, body)));
        }
        Ok(response)
    }
}

impl MessageSource for HistoryClient {
    fn fetch_messages(&self, ticket_id: &TicketId) -> BoxFuture<'static, SyncResult<Vec<Message>>> {
        let client = self.clone();
        let ticket_id = ticket_id.clone();
        async move { HistoryClient::fetch_messages(&client, &ticket_id).await }.boxed()
    }
}
