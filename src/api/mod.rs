//! One-shot REST calls against the platform API.
//!
//! These are the collaborators the chat controller uses around the
//! realtime channel: history fetch, fallback sends, close-ticket, and
//! identity. The endpoints themselves live in the external backend.

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::error::{ChatError, ChatResult};
use crate::models::ticket::{ChatMessage, Ticket};
use crate::models::user::CurrentUser;

/// Thin client over the platform REST API. Authenticates every request
/// with the session token (Knox `Token` scheme).
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: String,
}

/// Payload for creating a ticket against a challenge.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct CreateTicketRequest {
    pub challenge_id: i64,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_message: Option<String>,
}

#[derive(Debug, Serialize, Validate)]
struct CreateMessageRequest {
    #[validate(length(min = 1, max = 4000))]
    content: String,
}

/// `{"success": ..., "data": ...}` wrapper used by mutating endpoints.
#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct MeEnvelope {
    me: CurrentUser,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// All tickets visible to the current user.
    pub async fn list_tickets(&self) -> ChatResult<Vec<Ticket>> {
        let response = self.get("/api/tickets/").await?;
        Ok(response.json().await?)
    }

    /// Ticket detail with its embedded message history.
    pub async fn get_ticket(&self, ticket_id: i64) -> ChatResult<Ticket> {
        let response = self.get(&format!("/api/tickets/{}/", ticket_id)).await?;
        Ok(response.json().await?)
    }

    /// Create a ticket for a challenge, optionally with a first message.
    pub async fn create_ticket(&self, request: &CreateTicketRequest) -> ChatResult<Ticket> {
        request.validate()?;
        let response = self
            .http
            .post(self.url("/api/tickets/create/"))
            .header(AUTHORIZATION, self.auth_header())
            .json(request)
            .send()
            .await?;
        let envelope: DataEnvelope<Ticket> = Self::check(response).await?.json().await?;
        Ok(envelope.data)
    }

    /// Close a ticket. Irreversible; the backend stamps the close time.
    pub async fn close_ticket(&self, ticket_id: i64) -> ChatResult<Ticket> {
        let response = self
            .http
            .put(self.url(&format!("/api/tickets/{}/close/", ticket_id)))
            .header(AUTHORIZATION, self.auth_header())
            .send()
            .await?;
        let envelope: DataEnvelope<Ticket> = Self::check(response).await?.json().await?;
        Ok(envelope.data)
    }

    /// Message history for a ticket, oldest-first as served.
    pub async fn fetch_messages(&self, ticket_id: i64) -> ChatResult<Vec<ChatMessage>> {
        let response = self
            .get(&format!("/api/tickets/{}/messages/", ticket_id))
            .await?;
        Ok(response.json().await?)
    }

    /// One-shot message creation, the fallback path when the realtime
    /// channel is down. Returns the stored message.
    pub async fn create_message(&self, ticket_id: i64, content: &str) -> ChatResult<ChatMessage> {
        let request = CreateMessageRequest {
            content: content.to_string(),
        };
        request.validate()?;
        debug!(ticket_id, "creating message via REST fallback");
        let response = self
            .http
            .post(self.url(&format!("/api/tickets/{}/messages/create/", ticket_id)))
            .header(AUTHORIZATION, self.auth_header())
            .json(&request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Identity behind the session token.
    pub async fn current_user(&self) -> ChatResult<CurrentUser> {
        let response = self.get("/api/users/me/").await?;
        let envelope: MeEnvelope = response.json().await?;
        Ok(envelope.me)
    }

    async fn get(&self, path: &str) -> ChatResult<Response> {
        let response = self
            .http
            .get(self.url(path))
            .header(AUTHORIZATION, self.auth_header())
            .send()
            .await?;
        Self::check(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    /// Map non-2xx responses to `ChatError::Api`, pulling the backend's
    /// `{"error": ...}` body when present.
    async fn check(response: Response) -> ChatResult<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| {
                body.get("error")
                    .and_then(|e| e.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "request failed".to_string());
        Err(ChatError::Api { status, message })
    }
}

/// Content guard shared with the controller: non-empty after trimming
/// and within the backend's length bound.
pub fn validate_content(content: &str) -> ChatResult<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::EmptyContent);
    }
    let probe = CreateMessageRequest {
        content: trimmed.to_string(),
    };
    probe.validate()?;
    Ok(trimmed)
}
