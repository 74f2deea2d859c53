#![cfg(feature = "http-relay")]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_crypto::EncryptedMessageEnvelope;

use crate::policy::ConversationEncryptionState;
use crate::relay::{Relay, RelayError};
use crate::types::{ConversationId, RelayMessage, SessionKeyEnvelope, UserId};

/// `Relay` over the chat server's REST API.
#[derive(Clone)]
pub struct HttpRelayClient {
    base_url: Url,
    api_token: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct RegisterKeyRequest<'a> {
    public_key: &'a str,
}

#[derive(Deserialize)]
struct PublicKeyResponse {
    #[serde(alias = "publicKey")]
    public_key: String,
}

#[derive(Serialize)]
struct DistributeRequest<'a> {
    conversation_id: &'a ConversationId,
    encrypted_keys: &'a [SessionKeyEnvelope],
}

#[derive(Deserialize)]
struct SessionKeyResponse {
    #[serde(alias = "encryptedKey")]
    encrypted_key: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    messages: Vec<RelayMessage>,
}

#[derive(Serialize)]
struct EncryptionToggleRequest<'a> {
    enabled: bool,
    user_id: &'a UserId,
}

#[derive(Deserialize)]
struct ForbiddenBody {
    #[serde(alias = "enabledBy", alias = "owner")]
    enabled_by: Option<UserId>,
}

impl HttpRelayClient {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RelayError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RelayError::BadResponse(format!("invalid relay url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RelayError::BadResponse(format!(
                "relay url cannot be a base: {base_url}"
            )));
        }
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Network(e.to_string()))?;
        Ok(Self {
            base_url,
            api_token,
            client,
        })
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, RelayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RelayError::BadResponse("relay url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        debug!(%method, %url, "relay request");
        let builder = self.client.request(method, url);
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, RelayError> {
        builder.send().await.map_err(map_transport)
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, RelayError> {
        resp.json::<T>()
            .await
            .map_err(|e| RelayError::BadResponse(e.to_string()))
    }
}

fn map_transport(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout
    } else {
        RelayError::Network(e.to_string())
    }
}

/// Maps every non-success status that has no route-specific meaning.
async fn unexpected(resp: reqwest::Response) -> RelayError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => RelayError::Unauthenticated,
        StatusCode::FORBIDDEN => RelayError::Forbidden {
            owner: serde_json::from_str::<ForbiddenBody>(&body)
                .ok()
                .and_then(|b| b.enabled_by),
        },
        StatusCode::CONFLICT => RelayError::AlreadyRegistered,
        _ => RelayError::Rejected {
            status: status.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl Relay for HttpRelayClient {
    async fn register_public_key(&self, public_key_b64: &str) -> Result<(), RelayError> {
        let url = self.url(&["e2ee", "keys", "register"])?;
        let resp = self
            .send(
                self.request(reqwest::Method::POST, url)
                    .json(&RegisterKeyRequest {
                        public_key: public_key_b64,
                    }),
            )
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(resp).await)
        }
    }

    async fn get_public_key(&self, user_id: &UserId) -> Result<Option<String>, RelayError> {
        let url = self.url(&["e2ee", "keys", "user", user_id.as_str()])?;
        let resp = self.send(self.request(reqwest::Method::GET, url)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body: PublicKeyResponse = Self::json(resp).await?;
                Ok(Some(body.public_key))
            }
            _ => Err(unexpected(resp).await),
        }
    }

    async fn distribute_session_key(
        &self,
        conversation_id: &ConversationId,
        envelopes: &[SessionKeyEnvelope],
    ) -> Result<(), RelayError> {
        let url = self.url(&["e2ee", "session-keys", "distribute"])?;
        let resp = self
            .send(
                self.request(reqwest::Method::POST, url)
                    .json(&DistributeRequest {
                        conversation_id,
                        encrypted_keys: envelopes,
                    }),
            )
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(resp).await)
        }
    }

    async fn get_session_key_envelope(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<String>, RelayError> {
        let url = self.url(&["e2ee", "session-keys", conversation_id.as_str()])?;
        let resp = self.send(self.request(reqwest::Method::GET, url)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body: SessionKeyResponse = Self::json(resp).await?;
                Ok(Some(body.encrypted_key))
            }
            _ => Err(unexpected(resp).await),
        }
    }

    async fn send_encrypted_message(
        &self,
        conversation_id: &ConversationId,
        envelope: &EncryptedMessageEnvelope,
    ) -> Result<(), RelayError> {
        let url = self.url(&["e2ee", "messages", conversation_id.as_str()])?;
        let resp = self
            .send(self.request(reqwest::Method::POST, url).json(envelope))
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(resp).await)
        }
    }

    async fn get_encrypted_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<RelayMessage>, RelayError> {
        let url = self.url(&["e2ee", "messages", conversation_id.as_str()])?;
        let resp = self.send(self.request(reqwest::Method::GET, url)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            s if s.is_success() => {
                let body: MessagesResponse = Self::json(resp).await?;
                Ok(body.messages)
            }
            _ => Err(unexpected(resp).await),
        }
    }

    async fn set_conversation_encryption(
        &self,
        conversation_id: &ConversationId,
        enabled: bool,
        requester: &UserId,
    ) -> Result<ConversationEncryptionState, RelayError> {
        let url = self.url(&["e2ee", "conversations", conversation_id.as_str(), "encryption"])?;
        let resp = self
            .send(
                self.request(reqwest::Method::PUT, url)
                    .json(&EncryptionToggleRequest {
                        enabled,
                        user_id: requester,
                    }),
            )
            .await?;
        if resp.status().is_success() {
            Self::json(resp).await
        } else {
            Err(unexpected(resp).await)
        }
    }
}
