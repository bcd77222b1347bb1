use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ChatBackend, ChatSummary, SendMessageRequest};
use crate::config::BackendConfig;
use crate::error::{ChatSyncError, Result};
use crate::sync::MessageDraft;

/// 基于 reqwest 的 REST 后端客户端
#[derive(Clone)]
pub struct HttpChatBackend {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
}

/// 列表响应：裸数组或 `{ "data" | "items" | "chats" | "messages": [...] }`
#[derive(Deserialize)]
#[serde(untagged)]
enum ListEnvelope<T> {
    Bare(Vec<T>),
    Wrapped {
        #[serde(alias = "items", alias = "chats", alias = "messages")]
        data: Vec<T>,
    },
}

impl<T> ListEnvelope<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            ListEnvelope::Bare(items) => items,
            ListEnvelope::Wrapped { data } => data,
        }
    }
}

/// 单条消息响应：`{ "data" | "message": {...} }` 或裸对象
#[derive(Deserialize)]
#[serde(untagged)]
enum MessageEnvelope {
    Wrapped {
        #[serde(alias = "message")]
        data: MessageDraft,
    },
    Bare(MessageDraft),
}

impl HttpChatBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| ChatSyncError::Config("backend.base_url is not configured".into()))?;

        let client = Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout())
            .build()
            .map_err(|err| ChatSyncError::Config(format!("failed to build http client: {err}")))?;

        Self::with_client(client, base_url, config.auth_token.clone())
    }

    pub fn with_client(client: Client, base_url: &str, auth_token: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|err| {
            ChatSyncError::Config(format!("invalid backend base_url {base_url:?}: {err}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ChatSyncError::Config(format!(
                "backend base_url {base_url} cannot be used as a base"
            )));
        }

        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    /// 拼接接口地址，每个片段都会被转义
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatSyncError::Config("backend base_url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("accept", "application/json");
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), url = %url, "Backend request failed");
        Err(ChatSyncError::Backend {
            status: status.as_u16(),
            body,
        })
    }

    async fn execute_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.execute(builder).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        let url = self.endpoint(&["chats"])?;
        let envelope: ListEnvelope<ChatSummary> =
            self.execute_json(self.request(Method::GET, url)).await?;
        let chats = envelope.into_items();
        debug!(count = chats.len(), "Chat list fetched");
        Ok(chats)
    }

    async fn fetch_messages(&self, chat_id: &str) -> Result<Vec<Value>> {
        let url = self.endpoint(&["chats", chat_id, "messages"])?;
        let envelope: ListEnvelope<Value> =
            self.execute_json(self.request(Method::GET, url)).await?;
        let records = envelope.into_items();
        debug!(chat_id = %chat_id, count = records.len(), "Message history fetched");
        Ok(records)
    }

    async fn send_message(
        &self,
        chat_id: &str,
        request: SendMessageRequest,
    ) -> Result<MessageDraft> {
        let url = self.endpoint(&["chats", chat_id, "messages"])?;
        let envelope: MessageEnvelope = self
            .execute_json(self.request(Method::POST, url).json(&request))
            .await?;
        Ok(match envelope {
            MessageEnvelope::Wrapped { data } => data,
            MessageEnvelope::Bare(draft) => draft,
        })
    }

    async fn mark_read(&self, chat_id: &str, message_id: &str) -> Result<()> {
        let url = self.endpoint(&["chats", chat_id, "messages", message_id, "read"])?;
        self.execute(self.request(Method::POST, url)).await?;
        Ok(())
    }
}
