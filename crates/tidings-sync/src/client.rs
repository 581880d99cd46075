//! HTTP implementation of [`ChatApi`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::ChatApi;
use crate::error::ApiError;
use crate::types::{Credential, Message, Reaction};

/// REST client for the chat server.
pub struct HttpChatApi {
    http: Client,
    base: Url,
    credential: Credential,
}

impl HttpChatApi {
    /// Create a client for the API at `api_url`, authenticating with `credential`.
    pub fn new(api_url: &str, credential: Credential) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        let base =
            Url::parse(api_url).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", api_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(api_url.to_string()));
        }

        Ok(Self {
            http,
            base,
            credential,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `<base>/api/channels/<channel_id>/messages/<segments...>`, each segment percent-encoded.
    fn messages_url(&self, channel_id: &str, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?;
            path.pop_if_empty()
                .extend(["api", "channels", channel_id, "messages"])
                .extend(segments);
        }
        Ok(url)
    }

    async fn request<B, T>(&self, method: Method, url: Url, body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.execute(method, url, body).await?;
        Ok(response.json().await?)
    }

    async fn execute<B>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ApiError>
    where
        B: Serialize + ?Sized,
    {
        debug!(method = %method, url = %url, "api request");
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(self.credential.token());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &text));
        }
        Ok(response)
    }
}

#[derive(Serialize)]
struct SendBody<'a> {
    content: &'a str,
    nonce: &'a str,
}

#[derive(Serialize)]
struct EditBody<'a> {
    content: &'a str,
}

const NO_BODY: Option<&()> = None;

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
        nonce: &str,
    ) -> Result<Message, ApiError> {
        let url = self.messages_url(channel_id, &[])?;
        self.request(Method::POST, url, Some(&SendBody { content, nonce }))
            .await
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, ApiError> {
        let url = self.messages_url(channel_id, &[message_id])?;
        self.request(Method::PATCH, url, Some(&EditBody { content })).await
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ApiError> {
        let url = self.messages_url(channel_id, &[message_id])?;
        self.execute(Method::DELETE, url, NO_BODY).await?;
        Ok(())
    }

    async fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message, ApiError> {
        let url = self.messages_url(channel_id, &[message_id, "reactions", emoji])?;
        self.request(Method::PUT, url, NO_BODY).await
    }

    async fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message, ApiError> {
        let url = self.messages_url(channel_id, &[message_id, "reactions", emoji])?;
        self.request(Method::DELETE, url, NO_BODY).await
    }

    async fn pin_message(&self, channel_id: &str, message_id: &str) -> Result<Message, ApiError> {
        let url = self.messages_url(channel_id, &[message_id, "pin"])?;
        self.request(Method::PUT, url, NO_BODY).await
    }

    async fn unpin_message(&self, channel_id: &str, message_id: &str) -> Result<Message, ApiError> {
        let url = self.messages_url(channel_id, &[message_id, "pin"])?;
        self.request(Method::DELETE, url, NO_BODY).await
    }

    async fn fetch_reactions(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Vec<Reaction>, ApiError> {
        let url = self.messages_url(channel_id, &[message_id, "reactions"])?;
        self.request(Method::GET, url, NO_BODY).await
    }

    async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ApiError> {
        let mut url = self.messages_url(channel_id, &[])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        self.request(Method::GET, url, NO_BODY).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn message_json(id: &str, content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "channelId": "c1",
            "authorId": "alice",
            "content": content,
            "createdAt": "2025-01-01T00:00:00Z",
            "nonce": "t1"
        })
    }

    fn client(server: &MockServer) -> HttpChatApi {
        HttpChatApi::new(&server.uri(), Credential::new("secret")).unwrap()
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpChatApi::new("not a url", Credential::new("t")),
            Err(ApiError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_messages_url_encodes_segments() {
        let api = HttpChatApi::new("https://chat.example.com/", Credential::new("t")).unwrap();
        let url = api.messages_url("c1", &["m1", "reactions", "👍"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://chat.example.com/api/channels/c1/messages/m1/reactions/%F0%9F%91%8D"
        );
    }

    #[tokio::test]
    async fn test_send_message() {
        let server = MockServer::start().await;
        let expected = serde_json::json!({"content": "hi", "nonce": "t1"});
        let body = message_json("m42", "hi");
        Mock::given(method("POST"))
            .and(path("/api/channels/c1/messages"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(expected))
            .respond_with(ResponseTemplate::new(201).set_body_json(body))
            .mount(&server)
            .await;

        let message = client(&server)
            .send_message("c1", "hi", "t1")
            .await
            .unwrap();
        assert_eq!(message.id, "m42");
        assert_eq!(message.nonce.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_delete_message_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/channels/c1/messages/m1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).delete_message("c1", "m1").await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_maps_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/channels/c1/messages/m1"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "title": "Conflict",
                "status": 409,
                "detail": "message was deleted"
            })))
            .mount(&server)
            .await;

        match client(&server).edit_message("c1", "m1", "new").await {
            Err(ApiError::Conflict(message)) => assert_eq!(message, "message was deleted"),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_messages_with_limit() {
        let server = MockServer::start().await;
        let body = serde_json::json!([message_json("m1", "a"), message_json("m2", "b")]);
        Mock::given(method("GET"))
            .and(path("/api/channels/c1/messages"))
            .and(query_param("limit", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let messages = client(&server).fetch_messages("c1", 50).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "b");
    }

    #[tokio::test]
    async fn test_fetch_reactions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/channels/c1/messages/m1/reactions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"emoji": "🎉", "users": ["alice", "bob"]}
            ])))
            .mount(&server)
            .await;

        let reactions = client(&server).fetch_reactions("c1", "m1").await.unwrap();
        assert_eq!(reactions[0].count(), 2);
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/channels/c1/messages/m1/pin"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        assert!(matches!(
            client(&server).pin_message("c1", "m1").await,
            Err(ApiError::Unauthorized(m)) if m == "forbidden"
        ));
    }
}
