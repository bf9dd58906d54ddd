//! Thin REST facade over the telephony engine's ARI surface (spec.md §4.2).
//!
//! Grounded on `app/ari/client.py`: one pooled HTTP client created by an
//! explicit `start()` and torn down by `close()`, Basic auth, `app=<app>`
//! implicitly merged into every request's query string, and 404-on-delete
//! treated as success rather than as an error (spec.md §9 design note).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::AriError;

/// The subset of the ARI REST surface the call service needs, abstracted
/// behind a trait so [`crate::call_service::CallService`] can be driven by a
/// fake in unit tests without a real telephony engine.
#[async_trait]
pub trait AriPort: Send + Sync {
    async fn originate(
        &self,
        endpoint: &str,
        app_args: &str,
        caller_id: &str,
        timeout_sec: u32,
    ) -> Result<String, AriError>;

    async fn create_bridge(&self, name: &str, bridge_type: &str) -> Result<String, AriError>;

    async fn add_channel_to_bridge(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(), AriError>;

    async fn hangup_channel(&self, channel_id: &str) -> Result<(), AriError>;

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), AriError>;
}

pub struct AriClient {
    base_url: String,
    application_name: String,
    user: String,
    password: String,
    client: Mutex<Option<reqwest::Client>>,
}

impl AriClient {
    pub fn new(
        base_url: impl Into<String>,
        application_name: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            application_name: application_name.into(),
            user: user.into(),
            password: password.into(),
            client: Mutex::new(None),
        }
    }

    /// Create the pooled HTTP connection. Safe to call more than once; the
    /// second call is a no-op, matching `app/ari/client.py`'s guard.
    pub async fn start(&self) -> Result<(), AriError> {
        let mut guard = self.client.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .timeout(Duration::from_secs(10))
            .build()?;
        *guard = Some(client);
        Ok(())
    }

    pub async fn close(&self) {
        *self.client.lock().await = None;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, AriError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(AriError::NotStarted)?;

        let mut query = vec![("app", self.application_name.as_str())];
        query.extend_from_slice(params);

        let response = client
            .request(method, self.url(path))
            .basic_auth(&self.user, Some(&self.password))
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AriError::Status { status, body });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// DELETE with 404 treated as success (the channel/bridge is already
    /// gone, which is the caller's desired end state either way).
    async fn delete_tolerating_missing(&self, path: &str) -> Result<(), AriError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(AriError::NotStarted)?;

        let response = client
            .delete(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
            .query(&[("app", self.application_name.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(AriError::Status { status, body })
    }
}

#[async_trait]
impl AriPort for AriClient {
    async fn originate(
        &self,
        endpoint: &str,
        app_args: &str,
        caller_id: &str,
        timeout_sec: u32,
    ) -> Result<String, AriError> {
        let timeout_str = timeout_sec.to_string();
        let data = self
            .request(
                Method::POST,
                "/channels",
                &[
                    ("endpoint", endpoint),
                    ("appArgs", app_args),
                    ("callerId", caller_id),
                    ("timeout", timeout_str.as_str()),
                ],
            )
            .await?;

        data.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(AriError::MissingField { field: "id" })
    }

    async fn create_bridge(&self, name: &str, bridge_type: &str) -> Result<String, AriError> {
        let data = self
            .request(
                Method::POST,
                "/bridges",
                &[("type", bridge_type), ("name", name)],
            )
            .await?;

        data.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(AriError::MissingField { field: "id" })
    }

    async fn add_channel_to_bridge(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(), AriError> {
        let path = format!("/bridges/{bridge_id}/addChannel");
        self.request(Method::POST, &path, &[("channel", channel_id)])
            .await?;
        Ok(())
    }

    async fn hangup_channel(&self, channel_id: &str) -> Result<(), AriError> {
        self.delete_tolerating_missing(&format!("/channels/{channel_id}"))
            .await
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), AriError> {
        self.delete_tolerating_missing(&format!("/bridges/{bridge_id}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn started_client(server: &MockServer) -> AriClient {
        let client = AriClient::new(server.uri(), "pbx_ari", "ari_user", "ari_pass");
        client.start().await.unwrap();
        client
    }

    #[tokio::test]
    async fn originate_returns_channel_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "C-B"})))
            .mount(&server)
            .await;

        let client = started_client(&server).await;
        let id = client
            .originate("PJSIP/1001", "callee,1001", "ARI", 30)
            .await
            .unwrap();
        assert_eq!(id, "C-B");
    }

    #[tokio::test]
    async fn originate_without_id_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = started_client(&server).await;
        let err = client
            .originate("PJSIP/1001", "callee,1001", "ARI", 30)
            .await
            .unwrap_err();
        assert!(matches!(err, AriError::MissingField { field: "id" }));
    }

    #[tokio::test]
    async fn hangup_tolerates_404() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/channels/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = started_client(&server).await;
        client.hangup_channel("gone").await.unwrap();
    }

    #[tokio::test]
    async fn hangup_propagates_other_errors() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/channels/boom"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = started_client(&server).await;
        let err = client.hangup_channel("boom").await.unwrap_err();
        assert!(matches!(err, AriError::Status { .. }));
    }

    #[tokio::test]
    async fn request_before_start_is_not_started_error() {
        let client = AriClient::new("http://127.0.0.1:0", "pbx_ari", "u", "p");
        let err = client.hangup_channel("x").await.unwrap_err();
        assert!(matches!(err, AriError::NotStarted));
    }
}
