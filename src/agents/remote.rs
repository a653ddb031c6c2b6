//! Client for the remote agent HTTP contract.
//!
//! A remote agent is any server answering `GET /agent-info`, `GET /health`,
//! `POST /invoke` and `POST /message` with JSON bodies.

use super::types::{AgentMessage, AgentOptions, InvocationRequest, InvocationResponse};
use crate::error::{KernelError, Result};
use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeBody<'a> {
    from: &'a str,
    from_origin: &'a str,
    #[serde(flatten)]
    request: &'a InvocationRequest,
}

#[derive(Clone)]
pub struct RemoteAgentClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for RemoteAgentClient {
    fn default() -> Self {
        Self::new(DEFAULT_REMOTE_TIMEOUT)
    }
}

impl RemoteAgentClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: if timeout.is_zero() {
                DEFAULT_REMOTE_TIMEOUT
            } else {
                timeout
            },
        }
    }

    pub async fn fetch_info(&self, endpoint: &str) -> Result<AgentOptions> {
        let url = route(endpoint, "agent-info")?;
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        let info = response
            .json::<AgentOptions>()
            .await
            .with_context(|| format!("decoding agent info from {url}"))?;
        Ok(info)
    }

    /// `true` only for a 2xx answer within the health timeout.
    pub async fn health(&self, endpoint: &str) -> bool {
        let Ok(url) = route(endpoint, "health") else {
            return false;
        };
        match self
            .client
            .get(url)
            .timeout(HEALTH_TIMEOUT.min(self.timeout))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!(endpoint, %error, "remote agent health check failed");
                false
            }
        }
    }

    pub async fn invoke(
        &self,
        endpoint: &str,
        from: &str,
        from_origin: &str,
        request: &InvocationRequest,
        timeout: Duration,
    ) -> Result<Value> {
        let url = route(endpoint, "invoke")?;
        let response = self
            .client
            .post(url.clone())
            .timeout(timeout)
            .json(&InvokeBody {
                from,
                from_origin,
                request,
            })
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    KernelError::InvocationTimeout {
                        agent_id: endpoint.to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    }
                } else {
                    KernelError::InvocationFailed(format!("POST {url}: {error}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("reading reply from {url}"))?;
        match serde_json::from_str::<InvocationResponse>(&body) {
            Ok(mut envelope) => {
                if envelope.agent_id.is_empty() {
                    envelope.agent_id = endpoint.to_string();
                }
                envelope.into_result()
            }
            Err(_) if !status.is_success() => Err(KernelError::InvocationFailed(format!(
                "POST {url} returned {status}"
            ))),
            Err(error) => Err(KernelError::InvocationFailed(format!(
                "malformed reply from {url}: {error}"
            ))),
        }
    }

    pub async fn send_message(&self, endpoint: &str, message: &AgentMessage) -> Result<()> {
        let url = route(endpoint, "message")?;
        let response = self
            .client
            .post(url.clone())
            .timeout(self.timeout)
            .json(message)
            .send()
            .await
            .map_err(|error| KernelError::InvocationFailed(format!("POST {url}: {error}")))?;
        if !response.status().is_success() {
            return Err(KernelError::InvocationFailed(format!(
                "POST {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Resolve `path` under `endpoint`, keeping any path prefix the endpoint has.
fn route(endpoint: &str, path: &str) -> Result<url::Url> {
    let base = format!("{}/", endpoint.trim_end_matches('/'));
    url::Url::parse(&base)
        .and_then(|base| base.join(path))
        .map_err(|error| {
            KernelError::InvalidRequest(format!("invalid endpoint {endpoint}: {error}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn route_keeps_path_prefix() {
        assert_eq!(
            route("https://host.example/agents/a", "invoke").unwrap().as_str(),
            "https://host.example/agents/a/invoke"
        );
        assert_eq!(
            route("https://host.example/", "health").unwrap().as_str(),
            "https://host.example/health"
        );
        assert!(route("nope", "health").is_err());
    }

    #[tokio::test]
    async fn fetch_info_reads_agent_card() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/agent-info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "translator",
                "capabilities": ["translate"],
                "acceptsMessages": false
            })))
            .mount(&server)
            .await;

        let info = RemoteAgentClient::default()
            .fetch_info(&server.uri())
            .await
            .unwrap();
        assert_eq!(info.name, "translator");
        assert!(info.accepts_invocations);
        assert!(!info.accepts_messages);
    }

    #[tokio::test]
    async fn health_is_false_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        assert!(!RemoteAgentClient::default().health(&server.uri()).await);
    }

    #[tokio::test]
    async fn invoke_posts_request_and_unwraps_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .and(body_partial_json(json!({"from": "caller", "task": "echo"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"echo": 1}
            })))
            .mount(&server)
            .await;

        let value = RemoteAgentClient::default()
            .invoke(
                &server.uri(),
                "caller",
                "https://a.example",
                &InvocationRequest::new("echo", json!(1)),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"echo": 1}));
    }

    #[tokio::test]
    async fn invoke_maps_remote_error_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "success": false,
                "error": {"code": "permission_denied", "message": "no"}
            })))
            .mount(&server)
            .await;

        let err = RemoteAgentClient::default()
            .invoke(
                &server.uri(),
                "caller",
                "https://a.example",
                &InvocationRequest::new("x", Value::Null),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn slow_remote_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(json!({"success": true})),
            )
            .mount(&server)
            .await;

        let err = RemoteAgentClient::default()
            .invoke(
                &server.uri(),
                "caller",
                "https://a.example",
                &InvocationRequest::new("x", Value::Null),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::InvocationTimeout { .. }));
    }

    #[tokio::test]
    async fn send_message_fails_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let message = AgentMessage {
            id: "m1".into(),
            from: "a".into(),
            to: "b".into(),
            from_origin: "https://a.example".into(),
            payload: json!({"hi": true}),
            sent_at: chrono::Utc::now(),
        };
        let err = RemoteAgentClient::default()
            .send_message(&server.uri(), &message)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
