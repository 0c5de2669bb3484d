use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use notebook_protocol::{
    DocumentId, ExecutionServer, KernelChannel, KernelChannelSink, KernelChannelSource, KernelId,
    NotebookRuntimeError, NotebookRuntimeResult,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
struct CreateKernelRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateKernelResponse {
    id: String,
}

/// REST and channel client for one notebook server on a loopback port.
#[derive(Debug, Clone)]
pub struct JupyterClient {
    http: reqwest::Client,
    api_url: String,
    channel_url: String,
    token: Option<String>,
}

impl JupyterClient {
    /// `address` is `host:port` with no scheme.
    pub fn new(address: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: format!("http://{address}/api"),
            channel_url: format!("ws://{address}/api"),
            token,
        }
    }

    pub fn for_port(port: u16, token: Option<String>) -> Self {
        Self::new(&format!("127.0.0.1:{port}"), token)
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// The kernel's websocket endpoint with `session` as an encoded query value.
    fn channel_endpoint(
        &self,
        kernel_id: &KernelId,
        session: &DocumentId,
    ) -> NotebookRuntimeResult<reqwest::Url> {
        let invalid = |detail: String| {
            NotebookRuntimeError::Configuration(format!("invalid kernel channel url: {detail}"))
        };
        let mut url = reqwest::Url::parse(&self.channel_url)
            .map_err(|error| invalid(error.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid(self.channel_url.clone()))?
            .pop_if_empty()
            .extend(["kernels", kernel_id.as_str(), "channels"]);
        url.query_pairs_mut()
            .append_pair("session_id", session.as_str());
        Ok(url)
    }

    fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|token| format!("Token {token}"))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.authorization() {
            Some(value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        }
    }

    async fn expect_success(
        response: reqwest::Response,
        action: &str,
    ) -> NotebookRuntimeResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = sanitize_error_body(response.text().await.unwrap_or_default().as_str());
        Err(NotebookRuntimeError::Process(format!(
            "{action} failed with status {status}: {body}"
        )))
    }
}

#[async_trait]
impl ExecutionServer for JupyterClient {
    async fn create_kernel(&self, kernel_name: &str) -> NotebookRuntimeResult<KernelId> {
        let response = self
            .authorize(self.http.post(format!("{}/kernels", self.api_url)))
            .json(&CreateKernelRequest { name: kernel_name })
            .send()
            .await
            .map_err(|error| {
                NotebookRuntimeError::Process(format!("kernel create request failed: {error}"))
            })?;
        let response = Self::expect_success(response, "kernel create").await?;
        let created: CreateKernelResponse = response.json().await.map_err(|error| {
            NotebookRuntimeError::Protocol(format!("kernel create response parse failed: {error}"))
        })?;
        Ok(KernelId::new(created.id))
    }

    async fn delete_kernel(&self, kernel_id: &KernelId) -> NotebookRuntimeResult<()> {
        let response = self
            .authorize(
                self.http
                    .delete(format!("{}/kernels/{kernel_id}", self.api_url)),
            )
            .send()
            .await
            .map_err(|error| {
                NotebookRuntimeError::Process(format!("kernel delete request failed: {error}"))
            })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(kernel = %kernel_id, "kernel already gone");
            return Ok(());
        }
        Self::expect_success(response, "kernel delete").await?;
        Ok(())
    }

    async fn interrupt_kernel(&self, kernel_id: &KernelId) -> NotebookRuntimeResult<()> {
        let response = self
            .authorize(
                self.http
                    .post(format!("{}/kernels/{kernel_id}/interrupt", self.api_url)),
            )
            .send()
            .await
            .map_err(|error| {
                NotebookRuntimeError::Process(format!("kernel interrupt request failed: {error}"))
            })?;
        Self::expect_success(response, "kernel interrupt").await?;
        Ok(())
    }

    async fn open_channel(
        &self,
        kernel_id: &KernelId,
        session: &DocumentId,
    ) -> NotebookRuntimeResult<KernelChannel> {
        let url = self.channel_endpoint(kernel_id, session)?;
        let mut request = url.as_str().into_client_request().map_err(|error| {
            NotebookRuntimeError::Configuration(format!("invalid kernel channel url: {error}"))
        })?;
        if let Some(value) = self.authorization() {
            let value = HeaderValue::from_str(&value).map_err(|error| {
                NotebookRuntimeError::Configuration(format!("invalid server token: {error}"))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|error| {
                NotebookRuntimeError::Process(format!("kernel channel connect failed: {error}"))
            })?;
        let (sink, source) = stream.split();
        Ok(KernelChannel {
            sink: Box::new(WsChannelSink { sink }),
            source: Box::new(WsChannelSource { source }),
        })
    }
}

struct WsChannelSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl KernelChannelSink for WsChannelSink {
    async fn send_text(&mut self, text: String) -> NotebookRuntimeResult<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|error| NotebookRuntimeError::Process(format!("kernel channel send failed: {error}")))
    }

    async fn close(&mut self) -> NotebookRuntimeResult<()> {
        self.sink
            .close()
            .await
            .map_err(|error| NotebookRuntimeError::Process(format!("kernel channel close failed: {error}")))
    }
}

struct WsChannelSource {
    source: SplitStream<WsStream>,
}

#[async_trait]
impl KernelChannelSource for WsChannelSource {
    async fn next_text(&mut self) -> NotebookRuntimeResult<Option<String>> {
        while let Some(message) = self.source.next().await {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(Message::Binary(bytes)) => {
                    debug!(len = bytes.len(), "ignoring binary kernel frame");
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(error) => {
                    return Err(NotebookRuntimeError::Protocol(format!(
                        "kernel channel read failed: {error}"
                    )));
                }
            }
        }
        Ok(None)
    }
}

fn sanitize_error_body(body: &str) -> String {
    const LIMIT: usize = 256;
    let trimmed = body.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_owned();
    }
    let truncated: String = trimmed.chars().take(LIMIT).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use notebook_protocol::{DocumentId, KernelId};

    use super::{JupyterClient, sanitize_error_body};

    #[test]
    fn client_urls_target_loopback_api() {
        let client = JupyterClient::for_port(8899, Some("secret".to_owned()));
        assert_eq!(client.api_url(), "http://127.0.0.1:8899/api");
        assert_eq!(client.authorization().as_deref(), Some("Token secret"));
    }

    #[test]
    fn channel_endpoint_encodes_the_session_id() {
        let client = JupyterClient::for_port(8899, None);

        let url = client
            .channel_endpoint(&KernelId::new("kernel-1"), &DocumentId::new("doc 1&x=#y"))
            .expect("channel url");

        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8899/api/kernels/kernel-1/channels?session_id=doc+1%26x%3D%23y"
        );
        let (key, value) = url.query_pairs().next().expect("session pair");
        assert_eq!(key, "session_id");
        assert_eq!(value, "doc 1&x=#y");
    }

    #[test]
    fn error_bodies_are_trimmed_and_truncated() {
        assert_eq!(sanitize_error_body("  nope \n"), "nope");
        let long = "x".repeat(300);
        let sanitized = sanitize_error_body(&long);
        assert!(sanitized.ends_with("..."));
        assert_eq!(sanitized.len(), 259);
    }
}
