//! Outbound calls: one request per user turn, to whichever backend is configured.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, Config};
use crate::error::ChatError;
use crate::session::{Author, ChatMessage};

pub const SYSTEM_PROMPT: &str = "You are a helpful medical AI assistant. You provide general medical information and guidance, but you are not a replacement for professional medical advice. Always remind users to consult with healthcare professionals for serious health concerns. Be empathetic, accurate, and helpful while maintaining appropriate medical disclaimers.";

/// Body of one backend reply, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    body: String,
    decoded: bool,
}

impl RawResponse {
    pub fn new(body: impl Into<String>) -> Self {
        RawResponse { body: body.into(), decoded: false }
    }

    /// Answer text already taken out of its envelope; shown verbatim.
    pub fn decoded(text: impl Into<String>) -> Self {
        RawResponse { body: text.into(), decoded: true }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    async fn read(response: reqwest::Response) -> Result<Self, ChatError> {
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let detail = String::from_utf8_lossy(&bytes).chars().take(200).collect::<String>();
            return Err(ChatError::Backend {
                status: status.as_u16(),
                detail: if detail.is_empty() { status_reason(status) } else { detail },
            });
        }

        String::from_utf8(bytes.to_vec())
            .map(RawResponse::new)
            .map_err(|_| ChatError::Undecodable)
    }
}

fn status_reason(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("unknown status").to_string()
}

/// Anything that can answer a query given the conversation so far.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Models the user can pick from; empty when the backend doesn't expose a choice.
    fn models(&self) -> &[String];

    async fn send(
        &self,
        context: &[ChatMessage],
        query: &str,
        model: Option<&str>,
    ) -> Result<RawResponse, ChatError>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<CompletionMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct CompletionMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completion endpoint. Sends the whole transcript.
pub struct CompletionBackend {
    base_url: String,
    api_key: String,
    models: Vec<String>,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl CompletionBackend {
    pub fn with_config(
        base_url: String,
        api_key: String,
        models: Vec<String>,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        Ok(CompletionBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            models,
            max_tokens,
            temperature,
            client: http_client(timeout)?,
        })
    }

    fn build_request<'a>(
        &'a self,
        context: &'a [ChatMessage],
        query: &'a str,
        model: &'a str,
    ) -> CompletionRequest<'a> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(CompletionMessage { role: "system", content: SYSTEM_PROMPT });
        messages.extend(context.iter().map(|m| CompletionMessage {
            role: match m.author() {
                Author::User => "user",
                Author::Bot => "assistant",
            },
            content: m.content(),
        }));

        // The caller normally appended the query already; don't send it twice.
        let last_is_query = context
            .last()
            .map(|m| m.author() == Author::User && m.content() == query)
            .unwrap_or(false);
        if !last_is_query {
            messages.push(CompletionMessage { role: "user", content: query });
        }

        CompletionRequest {
            model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[async_trait]
impl Backend for CompletionBackend {
    fn kind(&self) -> &'static str {
        "completion"
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn send(
        &self,
        context: &[ChatMessage],
        query: &str,
        model: Option<&str>,
    ) -> Result<RawResponse, ChatError> {
        let model = model
            .or_else(|| self.models.first().map(String::as_str))
            .unwrap_or("gpt-3.5-turbo");
        let request = self.build_request(context, query, model);
        info!(model, messages = request.messages.len(), "sending chat completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let raw = RawResponse::read(response).await?;
        match serde_json::from_str::<CompletionResponse>(raw.body()) {
            Ok(completion) => {
                let content = completion
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                Ok(RawResponse::decoded(content))
            }
            Err(e) => {
                warn!("unexpected completion payload ({}), falling back to raw body", e);
                Ok(raw)
            }
        }
    }
}

/// Remote query service. Only the latest user text goes out; the service keeps
/// whatever memory it has on its own side.
pub struct ProxyBackend {
    endpoint: String,
    user_id: u64,
    send_system_summary: bool,
    client: reqwest::Client,
}

impl ProxyBackend {
    pub fn with_config(
        endpoint: String,
        user_id: u64,
        send_system_summary: bool,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        Ok(ProxyBackend {
            endpoint,
            user_id,
            send_system_summary,
            client: http_client(timeout)?,
        })
    }

    fn query_params(&self, query: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![("query", query.to_string()), ("user_id", self.user_id.to_string())];
        if self.send_system_summary {
            params.push(("system_summary", SYSTEM_PROMPT.to_string()));
        }
        params
    }
}

#[async_trait]
impl Backend for ProxyBackend {
    fn kind(&self) -> &'static str {
        "proxy"
    }

    fn models(&self) -> &[String] {
        &[]
    }

    async fn send(
        &self,
        _context: &[ChatMessage],
        query: &str,
        _model: Option<&str>,
    ) -> Result<RawResponse, ChatError> {
        info!(endpoint = %self.endpoint, "sending query");
        let response = self
            .client
            .get(&self.endpoint)
            .query(&self.query_params(query))
            .send()
            .await?;

        RawResponse::read(response).await
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, ChatError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ChatError::network(format!("could not build HTTP client: {}", e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_retries: 0, backoff: Duration::from_millis(500) }
    }
}

/// A backend plus the retry policy wrapped around it.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, retry: RetryPolicy) -> Self {
        Dispatcher { backend, retry }
    }

    pub fn from_config(config: &Config, api_key: Option<String>) -> Result<Self, ChatError> {
        let retry = RetryPolicy {
            max_retries: config.request.max_retries,
            backoff: config.request.retry_backoff(),
        };
        Ok(Dispatcher::new(build_backend(config, api_key)?, retry))
    }

    pub fn models(&self) -> &[String] {
        self.backend.models()
    }

    pub async fn dispatch(
        &self,
        context: &[ChatMessage],
        query: &str,
        model: Option<&str>,
    ) -> Result<RawResponse, ChatError> {
        let mut attempt = 0;
        loop {
            debug!(backend = self.backend.kind(), attempt, context = context.len(), "dispatching");
            match self.backend.send(context, query, model).await {
                Ok(raw) => return Ok(raw),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, max = self.retry.max_retries, "retrying request");
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(e) => {
                    warn!(backend = self.backend.kind(), error = %e, "request failed");
                    return Err(e);
                }
            }
        }
    }
}

pub fn build_backend(config: &Config, api_key: Option<String>) -> Result<Arc<dyn Backend>, ChatError> {
    let timeout = config.request.timeout();
    Ok(match &config.backend {
        BackendConfig::Completion { base_url, models, max_tokens, temperature, .. } => {
            Arc::new(CompletionBackend::with_config(
                base_url.clone(),
                api_key.unwrap_or_default(),
                models.clone(),
                *max_tokens,
                *temperature,
                timeout,
            )?)
        }
        BackendConfig::Proxy { endpoint, user_id, send_system_summary } => Arc::new(
            ProxyBackend::with_config(endpoint.clone(), *user_id, *send_system_summary, timeout)?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serves `responses` in order, one connection each, and reports every raw request.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let _ = tx.send(request);
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), rx)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn proxy(endpoint: String, timeout: Duration) -> ProxyBackend {
        ProxyBackend::with_config(endpoint, 1, false, timeout).unwrap()
    }

    #[tokio::test]
    async fn test_proxy_sends_query_params() {
        let (base, mut requests) = serve(vec![(200, "\"Olá\"")]).await;
        let backend = proxy(format!("{}/ai", base), Duration::from_secs(5));

        let raw = backend.send(&[], "dor de cabeça", None).await.unwrap();
        assert_eq!(raw.body(), "\"Olá\"");

        let request = requests.recv().await.unwrap();
        let request_line = request.lines().next().unwrap();
        assert!(request_line.starts_with("GET /ai?query="), "{}", request_line);
        assert!(request_line.contains("user_id=1"));
        assert!(!request_line.contains("system_summary"));
    }

    #[tokio::test]
    async fn test_proxy_can_send_system_summary() {
        let (base, mut requests) = serve(vec![(200, "ok")]).await;
        let backend = ProxyBackend::with_config(base, 3, true, Duration::from_secs(5)).unwrap();
        backend.send(&[], "hi", None).await.unwrap();

        let request = requests.recv().await.unwrap();
        assert!(request.lines().next().unwrap().contains("system_summary="));
        assert!(request.contains("user_id=3"));
    }

    #[tokio::test]
    async fn test_server_error_is_backend_error() {
        let (base, _requests) = serve(vec![(500, "Internal Server Error")]).await;
        let err = proxy(base, Duration::from_secs(5)).send(&[], "q", None).await.unwrap_err();
        assert_eq!(
            err,
            ChatError::Backend { status: 500, detail: "Internal Server Error".into() }
        );
    }

    #[tokio::test]
    async fn test_timeout_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = proxy(format!("http://{}", addr), Duration::from_millis(200))
            .send(&[], "q", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Network { .. }), "{:?}", err);
        assert!(err.is_retryable());
        assert_eq!(
            crate::normalize::reply_for(Err(err)).content(),
            crate::normalize::ERROR_NOTICE
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = proxy(format!("http://{}", addr), Duration::from_secs(2))
            .send(&[], "q", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Network { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_completion_request_and_reply() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Rest and fluids."}}]}"#;
        let (base, mut requests) = serve(vec![(200, body)]).await;
        let backend = CompletionBackend::with_config(
            base,
            "sk-test".into(),
            vec!["gpt-3.5-turbo".into(), "gpt-4".into()],
            1000,
            0.7,
            Duration::from_secs(5),
        )
        .unwrap();

        let context = vec![ChatMessage::user("I have a cold")];
        let raw = backend.send(&context, "I have a cold", Some("gpt-4")).await.unwrap();
        assert_eq!(raw.body(), "Rest and fluids.");
        assert!(raw.is_decoded());

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("POST /chat/completions"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));

        let json_start = request.find("\r\n\r\n").unwrap() + 4;
        let payload: serde_json::Value = serde_json::from_str(&request[json_start..]).unwrap();
        assert_eq!(payload["model"], "gpt-4");
        assert_eq!(payload["max_tokens"], 1000);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "I have a cold");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_completion_unexpected_payload_degrades_to_raw_body() {
        let (base, _requests) = serve(vec![(200, "plain words")]).await;
        let backend = CompletionBackend::with_config(
            base,
            "k".into(),
            vec!["m".into()],
            1000,
            0.7,
            Duration::from_secs(5),
        )
        .unwrap();
        let raw = backend.send(&[], "q", None).await.unwrap();
        assert_eq!(raw.body(), "plain words");
        assert!(!raw.is_decoded());
    }

    #[tokio::test]
    async fn test_completion_json_answer_is_shown_verbatim() {
        let body = r#"{"choices":[{"message":{"content":"{\"message\": \"hello\", \"code\": 1}"}}]}"#;
        let (base, _requests) = serve(vec![(200, body)]).await;
        let backend = CompletionBackend::with_config(
            base,
            "k".into(),
            vec!["m".into()],
            1000,
            0.7,
            Duration::from_secs(5),
        )
        .unwrap();

        let raw = backend.send(&[], "q", None).await.unwrap();
        let reply = crate::normalize::reply_for(Ok(raw));
        assert_eq!(reply.content(), r#"{"message": "hello", "code": 1}"#);
    }

    #[test]
    fn test_completion_forwards_roles_in_order() {
        let backend = CompletionBackend::with_config(
            "http://localhost/v1/".into(),
            "k".into(),
            vec!["m".into()],
            1000,
            0.7,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(backend.base_url, "http://localhost/v1");

        let context = vec![ChatMessage::user("a"), ChatMessage::bot("b")];
        let request = backend.build_request(&context, "c", "m");
        let roles: Vec<_> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
    }

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        error: ChatError,
    }

    #[async_trait]
    impl Backend for Flaky {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        fn models(&self) -> &[String] {
            &[]
        }

        async fn send(&self, _: &[ChatMessage], _: &str, _: Option<&str>) -> Result<RawResponse, ChatError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(RawResponse::new("done"))
            }
        }
    }

    fn flaky(failures: usize, error: ChatError) -> Arc<Flaky> {
        Arc::new(Flaky { calls: AtomicUsize::new(0), failures, error })
    }

    #[tokio::test]
    async fn test_no_retries_by_default() {
        let backend = flaky(1, ChatError::network("refused"));
        let dispatcher = Dispatcher::new(backend.clone(), RetryPolicy::default());

        assert!(dispatcher.dispatch(&[], "q", None).await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_retryable_errors() {
        let backend = flaky(2, ChatError::Backend { status: 502, detail: String::new() });
        let policy = RetryPolicy { max_retries: 2, backoff: Duration::from_millis(1) };
        let dispatcher = Dispatcher::new(backend.clone(), policy);

        let raw = dispatcher.dispatch(&[], "q", None).await.unwrap();
        assert_eq!(raw.body(), "done");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let backend = flaky(5, ChatError::Backend { status: 401, detail: String::new() });
        let policy = RetryPolicy { max_retries: 3, backoff: Duration::from_millis(1) };
        let dispatcher = Dispatcher::new(backend.clone(), policy);

        assert!(dispatcher.dispatch(&[], "q", None).await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_build_backend_from_config() {
        let config = Config::from_toml_str("[backend]\nkind = \"proxy\"\n").unwrap();
        let dispatcher = Dispatcher::from_config(&config, None).unwrap();
        assert!(dispatcher.models().is_empty());

        let dispatcher = Dispatcher::from_config(&Config::default(), Some("k".into())).unwrap();
        assert_eq!(dispatcher.models(), ["gpt-3.5-turbo".to_string(), "gpt-4".to_string()]);
    }
}
