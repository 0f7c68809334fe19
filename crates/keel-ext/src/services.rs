//! Interfaces to host collaborators that live outside the runtime.
//!
//! Extensions never see these directly; they reach them only through the
//! permission-checked wrappers on [`ExtensionContext`](crate::ExtensionContext).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use keel_core::{KeelError, Result};

fn not_configured(service: &str) -> KeelError {
    KeelError::Service {
        service: service.to_string(),
        reason: "not configured in this host".into(),
    }
}

/// Read-only blockchain state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Balance of `address` in the chain's smallest unit, as a decimal string.
    async fn balance(&self, address: &str) -> Result<String>;
    /// Generic read-only RPC call.
    async fn query(&self, method: &str, params: Value) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from: String,
    pub to: String,
    /// Amount in the chain's smallest unit, as a decimal string.
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    /// Submit a transaction; returns its hash.
    async fn submit(&self, tx: TransactionRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub name: String,
    pub address: String,
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<AccountSummary>>;
}

/// Read-only questions about the credential vault. Key material never
/// crosses this interface.
#[async_trait]
pub trait KeyVault: Send + Sync {
    async fn has_key(&self, account: &str) -> Result<bool>;
    async fn key_ids(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Defaults to GET when empty.
    #[serde(default)]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// Set when the body was cut off at the size cap.
    #[serde(default)]
    pub truncated: bool,
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// User-facing output and simple prompts.
#[async_trait]
pub trait PromptService: Send + Sync {
    fn output(&self, extension: &str, text: &str);
    async fn confirm(&self, extension: &str, question: &str) -> Result<bool>;
}

// ── Defaults ───────────────────────────────────────────────────

/// Stands in for any collaborator the host did not wire up.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

#[async_trait]
impl ChainReader for Unavailable {
    async fn balance(&self, _address: &str) -> Result<String> {
        Err(not_configured("chain"))
    }
    async fn query(&self, _method: &str, _params: Value) -> Result<Value> {
        Err(not_configured("chain"))
    }
}

#[async_trait]
impl TransactionSubmitter for Unavailable {
    async fn submit(&self, _tx: TransactionRequest) -> Result<String> {
        Err(not_configured("transactions"))
    }
}

#[async_trait]
impl AccountDirectory for Unavailable {
    async fn list_accounts(&self) -> Result<Vec<AccountSummary>> {
        Err(not_configured("accounts"))
    }
}

#[async_trait]
impl KeyVault for Unavailable {
    async fn has_key(&self, _account: &str) -> Result<bool> {
        Err(not_configured("vault"))
    }
    async fn key_ids(&self) -> Result<Vec<String>> {
        Err(not_configured("vault"))
    }
}

#[async_trait]
impl NetworkClient for Unavailable {
    async fn fetch(&self, _request: HttpRequest) -> Result<HttpResponse> {
        Err(not_configured("network"))
    }
}

/// Sends extension output to the log and declines every prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPrompt;

#[async_trait]
impl PromptService for LogPrompt {
    fn output(&self, extension: &str, text: &str) {
        info!(extension, "{}", text);
    }

    async fn confirm(&self, extension: &str, question: &str) -> Result<bool> {
        info!(extension, question, "no interactive prompt available, declining");
        Ok(false)
    }
}

/// Every collaborator the capability context can delegate to.
#[derive(Clone)]
pub struct HostServices {
    pub chain: Arc<dyn ChainReader>,
    pub transactions: Arc<dyn TransactionSubmitter>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub vault: Arc<dyn KeyVault>,
    pub network: Arc<dyn NetworkClient>,
    pub prompt: Arc<dyn PromptService>,
}

impl Default for HostServices {
    fn default() -> Self {
        Self {
            chain: Arc::new(Unavailable),
            transactions: Arc::new(Unavailable),
            accounts: Arc::new(Unavailable),
            vault: Arc::new(Unavailable),
            network: Arc::new(Unavailable),
            prompt: Arc::new(LogPrompt),
        }
    }
}

// ── HTTP ───────────────────────────────────────────────────────

/// Outbound HTTP for extensions holding the `network` permission.
pub struct HttpNetworkClient {
    client: reqwest::Client,
    max_response_bytes: usize,
}

fn network_error(reason: impl Into<String>) -> KeelError {
    KeelError::Service {
        service: "network".into(),
        reason: reason.into(),
    }
}

impl HttpNetworkClient {
    pub fn new(timeout: Duration, max_response_bytes: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| network_error(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_response_bytes,
        })
    }

    pub fn from_config(config: &keel_config::ServicesConfig) -> Result<Self> {
        Self::new(
            Duration::from_secs(config.http_timeout_secs),
            config.max_response_bytes,
        )
    }

    /// Only plain http(s) URLs are allowed.
    pub fn parse_url(raw: &str) -> Result<url::Url> {
        let url = url::Url::parse(raw).map_err(|e| network_error(format!("invalid URL '{raw}': {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(network_error(format!("scheme '{other}' is not allowed"))),
        }
    }
}

/// Response body collector that stops growing at `cap` bytes.
#[derive(Debug)]
struct CappedBody {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBody {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append a chunk. Returns `false` once the cap is hit and reading should stop.
    fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.cap - self.buf.len();
        if chunk.len() > room {
            self.buf.extend_from_slice(&chunk[..room]);
            self.truncated = true;
            return false;
        }
        self.buf.extend_from_slice(chunk);
        true
    }

    fn into_response(self, status: u16) -> HttpResponse {
        HttpResponse {
            status,
            body: String::from_utf8_lossy(&self.buf).into_owned(),
            truncated: self.truncated,
        }
    }
}

#[async_trait]
impl NetworkClient for HttpNetworkClient {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = Self::parse_url(&request.url)?;
        let method = if request.method.is_empty() {
            reqwest::Method::GET
        } else {
            reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
                .map_err(|e| network_error(format!("invalid method '{}': {e}", request.method)))?
        };

        debug!(%method, %url, "extension fetch");
        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut resp = builder.send().await.map_err(|e| network_error(e.to_string()))?;
        let status = resp.status().as_u16();

        // Read incrementally so an oversized body is never held in memory.
        let mut body = CappedBody::new(self.max_response_bytes);
        while let Some(chunk) = resp.chunk().await.map_err(|e| network_error(e.to_string()))? {
            if !body.push(&chunk) {
                info!(%status, cap = self.max_response_bytes, "response truncated at size cap");
                break;
            }
        }
        Ok(body.into_response(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_services_report_not_configured() {
        let services = HostServices::default();
        let err = services.chain.balance("0xabc").await.unwrap_err();
        assert!(matches!(err, KeelError::Service { ref service, .. } if service == "chain"));
        assert!(services.accounts.list_accounts().await.is_err());
        assert!(services.vault.key_ids().await.is_err());
    }

    #[tokio::test]
    async fn log_prompt_declines() {
        assert!(!LogPrompt.confirm("demo", "proceed?").await.unwrap());
    }

    #[test]
    fn only_http_schemes_are_allowed() {
        assert!(HttpNetworkClient::parse_url("https://example.com/x").is_ok());
        assert!(HttpNetworkClient::parse_url("http://127.0.0.1:8545").is_ok());
        assert!(HttpNetworkClient::parse_url("file:///etc/passwd").is_err());
        assert!(HttpNetworkClient::parse_url("not a url").is_err());
    }

    #[test]
    fn capped_body_stops_at_the_cap() {
        let mut body = CappedBody::new(10);
        assert!(body.push(b"hello"));
        assert!(body.push(b"world"));
        assert!(!body.truncated);
        assert!(!body.push(b"!"));
        let resp = body.into_response(200);
        assert_eq!(resp.body, "helloworld");
        assert!(resp.truncated);

        let mut body = CappedBody::new(4);
        assert!(!body.push(b"overflow"));
        assert_eq!(body.buf, b"over");
    }

    #[tokio::test]
    async fn fetch_truncates_large_bodies() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let body = vec![b'a'; 256 * 1024];
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            // The client hangs up once it has enough.
            let _ = socket.write_all(&body).await;
        });

        let client = HttpNetworkClient::new(Duration::from_secs(5), 1024).unwrap();
        let resp = client
            .fetch(HttpRequest {
                url: format!("http://{addr}/big"),
                ..HttpRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.truncated);
        assert_eq!(resp.body.len(), 1024);
    }

    #[test]
    fn transaction_request_serde() {
        let tx: TransactionRequest =
            serde_json::from_str(r#"{"from":"0x1","to":"0x2","value":"10"}"#).unwrap();
        assert_eq!(tx.value, "10");
        assert!(tx.data.is_none());
    }
}
