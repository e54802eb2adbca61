//! Remote block API client.
//!
//! One `POST {node_url}/api/v1/block` per height. The block hash reported by
//! the node becomes the record identity as-is.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::ConfigError;
use crate::record::{BlockPayload, StateChangeRecord};
use crate::retry::{RetryPolicy, Retryable, with_retry};

const BLOCK_ENDPOINT: &str = "/api/v1/block";
const HASH_LEN: usize = 32;

/// `[remote]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the node serving the block API.
    pub node_url: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Attempts per height for transient failures (1 disables retries).
    pub fetch_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            node_url: "http://localhost:17001".to_string(),
            timeout_secs: 30,
            fetch_attempts: 3,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.node_url.trim();
        if url.is_empty() {
            return Err(ConfigError::ValidationError(
                "remote.node_url must be non-empty".to_string(),
            ));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "remote.node_url must start with http:// or https:// (got {url})"
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "remote.timeout_secs must be >= 1".to_string(),
            ));
        }
        if self.fetch_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "remote.fetch_attempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_initial_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            2.0,
            0.1,
            self.fetch_attempts,
        )
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}{BLOCK_ENDPOINT}", self.node_url.trim().trim_end_matches('/'))
    }
}

/// Failure to fetch one height.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Worth retrying: connect errors, timeouts, 5xx, 429.
    #[error("transient failure fetching height {height}: {reason}")]
    Transient { height: u64, reason: String },

    /// Retrying cannot help: other 4xx, malformed or mismatched responses.
    #[error("permanent failure fetching height {height}: {reason}")]
    Permanent { height: u64, reason: String },
}

impl FetchError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    #[must_use]
    pub fn height(&self) -> u64 {
        match self {
            Self::Transient { height, .. } | Self::Permanent { height, .. } => *height,
        }
    }

    fn permanent(height: u64, reason: impl Into<String>) -> Self {
        Self::Permanent {
            height,
            reason: reason.into(),
        }
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Source of single blocks by height.
pub trait BlockFetcher: Send + Sync {
    fn fetch(
        &self,
        height: u64,
    ) -> impl Future<Output = Result<StateChangeRecord, FetchError>> + Send;
}

/// HTTP client for the node's block endpoint.
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    client: Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl RemoteFetcher {
    pub fn new(config: &RemoteConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| crate::Error::Runtime(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint(),
            retry: config.retry_policy(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// One request, no retries.
    pub async fn fetch_once(&self, height: u64) -> Result<StateChangeRecord, FetchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "Height": height, "FullBlock": true }))
            .send()
            .await
            .map_err(|err| classify_transport_error(height, &err))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| classify_transport_error(height, &err))?;

        parse_block_response(height, status, &body)
    }
}

impl BlockFetcher for RemoteFetcher {
    async fn fetch(&self, height: u64) -> Result<StateChangeRecord, FetchError> {
        let record = with_retry(&self.retry, || self.fetch_once(height)).await?;
        debug!(height, hash = %record.key_hex(), "fetched block");
        Ok(record)
    }
}

fn classify_transport_error(height: u64, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient {
            height,
            reason: err.to_string(),
        }
    } else {
        FetchError::permanent(height, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlockResponse {
    #[serde(default)]
    header: Option<HeaderResponse>,
    #[serde(default)]
    transactions: Option<Vec<TransactionResponse>>,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HeaderResponse {
    block_hash_hex: String,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    prev_block_hash_hex: String,
    #[serde(default)]
    transaction_merkle_root_hex: String,
    #[serde(default)]
    tstamp_nano_secs: i64,
    height: u64,
    #[serde(default)]
    nonce: u64,
    #[serde(default)]
    extra_nonce: u64,
    #[serde(default)]
    proposed_in_view: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TransactionResponse {
    raw_transaction_hex: String,
}

/// Map an HTTP status and body to a block record or a classified error.
pub fn parse_block_response(
    height: u64,
    status: StatusCode,
    body: &[u8],
) -> Result<StateChangeRecord, FetchError> {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(FetchError::Transient {
            height,
            reason: format!("HTTP {status}"),
        });
    }
    if !status.is_success() {
        let snippet = String::from_utf8_lossy(&body[..body.len().min(200)]).into_owned();
        return Err(FetchError::permanent(
            height,
            format!("HTTP {status}: {snippet}"),
        ));
    }

    let response: BlockResponse = serde_json::from_slice(body)
        .map_err(|err| FetchError::permanent(height, format!("malformed response: {err}")))?;
    if !response.error.is_empty() {
        return Err(FetchError::permanent(height, format!("node error: {}", response.error)));
    }
    let Some(header) = response.header else {
        return Err(FetchError::permanent(height, "response has no header"));
    };
    if header.height != height {
        return Err(FetchError::permanent(
            height,
            format!("node returned height {} for request {height}", header.height),
        ));
    }

    let block_hash = decode_hash(height, "BlockHashHex", &header.block_hash_hex, false)?;
    let prev_block_hash = decode_hash(height, "PrevBlockHashHex", &header.prev_block_hash_hex, true)?;
    let txn_merkle_root = decode_hash(
        height,
        "TransactionMerkleRootHex",
        &header.transaction_merkle_root_hex,
        true,
    )?;

    let transactions = response
        .transactions
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, txn)| {
            hex::decode(&txn.raw_transaction_hex).map_err(|err| {
                FetchError::permanent(height, format!("transaction {index} is not hex: {err}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StateChangeRecord::block(
        block_hash,
        BlockPayload {
            version: header.version,
            prev_block_hash,
            txn_merkle_root,
            timestamp_nanos: header.tstamp_nano_secs,
            height: header.height,
            nonce: header.nonce,
            extra_nonce: header.extra_nonce,
            proposed_in_view: header.proposed_in_view,
            transactions,
        },
    ))
}

fn decode_hash(height: u64, field: &str, text: &str, allow_empty: bool) -> Result<Vec<u8>, FetchError> {
    if text.is_empty() && allow_empty {
        return Ok(Vec::new());
    }
    let bytes = hex::decode(text)
        .map_err(|err| FetchError::permanent(height, format!("{field} is not hex: {err}")))?;
    if bytes.len() != HASH_LEN {
        return Err(FetchError::permanent(
            height,
            format!("{field} has {} bytes, expected {HASH_LEN}", bytes.len()),
        ));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn block_json(height: u64) -> String {
        serde_json::json!({
            "Header": {
                "BlockHashHex": "ab".repeat(32),
                "Version": 1,
                "PrevBlockHashHex": "cd".repeat(32),
                "TransactionMerkleRootHex": "ef".repeat(32),
                "TstampNanoSecs": 1_700_000_000_000_000_000i64,
                "Height": height,
                "Nonce": 5,
                "ExtraNonce": 6,
                "ProposedInView": 7
            },
            "Transactions": [{"RawTransactionHex": "0102"}, {"RawTransactionHex": "03"}],
            "Error": ""
        })
        .to_string()
    }

    #[test]
    fn parses_full_block() {
        let record = parse_block_response(8452, StatusCode::OK, block_json(8452).as_bytes()).unwrap();
        assert_eq!(record.height, 8452);
        assert_eq!(record.key_bytes, vec![0xab; 32]);
        let block = record.block.unwrap();
        assert_eq!(block.prev_block_hash, vec![0xcd; 32]);
        assert_eq!(block.transactions, vec![vec![1, 2], vec![3]]);
        assert_eq!(block.proposed_in_view, 7);
    }

    #[test]
    fn genesis_block_may_lack_prev_hash() {
        let body = serde_json::json!({
            "Header": {"BlockHashHex": "11".repeat(32), "Height": 0},
            "Transactions": null
        })
        .to_string();
        let record = parse_block_response(0, StatusCode::OK, body.as_bytes()).unwrap();
        let block = record.block.unwrap();
        assert!(block.prev_block_hash.is_empty());
        assert!(block.transactions.is_empty());
    }

    #[test]
    fn classifies_http_status() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = parse_block_response(1, status, b"").unwrap_err();
            assert!(err.is_transient(), "{status} should be transient");
        }
        for status in [StatusCode::BAD_REQUEST, StatusCode::NOT_FOUND] {
            let err = parse_block_response(1, status, b"nope").unwrap_err();
            assert!(!err.is_transient(), "{status} should be permanent");
            assert_eq!(err.height(), 1);
        }
    }

    #[test]
    fn rejects_bad_payloads_permanently() {
        let cases = [
            "not json".to_string(),
            r#"{"Error":"Block not found"}"#.to_string(),
            r#"{"Header":null}"#.to_string(),
            block_json(9),
            block_json(3).replace(&"ab".repeat(32), "abcd"),
            block_json(3).replace("0102", "zz"),
        ];
        for body in cases {
            let err = parse_block_response(3, StatusCode::OK, body.as_bytes()).unwrap_err();
            assert!(
                matches!(err, FetchError::Permanent { height: 3, .. }),
                "expected permanent for {body}: {err:?}"
            );
        }
    }

    #[test]
    fn height_mismatch_message() {
        let err = parse_block_response(3, StatusCode::OK, block_json(9).as_bytes()).unwrap_err();
        assert!(err.to_string().contains("node returned height 9 for request 3"));
    }

    #[test]
    fn config_endpoint_and_validation() {
        let config = RemoteConfig {
            node_url: "http://node:17001/".to_string(),
            ..RemoteConfig::default()
        };
        assert_eq!(config.endpoint(), "http://node:17001/api/v1/block");
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_policy().max_attempts, 3);

        for bad in [
            RemoteConfig {
                node_url: String::new(),
                ..RemoteConfig::default()
            },
            RemoteConfig {
                node_url: "node:17001".to_string(),
                ..RemoteConfig::default()
            },
            RemoteConfig {
                timeout_secs: 0,
                ..RemoteConfig::default()
            },
            RemoteConfig {
                fetch_attempts: 0,
                ..RemoteConfig::default()
            },
        ] {
            assert!(bad.validate().is_err(), "{bad:?} should be rejected");
        }
    }

    /// Serve canned responses in order, one per connection.
    async fn serve(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap();
                    read += n;
                    let text = String::from_utf8_lossy(&buf[..read]);
                    if let Some(idx) = text.find("\r\n\r\n") {
                        let content_length = text[..idx]
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if read >= idx + 4 + content_length {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                let reply = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn fast_config(node_url: String, attempts: u32) -> RemoteConfig {
        RemoteConfig {
            node_url,
            timeout_secs: 5,
            fetch_attempts: attempts,
            retry_initial_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn fetch_retries_server_errors() {
        let (url, hits) = serve(vec![(503, String::new()), (200, block_json(42))]).await;
        let fetcher = RemoteFetcher::new(&fast_config(url, 3)).unwrap();
        let record = fetcher.fetch(42).await.unwrap();
        assert_eq!(record.height, 42);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_does_not_retry_permanent_errors() {
        let (url, hits) = serve(vec![
            (200, r#"{"Error":"Block not found"}"#.to_string()),
            (200, block_json(42)),
        ])
        .await;
        let fetcher = RemoteFetcher::new(&fast_config(url, 3)).unwrap();
        let err = fetcher.fetch(42).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let fetcher = RemoteFetcher::new(&fast_config(format!("http://{addr}"), 2)).unwrap();
        let err = fetcher.fetch(1).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
