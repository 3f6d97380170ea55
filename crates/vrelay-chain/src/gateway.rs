//! HTTP client for a chain gateway.
//!
//! Endpoints:
//! - GET  /api/v1/block_number
//! - POST /api/v1/submit   (body: `TxRequest`)
//! - POST /api/v1/events   (body: `EventsQuery`)
//!
//! Protocol rejections come back as `{ "error": { "kind", "message" } }` and are
//! rebuilt into the same `RelayError` the chain produced.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vrelay_types::{
    BlockNumber, ChainId, ErrorKind, EventFilter, LoggedEvent, RelayError, Result,
};

use crate::{ChainClient, EventSubscription, Receipt, TxRequest};

/// Gateway API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse<T> {
    pub code: Option<i32>,
    pub message: Option<String>,
    pub data: Option<T>,
    pub error: Option<GatewayError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&RelayError> for GatewayError {
    fn from(e: &RelayError) -> Self {
        Self {
            kind: e.kind(),
            message: e.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsQuery {
    pub filter: EventFilter,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
}

/// Gateway client for one chain.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    chain_id: ChainId,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    poll_interval: Duration,
}

impl GatewayClient {
    pub fn new(chain_id: ChainId, base_url: &str, timeout_ms: Option<u64>) -> Self {
        let timeout_ms = timeout_ms.unwrap_or(30_000);
        Self {
            chain_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(1_000),
        }
    }

    /// How often `subscribe` polls the gateway for new events.
    pub fn with_poll_interval(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval = Duration::from_millis(poll_interval_ms);
        self
    }

    async fn read<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        let body: Option<GatewayResponse<T>> = resp.json().await.ok();

        match body {
            Some(GatewayResponse {
                error: Some(err), ..
            }) => Err(RelayError::from_parts(err.kind, err.message)),
            Some(GatewayResponse { data: Some(data), .. }) if status.is_success() => Ok(data),
            Some(GatewayResponse { message, .. }) if !status.is_success() => {
                Err(RelayError::Transport(format!(
                    "gateway returned status {}: {}",
                    status,
                    message.unwrap_or_default()
                )))
            }
            None if !status.is_success() => Err(RelayError::Transport(format!(
                "gateway returned status {}",
                status
            ))),
            _ => Err(RelayError::Codec(
                "gateway response carries neither data nor error".into(),
            )),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("gateway request failed: {}", e)))?;
        self.read(resp).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("gateway request failed: {}", e)))?;
        self.read(resp).await
    }
}

#[async_trait]
impl ChainClient for GatewayClient {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn block_number(&self) -> Result<BlockNumber> {
        self.get("/api/v1/block_number").await
    }

    async fn submit(&self, tx: TxRequest) -> Result<Receipt> {
        debug!(chain_id = self.chain_id, call = tx.call.name(), "submitting to gateway");
        self.post("/api/v1/submit", &tx).await
    }

    async fn events(
        &self,
        filter: &EventFilter,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<LoggedEvent>> {
        let query = EventsQuery {
            filter: filter.clone(),
            from_block: from,
            to_block: to,
        };
        self.post("/api/v1/events", &query).await
    }

    /// Poll-based: a background task pages new blocks and forwards matching
    /// events until the subscription is dropped. Events already in the head
    /// block at subscription time may be delivered too.
    async fn subscribe(&self, filter: EventFilter) -> Result<EventSubscription> {
        let (outbox, receiver) = mpsc::unbounded_channel();
        let client = self.clone();
        let mut next_block = self.block_number().await?;
        let mut last_index: Option<u64> = None;

        tokio::spawn(async move {
            loop {
                if outbox.is_closed() {
                    break;
                }
                let head = match client.block_number().await {
                    Ok(head) => head,
                    Err(e) => {
                        warn!(chain_id = client.chain_id, error = %e, "gateway poll failed");
                        tokio::time::sleep(client.poll_interval).await;
                        continue;
                    }
                };
                if head >= next_block {
                    match client.events(&filter, next_block, head).await {
                        Ok(events) => {
                            for event in events {
                                if last_index.is_some_and(|i| event.log_index <= i) {
                                    continue;
                                }
                                last_index = Some(event.log_index);
                                if outbox.send(event).is_err() {
                                    return;
                                }
                            }
                            // the head block may still grow; re-read it next round
                            next_block = head;
                        }
                        Err(e) => {
                            warn!(chain_id = client.chain_id, error = %e, "gateway event poll failed");
                        }
                    }
                }
                tokio::time::sleep(client.poll_interval).await;
            }
        });

        Ok(EventSubscription::from_receiver(receiver))
    }
}
