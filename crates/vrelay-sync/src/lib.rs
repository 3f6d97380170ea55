//! Sync engine for incremental event-log synchronization into an `EventStore`.
//!
//! Each chain's log is paged by block range from a persisted cursor. The head
//! block is re-read on the next pass, and the store drops the duplicates.
//!
//! [`stake_relay`] carries stake snapshots and slash reports between the hub
//! and the execution chains.

pub mod stake_relay;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vrelay_chain::ChainClient;
use vrelay_store::{EventStore, SyncCursor};
use vrelay_types::{BlockNumber, ChainId, EventFilter, Result};

pub use stake_relay::{RelayStats, StakeRelay};

/// Sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Blocks per `events` query.
    pub page_size: u64,
    pub poll_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 512,
            poll_ms: 15_000,
        }
    }
}

/// Sync status for a single chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChainStatus {
    pub chain_id: ChainId,
    pub synced_block: Option<BlockNumber>,
    pub head_block: BlockNumber,
}

/// Sync event for progress reporting.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Start {
        chain_id: ChainId,
    },
    Progress {
        chain_id: ChainId,
        to_block: BlockNumber,
        stored: usize,
    },
    Done {
        chain_id: ChainId,
        cursor: SyncCursor,
    },
    Error {
        chain_id: ChainId,
        message: String,
    },
}

/// Callback type for sync events.
pub type SyncEventHandler = Box<dyn Fn(SyncEvent) + Send + Sync>;

/// The sync engine orchestrates incremental syncing across chains.
pub struct SyncEngine {
    config: SyncConfig,
    chains: Vec<Arc<dyn ChainClient>>,
    store: Arc<dyn EventStore>,
    on_event: Option<SyncEventHandler>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        chains: Vec<Arc<dyn ChainClient>>,
        store: Arc<dyn EventStore>,
        on_event: Option<SyncEventHandler>,
    ) -> Self {
        Self {
            config,
            chains,
            store,
            on_event,
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(ref handler) = self.on_event {
            handler(event);
        }
    }

    /// Run a single sync pass for all configured chains.
    pub async fn sync_once(&self) -> Result<()> {
        for chain in &self.chains {
            if let Err(e) = self.sync_chain(chain.as_ref()).await {
                self.emit(SyncEvent::Error {
                    chain_id: chain.chain_id(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        }
        Ok(())
    }

    /// Sync one chain up to its current head, page by page.
    async fn sync_chain(&self, chain: &dyn ChainClient) -> Result<()> {
        let chain_id = chain.chain_id();
        self.emit(SyncEvent::Start { chain_id });

        let mut cursor = self
            .store
            .get_sync_cursor(chain_id)
            .await?
            .unwrap_or_default();
        let head = chain.block_number().await?;
        let page = self.config.page_size.max(1);

        let mut from = cursor.last_block;
        loop {
            let to = from.saturating_add(page - 1).min(head);
            let events = chain.events(&EventFilter::any(), from, to).await?;
            let stored = self.store.append_events(&events).await?;
            cursor.last_block = to;
            self.store.set_sync_cursor(chain_id, &cursor).await?;

            debug!(chain_id, from, to, stored, "synced block range");
            self.emit(SyncEvent::Progress {
                chain_id,
                to_block: to,
                stored,
            });

            if to >= head {
                break;
            }
            from = to + 1;
        }

        self.emit(SyncEvent::Done { chain_id, cursor });
        Ok(())
    }

    /// Sync every `poll_ms` until `cancel` fires. Failed passes are retried on
    /// the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let poll = Duration::from_millis(self.config.poll_ms);
        loop {
            if let Err(e) = self.sync_once().await {
                warn!(error = %e, "sync pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Get the current sync status for all chains.
    pub async fn get_status(&self) -> Result<Vec<SyncChainStatus>> {
        let mut statuses = Vec::new();
        for chain in &self.chains {
            let cursor = self.store.get_sync_cursor(chain.chain_id()).await?;
            statuses.push(SyncChainStatus {
                chain_id: chain.chain_id(),
                synced_block: cursor.map(|c| c.last_block),
                head_block: chain.block_number().await?,
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vrelay_chain::{ChainCall, LocalChain, LocalChainConfig, TxRequest};
    use vrelay_store::{EventQuery, MemoryStore, RequestPhase};
    use vrelay_types::{Address, ProtocolParams};

    const ETH: u128 = 1_000_000_000_000_000_000;

    async fn register(chain: &LocalChain, relayer: Address) {
        chain
            .submit(TxRequest::new(
                relayer,
                ChainCall::Register {
                    supported_chains: [1].into_iter().collect(),
                    stake: 20 * ETH,
                },
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_pages_and_resumes_from_cursor() {
        let params = ProtocolParams {
            minimum_stake: 10 * ETH,
            ..Default::default()
        };
        let hub = LocalChain::new(LocalChainConfig::hub(100, params)).unwrap();
        for i in 1..=3u8 {
            let relayer = Address::repeat_byte(i);
            hub.mint(relayer, Address::NATIVE, 50 * ETH).unwrap();
            hub.advance_blocks(5).unwrap();
            register(&hub, relayer).await;
        }

        let store = Arc::new(MemoryStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let engine = SyncEngine::new(
            SyncConfig {
                page_size: 4,
                poll_ms: 10,
            },
            vec![Arc::new(hub.clone()) as Arc<dyn ChainClient>],
            store.clone(),
            Some(Box::new(move |e: SyncEvent| {
                if let SyncEvent::Progress { to_block, .. } = e {
                    sink.lock().unwrap().push(to_block);
                }
            })),
        );

        engine.sync_once().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![3, 7, 11, 15]);
        let stored = store.list_events(&EventQuery::chain(100)).await.unwrap();
        assert_eq!(stored.len(), 6);

        // new event in the already-synced head block
        hub.mint(Address::repeat_byte(9), Address::NATIVE, 50 * ETH)
            .unwrap();
        register(&hub, Address::repeat_byte(9)).await;
        engine.sync_once().await.unwrap();
        let stored = store.list_events(&EventQuery::chain(100)).await.unwrap();
        assert_eq!(stored.len(), 8);

        let status = engine.get_status().await.unwrap();
        assert_eq!(status[0].synced_block, Some(15));
        assert_eq!(status[0].head_block, 15);
    }

    #[tokio::test]
    async fn test_store_summaries_follow_execution_chain() {
        use vrelay_ledger::CreateRequestParams;

        let exec =
            LocalChain::new(LocalChainConfig::execution(1, ProtocolParams::default(), [2]))
                .unwrap();
        let requester = Address::repeat_byte(0x11);
        exec.mint(requester, Address::NATIVE, 10 * ETH).unwrap();
        exec.submit(TxRequest::new(
            requester,
            ChainCall::CreateRequest(CreateRequestParams {
                source_token: Address::NATIVE,
                destination_token: Address::NATIVE,
                amount: ETH,
                destination_chain_id: 2,
                recipient: Address::repeat_byte(0x22),
                gas_on_destination: 0,
                max_fee: ETH / 10,
                fee_increment: ETH / 100,
                deadline: 20,
                nonce: 1,
            }),
        ))
        .await
        .unwrap();
        exec.advance_blocks(21).unwrap();

        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(
            SyncConfig::default(),
            vec![Arc::new(exec.clone()) as Arc<dyn ChainClient>],
            store.clone(),
            None,
        );
        engine.sync_once().await.unwrap();

        let requests = store.list_requests(&Default::default()).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].phase, RequestPhase::Open);

        exec.submit(TxRequest::new(
            requester,
            ChainCall::RefundExpired {
                request_id: requests[0].request_id,
            },
        ))
        .await
        .unwrap();
        engine.sync_once().await.unwrap();
        let summary = store
            .get_request(&requests[0].request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.phase, RequestPhase::Refunded);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let hub = LocalChain::new(LocalChainConfig::hub(100, ProtocolParams::default())).unwrap();
        let engine = SyncEngine::new(
            SyncConfig {
                page_size: 16,
                poll_ms: 5,
            },
            vec![Arc::new(hub) as Arc<dyn ChainClient>],
            Arc::new(MemoryStore::new()),
            None,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), engine.run(cancel))
            .await
            .unwrap();
    }
}
