//! Storage adapter trait and implementations for relay observers.
//!
//! Defines the `EventStore` trait that all storage backends must implement.
//! Provides a `MemoryStore` for testing and single-process deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vrelay_types::{
    Address, BlockNumber, ChainId, EventFilter, EventKind, Hash32, LoggedEvent, Result,
};

pub mod memory;
pub mod summary;

pub use memory::MemoryStore;
pub use summary::{RequestPhase, RequestSummary};

/// Sync progress for one chain: events up to `last_block` are stored.
///
/// The head block may still gain events, so sync re-reads `last_block` and
/// relies on `append_events` skipping duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncCursor {
    pub last_block: BlockNumber,
}

/// Query for listing stored events.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub chain_id: Option<ChainId>,
    pub filter: EventFilter,
    pub from_block: Option<BlockNumber>,
    pub to_block: Option<BlockNumber>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn chain(chain_id: ChainId) -> Self {
        Self {
            chain_id: Some(chain_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &LoggedEvent) -> bool {
        self.chain_id.map_or(true, |c| event.chain_id == c)
            && self.from_block.map_or(true, |b| event.block_number >= b)
            && self.to_block.map_or(true, |b| event.block_number <= b)
            && self.filter.matches(&event.event)
    }
}

/// Query for listing request summaries.
#[derive(Debug, Clone, Default)]
pub struct RequestQuery {
    pub source_chain_id: Option<ChainId>,
    pub requester: Option<Address>,
    pub relayer: Option<Address>,
    pub phase: Option<RequestPhase>,
}

impl RequestQuery {
    pub fn matches(&self, summary: &RequestSummary) -> bool {
        self.source_chain_id
            .map_or(true, |c| summary.source_chain_id == c)
            && self.requester.map_or(true, |r| summary.requester == r)
            && self.relayer.map_or(true, |r| summary.relayer == Some(r))
            && self.phase.map_or(true, |p| summary.phase == p)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Submitted,
    Confirmed,
    Failed,
}

/// Stored agent operation (what a relayer, user or keeper submitted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredOperation {
    pub id: String,
    pub chain_id: ChainId,
    pub op_type: String,
    pub status: OperationStatus,
    pub tx_hash: Option<Hash32>,
    pub created_at: u64,
    pub updated_at: u64,
    pub error: Option<String>,
    /// Submitted transaction as JSON text. `Amount` is a u128, which
    /// `serde_json::Value` cannot hold past `u64::MAX`.
    pub data: String,
}

/// The core storage adapter trait.
///
/// All methods are async to support both in-memory and persistent backends.
/// Request summaries have default implementations folding the stored log.
#[async_trait]
pub trait EventStore: Send + Sync {
    // --- Lifecycle ---
    async fn init(&self) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    // --- Sync Cursors ---
    async fn get_sync_cursor(&self, chain_id: ChainId) -> Result<Option<SyncCursor>>;
    async fn set_sync_cursor(&self, chain_id: ChainId, cursor: &SyncCursor) -> Result<()>;

    // --- Events ---
    /// Store events, skipping any already stored. Returns how many were new.
    async fn append_events(&self, events: &[LoggedEvent]) -> Result<usize>;
    /// Matching events ordered by chain, then log index.
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<LoggedEvent>>;

    // --- Requests ---
    async fn get_request(&self, request_id: &Hash32) -> Result<Option<RequestSummary>> {
        let query = EventQuery {
            filter: EventFilter::any().with_request(*request_id),
            ..Default::default()
        };
        let events = self.list_events(&query).await?;
        Ok(RequestSummary::fold(&events))
    }

    async fn list_requests(&self, query: &RequestQuery) -> Result<Vec<RequestSummary>> {
        let created = self
            .list_events(&EventQuery {
                chain_id: query.source_chain_id,
                filter: EventFilter::kind(EventKind::RequestCreated),
                ..Default::default()
            })
            .await?;
        let mut out = Vec::new();
        for event in &created {
            let Some(request_id) = event.event.request_id() else {
                continue;
            };
            if let Some(summary) = self.get_request(&request_id).await? {
                if query.matches(&summary) {
                    out.push(summary);
                }
            }
        }
        Ok(out)
    }

    // --- Operations ---
    /// Insert or replace by `id`.
    async fn upsert_operation(&self, op: &StoredOperation) -> Result<()>;
    async fn list_operations(&self, chain_id: Option<ChainId>) -> Result<Vec<StoredOperation>>;
}
