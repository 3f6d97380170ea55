//! In-memory storage adapter for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::*;
use vrelay_types::{RelayError, Result};

/// In-memory storage adapter (for testing and ephemeral use).
pub struct MemoryStore {
    cursors: Mutex<HashMap<ChainId, SyncCursor>>,
    events: Mutex<BTreeMap<(ChainId, u64), LoggedEvent>>,
    operations: Mutex<Vec<StoredOperation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            events: Mutex::new(BTreeMap::new()),
            operations: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| RelayError::Other("memory store lock poisoned".into()))
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn get_sync_cursor(&self, chain_id: ChainId) -> Result<Option<SyncCursor>> {
        let cursors = lock(&self.cursors)?;
        Ok(cursors.get(&chain_id).copied())
    }

    async fn set_sync_cursor(&self, chain_id: ChainId, cursor: &SyncCursor) -> Result<()> {
        let mut cursors = lock(&self.cursors)?;
        cursors.insert(chain_id, *cursor);
        Ok(())
    }

    async fn append_events(&self, events: &[LoggedEvent]) -> Result<usize> {
        let mut store = lock(&self.events)?;
        let mut added = 0;
        for event in events {
            let key = (event.chain_id, event.log_index);
            if let Some(existing) = store.get(&key) {
                if existing != event {
                    return Err(RelayError::Other(format!(
                        "chain {} log index {} already holds a different event",
                        event.chain_id, event.log_index
                    )));
                }
                continue;
            }
            store.insert(key, event.clone());
            added += 1;
        }
        Ok(added)
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<LoggedEvent>> {
        let store = lock(&self.events)?;
        let matching = store.values().filter(|e| query.matches(e)).cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn upsert_operation(&self, op: &StoredOperation) -> Result<()> {
        let mut ops = lock(&self.operations)?;
        if let Some(existing) = ops.iter_mut().find(|o| o.id == op.id) {
            *existing = op.clone();
        } else {
            ops.push(op.clone());
        }
        Ok(())
    }

    async fn list_operations(&self, chain_id: Option<ChainId>) -> Result<Vec<StoredOperation>> {
        let ops = lock(&self.operations)?;
        let filtered = ops
            .iter()
            .filter(|o| chain_id.map_or(true, |cid| o.chain_id == cid))
            .cloned()
            .collect();
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrelay_types::{Address, ProtocolEvent};

    fn created(chain_id: ChainId, log_index: u64, request: u8) -> LoggedEvent {
        LoggedEvent {
            chain_id,
            block_number: 10 + log_index,
            tx_hash: Hash32::repeat_byte(log_index as u8),
            log_index,
            event: ProtocolEvent::RequestCreated {
                request_id: Hash32::repeat_byte(request),
                requester: Address::repeat_byte(request),
                source_token: Address::NATIVE,
                destination_token: Address::NATIVE,
                amount: 10,
                destination_chain_id: 2,
                recipient: Address::repeat_byte(0x22),
                gas_on_destination: 0,
                max_fee: 1,
                fee_increment: 1,
                deadline: 100,
                created_block: 10 + log_index,
            },
        }
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let store = MemoryStore::new();
        let events = vec![created(1, 0, 1), created(1, 1, 2)];
        assert_eq!(store.append_events(&events).await.unwrap(), 2);
        assert_eq!(store.append_events(&events).await.unwrap(), 0);

        let conflicting = created(1, 0, 3);
        assert!(store.append_events(&[conflicting]).await.is_err());
    }

    #[tokio::test]
    async fn test_list_events_by_chain_and_block() {
        let store = MemoryStore::new();
        store
            .append_events(&[created(1, 0, 1), created(1, 1, 2), created(5, 0, 3)])
            .await
            .unwrap();

        let on_chain_1 = store.list_events(&EventQuery::chain(1)).await.unwrap();
        assert_eq!(on_chain_1.len(), 2);

        let query = EventQuery {
            from_block: Some(11),
            ..Default::default()
        };
        assert_eq!(store.list_events(&query).await.unwrap().len(), 1);

        let limited = EventQuery {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(store.list_events(&limited).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_request_summaries_from_log() {
        let store = MemoryStore::new();
        store
            .append_events(&[created(1, 0, 1), created(1, 1, 2)])
            .await
            .unwrap();

        let summary = store.get_request(&Hash32::repeat_byte(2)).await.unwrap().unwrap();
        assert_eq!(summary.phase, RequestPhase::Open);
        assert!(store.get_request(&Hash32::repeat_byte(9)).await.unwrap().is_none());

        let query = RequestQuery {
            requester: Some(Address::repeat_byte(1)),
            ..Default::default()
        };
        let listed = store.list_requests(&query).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].request_id, Hash32::repeat_byte(1));
    }

    #[tokio::test]
    async fn test_cursors_and_operations() {
        let store = MemoryStore::new();
        assert!(store.get_sync_cursor(1).await.unwrap().is_none());
        store
            .set_sync_cursor(1, &SyncCursor { last_block: 42 })
            .await
            .unwrap();
        assert_eq!(store.get_sync_cursor(1).await.unwrap().unwrap().last_block, 42);

        let mut op = StoredOperation {
            id: "op-1".into(),
            chain_id: 1,
            op_type: "issue_voucher".into(),
            status: OperationStatus::Submitted,
            tx_hash: None,
            created_at: 1,
            updated_at: 1,
            error: None,
            data: r#"{"fee":60}"#.into(),
        };
        store.upsert_operation(&op).await.unwrap();
        op.status = OperationStatus::Confirmed;
        store.upsert_operation(&op).await.unwrap();

        let ops = store.list_operations(Some(1)).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, OperationStatus::Confirmed);
        assert!(store.list_operations(Some(2)).await.unwrap().is_empty());
    }
}
