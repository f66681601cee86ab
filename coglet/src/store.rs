//! Per-runner prediction store.
//!
//! The single source of truth for a prediction's accumulated logs, output,
//! and status. Each record carries its subscriber list; every mutation
//! broadcasts a fresh snapshot, and the terminal broadcast closes all
//! subscriber channels and removes the record.

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::prediction::{PredictionResponse, PredictionStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("prediction {0} already tracked")]
    Duplicate(String),
    #[error("prediction {0} not found")]
    NotFound(String),
}

struct Record {
    response: PredictionResponse,
    cancel_requested: bool,
    subscribers: Vec<mpsc::UnboundedSender<PredictionResponse>>,
}

/// Ordered, finite stream of response snapshots for one prediction.
///
/// The first item is the snapshot current at subscription time; the last is
/// the terminal snapshot, after which the stream ends.
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<PredictionResponse>,
}

impl OutputStream {
    pub async fn next(&mut self) -> Option<PredictionResponse> {
        self.rx.recv().await
    }

    /// Drain the stream and return the terminal snapshot.
    pub async fn wait_terminal(mut self) -> Option<PredictionResponse> {
        let mut last = None;
        while let Some(snapshot) = self.rx.recv().await {
            last = Some(snapshot);
        }
        last
    }
}

/// In-memory map from prediction ID to its response record.
pub struct PredictionStore {
    records: DashMap<String, Record>,
}

impl PredictionStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    pub fn snapshot(&self, id: &str) -> Option<PredictionResponse> {
        self.records.get(id).map(|r| r.response.clone())
    }

    /// Insert a new record. Atomic check-and-insert: a concurrent insert with
    /// the same ID loses with `Duplicate`.
    pub fn insert(&self, response: PredictionResponse) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(response.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(response.id)),
            Entry::Vacant(slot) => {
                slot.insert(Record {
                    response,
                    cancel_requested: false,
                    subscribers: Vec::new(),
                });
                Ok(())
            }
        }
    }

    /// Remove a record without broadcasting (admission rollback).
    pub fn discard(&self, id: &str) {
        self.records.remove(id);
    }

    /// Subscribe to a prediction's snapshot stream. The receiver is primed
    /// with the current snapshot; if the prediction is already terminal the
    /// stream ends right after it.
    pub fn subscribe(&self, id: &str) -> Result<OutputStream, StoreError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(record.response.clone());
        if !record.response.is_terminal() {
            record.subscribers.push(tx);
        }
        Ok(OutputStream { rx })
    }

    /// Apply a mutation and broadcast the resulting snapshot. When the
    /// mutation makes the record terminal, all subscriber channels are closed
    /// and the record is removed. Returns the post-mutation snapshot.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<PredictionResponse, StoreError>
    where
        F: FnOnce(&mut PredictionResponse),
    {
        let snapshot = {
            let mut record = self
                .records
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            if record.response.is_terminal() {
                return Ok(record.response.clone());
            }

            mutate(&mut record.response);
            let snapshot = record.response.clone();

            record
                .subscribers
                .retain(|tx| tx.send(snapshot.clone()).is_ok());
            if snapshot.is_terminal() {
                record.subscribers.clear();
            }
            snapshot
        };

        if snapshot.is_terminal() {
            self.records.remove(id);
        }
        Ok(snapshot)
    }

    pub fn append_logs(&self, id: &str, chunk: &str) -> Result<PredictionResponse, StoreError> {
        self.update(id, |r| r.append_logs(chunk))
    }

    /// Set the pending-cancel flag. Returns true if this call was the first
    /// to request cancellation.
    pub fn request_cancel(&self, id: &str) -> Result<bool, StoreError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let first = !record.cancel_requested;
        record.cancel_requested = true;
        Ok(first)
    }

    pub fn cancel_requested(&self, id: &str) -> bool {
        self.records
            .get(id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false)
    }

    /// Fail every tracked prediction with the given error. Used when the
    /// worker dies under the runner. Returns the terminal snapshots.
    pub fn fail_all(&self, error: &str) -> Vec<PredictionResponse> {
        let mut terminals = Vec::new();
        for id in self.ids() {
            if let Ok(snapshot) = self.update(&id, |r| {
                r.mark_terminal(PredictionStatus::Failed, Some(error.to_string()))
            }) {
                terminals.push(snapshot);
            }
        }
        terminals
    }
}

impl Default for PredictionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::PredictionRequest;

    fn starting(id: &str) -> PredictionResponse {
        PredictionResponse::from_request(&PredictionRequest::new(id, serde_json::json!({})))
    }

    #[test]
    fn insert_rejects_duplicates() {
        let store = PredictionStore::new();
        store.insert(starting("p1")).unwrap();

        let err = store.insert(starting("p1")).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == "p1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn subscriber_sees_every_snapshot_in_order() {
        let store = PredictionStore::new();
        store.insert(starting("p1")).unwrap();
        let mut stream = store.subscribe("p1").unwrap();

        store.update("p1", |r| r.set_processing()).unwrap();
        store.append_logs("p1", "line 1\n").unwrap();
        store
            .update("p1", |r| r.mark_terminal(PredictionStatus::Succeeded, None))
            .unwrap();

        let s1 = stream.next().await.unwrap();
        assert_eq!(s1.status, PredictionStatus::Starting);
        let s2 = stream.next().await.unwrap();
        assert_eq!(s2.status, PredictionStatus::Processing);
        let s3 = stream.next().await.unwrap();
        assert_eq!(s3.logs, "line 1\n");
        let s4 = stream.next().await.unwrap();
        assert!(s4.is_terminal());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn exactly_one_terminal_snapshot() {
        let store = PredictionStore::new();
        store.insert(starting("p1")).unwrap();
        let stream = store.subscribe("p1").unwrap();

        store
            .update("p1", |r| r.mark_terminal(PredictionStatus::Canceled, None))
            .unwrap();
        // Gone after terminal: further updates are NotFound
        assert!(matches!(
            store.update("p1", |r| r.set_processing()),
            Err(StoreError::NotFound(_))
        ));

        let mut terminals = 0;
        let mut stream = stream;
        while let Some(snapshot) = stream.next().await {
            if snapshot.is_terminal() {
                terminals += 1;
            }
        }
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn late_subscriber_to_terminal_record() {
        let store = PredictionStore::new();
        let mut response = starting("p1");
        response.mark_terminal(PredictionStatus::Succeeded, None);
        store.insert(response).unwrap();

        let mut stream = store.subscribe("p1").unwrap();
        let first = stream.next().await.unwrap();
        assert!(first.is_terminal());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn terminal_update_removes_record() {
        let store = PredictionStore::new();
        store.insert(starting("p1")).unwrap();
        store
            .update("p1", |r| r.mark_terminal(PredictionStatus::Failed, Some("x".into())))
            .unwrap();

        assert!(!store.contains("p1"));
        assert!(store.is_empty());
    }

    #[test]
    fn cancel_flag_is_idempotent() {
        let store = PredictionStore::new();
        store.insert(starting("p1")).unwrap();

        assert!(store.request_cancel("p1").unwrap());
        assert!(!store.request_cancel("p1").unwrap());
        assert!(!store.request_cancel("p1").unwrap());
        assert!(store.cancel_requested("p1"));
    }

    #[test]
    fn cancel_unknown_is_not_found() {
        let store = PredictionStore::new();
        assert!(matches!(
            store.request_cancel("nope"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fail_all_fails_everything() {
        let store = PredictionStore::new();
        store.insert(starting("p1")).unwrap();
        store.insert(starting("p2")).unwrap();
        let stream = store.subscribe("p1").unwrap();

        let terminals = store.fail_all("worker crashed");
        assert_eq!(terminals.len(), 2);
        for t in &terminals {
            assert_eq!(t.status, PredictionStatus::Failed);
            assert_eq!(t.error.as_deref(), Some("worker crashed"));
        }
        assert!(store.is_empty());

        let last = stream.wait_terminal().await.unwrap();
        assert_eq!(last.status, PredictionStatus::Failed);
    }

    #[test]
    fn discard_removes_without_terminal() {
        let store = PredictionStore::new();
        store.insert(starting("p1")).unwrap();
        store.discard("p1");
        assert!(!store.contains("p1"));
    }
}
