//! Passive keyed storage for dialogue and CDR records.
//!
//! The stores provide single-reader/single-writer consistency within one
//! request; nothing here is durable. Field mutations go through
//! [`RecordStore::update_with`] so concurrent writers never lose updates to
//! a whole-row read-modify-write.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::sip::dialogue::{Cdr, Dialogue};

pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

#[derive(Debug)]
pub struct RecordStore<T: Record> {
    rows: RwLock<HashMap<String, T>>,
}

impl<T: Record> Default for RecordStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> RecordStore<T> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, row: T) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(row.id()) {
            return Err(Error::invalid_argument(format!(
                "record {} already exists",
                row.id()
            )));
        }
        rows.insert(row.id().to_string(), row);
        Ok(())
    }

    pub async fn update(&self, row: T) -> Result<()> {
        let mut rows = self.rows.write().await;
        if !rows.contains_key(row.id()) {
            return Err(Error::not_found(format!("record {}", row.id())));
        }
        rows.insert(row.id().to_string(), row);
        Ok(())
    }

    /// Apply a field-level mutation under the write lock and return the
    /// updated row.
    pub async fn update_with<F>(&self, id: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("record {id}")))?;
        mutate(row);
        Ok(row.clone())
    }

    pub async fn delete(&self, id: &str) -> bool {
        self.rows.write().await.remove(id).is_some()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<T> {
        self.rows.read().await.get(id).cloned()
    }

    /// At most one row matching the predicate; `None` on miss or ambiguity.
    pub async fn get<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let rows = self.rows.read().await;
        let mut matched = rows.values().filter(|row| predicate(row));
        let first = matched.next().cloned();
        if matched.next().is_some() {
            return None;
        }
        first
    }

    pub async fn list<P>(&self, predicate: P, limit: Option<usize>) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        let rows = self.rows.read().await;
        let matched = rows.values().filter(|row| predicate(row)).cloned();
        match limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        }
    }

    pub async fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&T) -> bool,
    {
        let rows = self.rows.read().await;
        rows.values().filter(|row| predicate(row)).count()
    }
}

#[derive(Debug, Default)]
pub struct DialogueStore {
    inner: RecordStore<Dialogue>,
}

impl DialogueStore {
    pub fn new() -> Self {
        Self {
            inner: RecordStore::new(),
        }
    }

    /// Increment and persist the leg's sequence number atomically,
    /// returning the new value.
    pub async fn bump_cseq(&self, id: &str) -> Result<u32> {
        let updated = self
            .inner
            .update_with(id, |dialogue| {
                dialogue.cseq = dialogue.cseq.saturating_add(1);
            })
            .await?;
        Ok(updated.cseq)
    }

    /// Raise the leg's sequence number to track an inbound request.
    /// Never decreases it.
    pub async fn set_cseq_at_least(&self, id: &str, seq: u32) -> Result<u32> {
        let updated = self
            .inner
            .update_with(id, |dialogue| {
                if seq > dialogue.cseq {
                    dialogue.cseq = seq;
                }
            })
            .await?;
        Ok(updated.cseq)
    }
}

impl std::ops::Deref for DialogueStore {
    type Target = RecordStore<Dialogue>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug, Default)]
pub struct CdrStore {
    inner: RecordStore<Cdr>,
}

impl CdrStore {
    pub fn new() -> Self {
        Self {
            inner: RecordStore::new(),
        }
    }

    /// Record the terminal cause on a CDR. A missing or empty id is a
    /// no-op so hangup propagation stays best-effort.
    pub async fn hungup(&self, id: &str, cause: &str) -> Result<Option<Cdr>> {
        if id.is_empty() {
            return Ok(None);
        }
        let updated = self.inner.update_with(id, |cdr| cdr.hungup(cause)).await?;
        Ok(Some(updated))
    }
}

impl std::ops::Deref for CdrStore {
    type Target = RecordStore<Cdr>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::Uri;
    use std::convert::TryFrom;

    use crate::sip::dialogue::SipUserField;

    fn dialogue(id: &str, call_id: &str, cseq: u32) -> Dialogue {
        let uri = Uri::try_from("sip:alice@192.0.2.10").expect("uri");
        Dialogue {
            id: id.to_string(),
            call_id: call_id.to_string(),
            local_tag: format!("{id}-local"),
            remote_tag: format!("{id}-remote"),
            cseq,
            route_set: Vec::new(),
            remote_target: uri.clone(),
            local_user_field: SipUserField::new(Some("Alice"), uri.clone()),
            remote_user_field: SipUserField::new(None, uri),
            owner: "alice".to_string(),
            bridge_id: String::new(),
            cdr_id: String::new(),
            remote_sdp: String::new(),
            proxy_send_from: None,
        }
    }

    #[tokio::test]
    async fn add_rejects_duplicate_ids() {
        let store = DialogueStore::new();
        store.add(dialogue("d1", "call-1", 1)).await.expect("add");
        assert!(store.add(dialogue("d1", "call-2", 1)).await.is_err());
    }

    #[tokio::test]
    async fn bump_cseq_is_monotonic() {
        let store = DialogueStore::new();
        store.add(dialogue("d1", "call-1", 10)).await.expect("add");

        let mut last = 10;
        for _ in 0..5 {
            let next = store.bump_cseq("d1").await.expect("bump");
            assert!(next > last);
            last = next;
        }
        assert_eq!(last, 15);
    }

    #[tokio::test]
    async fn set_cseq_at_least_never_decreases() {
        let store = DialogueStore::new();
        store.add(dialogue("d1", "call-1", 20)).await.expect("add");

        assert_eq!(store.set_cseq_at_least("d1", 5).await.expect("set"), 20);
        assert_eq!(store.set_cseq_at_least("d1", 25).await.expect("set"), 25);
    }

    #[tokio::test]
    async fn get_returns_none_on_ambiguity() {
        let store = DialogueStore::new();
        store.add(dialogue("d1", "call-1", 1)).await.expect("add");
        store.add(dialogue("d2", "call-1", 1)).await.expect("add");

        assert!(store.get(|d| d.call_id == "call-1").await.is_none());
        assert!(store.get(|d| d.id == "d1").await.is_some());
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let store = DialogueStore::new();
        store.add(dialogue("d1", "call-1", 1)).await.expect("add");
        assert!(store.delete("d1").await);
        assert!(!store.delete("d1").await);
        assert!(store.get_by_id("d1").await.is_none());
    }

    #[tokio::test]
    async fn cdr_first_cause_wins() {
        let store = CdrStore::new();
        store
            .add(Cdr::new("c1", "b1", "alice"))
            .await
            .expect("add");

        let first = store.hungup("c1", "user").await.expect("hangup");
        assert_eq!(first.unwrap().hungup_cause.as_deref(), Some("user"));

        let second = store.hungup("c1", "other").await.expect("hangup");
        assert_eq!(second.unwrap().hungup_cause.as_deref(), Some("user"));

        assert!(store.hungup("", "user").await.expect("empty id").is_none());
    }
}
