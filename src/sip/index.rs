//! Dialogue lookup hierarchy.
//!
//! Strict (Call-ID, local tag, remote tag) matching first, then a chain of
//! relaxed fallbacks for peers that mangle one of the identifiers. Every
//! relaxed path resolves only when its predicate is unambiguous; two or
//! more candidates mean none is returned, never an arbitrary pick.

use std::sync::Arc;

use tracing::{debug, warn};

use super::dialogue::Dialogue;
use super::utils::unescape_uri_component;
use crate::store::DialogueStore;

#[derive(Clone)]
pub struct DialogueIndex {
    dialogues: Arc<DialogueStore>,
}

impl DialogueIndex {
    pub fn new(dialogues: Arc<DialogueStore>) -> Self {
        Self { dialogues }
    }

    /// Strict triple match, then by local tag alone, remote tag alone and
    /// finally Call-ID alone. The Call-ID fallback only applies while the
    /// Call-ID is globally unique in the store; any ambiguity abandons it.
    pub async fn get_by_triple(
        &self,
        call_id: &str,
        local_tag: &str,
        remote_tag: &str,
    ) -> Option<Dialogue> {
        if let Some(dialogue) = self
            .dialogues
            .get(|d| d.call_id == call_id && d.local_tag == local_tag && d.remote_tag == remote_tag)
            .await
        {
            return Some(dialogue);
        }

        if !local_tag.is_empty() {
            if let Some(dialogue) = self.dialogues.get(|d| d.local_tag == local_tag).await {
                debug!(call_id, local_tag, "dialogue matched by local tag alone");
                return Some(dialogue);
            }
        }

        if !remote_tag.is_empty() {
            if let Some(dialogue) = self.dialogues.get(|d| d.remote_tag == remote_tag).await {
                debug!(call_id, remote_tag, "dialogue matched by remote tag alone");
                return Some(dialogue);
            }
        }

        let candidates = self
            .dialogues
            .list(|d| d.call_id == call_id, Some(2))
            .await;
        match candidates.len() {
            1 => {
                debug!(call_id, "dialogue matched by call id alone");
                candidates.into_iter().next()
            }
            count if count > 1 => {
                warn!(call_id, "call id fallback abandoned, multiple dialogues share it");
                None
            }
            _ => None,
        }
    }

    /// Parse a Replaces parameter of the shape
    /// `<callid>;to-tag=<tag>;from-tag=<tag>` (URI-escaped on the wire)
    /// and look the dialogue up by its triple.
    pub async fn get_by_replaces(&self, replaces: &str) -> Option<Dialogue> {
        let decoded = unescape_uri_component(replaces);
        let mut segments = decoded.split(';');

        let call_id = segments.next()?.trim();
        if call_id.is_empty() {
            return None;
        }

        let mut to_tag = None;
        let mut from_tag = None;
        for segment in segments {
            let mut pair = segment.splitn(2, '=');
            let name = pair.next().unwrap_or("").trim();
            let value = pair.next().unwrap_or("").trim();
            if name.eq_ignore_ascii_case("to-tag") {
                to_tag = Some(value);
            } else if name.eq_ignore_ascii_case("from-tag") {
                from_tag = Some(value);
            }
        }

        let (to_tag, from_tag) = match (to_tag, from_tag) {
            (Some(to_tag), Some(from_tag)) if !to_tag.is_empty() && !from_tag.is_empty() => {
                (to_tag, from_tag)
            }
            _ => {
                warn!(replaces = decoded, "malformed Replaces parameter");
                return None;
            }
        };

        self.get_by_triple(call_id, to_tag, from_tag).await
    }

    /// Owner-scoped heuristics: treat `identifier` as a Call-ID first, then
    /// as a fragment of the owner's local user field. Ambiguity returns
    /// none.
    pub async fn get_relaxed(&self, owner: &str, identifier: &str) -> Option<Dialogue> {
        if identifier.is_empty() {
            return None;
        }

        if let Some(dialogue) = self
            .dialogues
            .get(|d| d.owner == owner && d.call_id == identifier)
            .await
        {
            return Some(dialogue);
        }

        let matches = self
            .dialogues
            .list(
                |d| d.owner == owner && d.local_user_field.as_caller_string().contains(identifier),
                Some(2),
            )
            .await;
        if matches.len() == 1 {
            return matches.into_iter().next();
        }
        None
    }

    /// The other leg sharing this dialogue's bridge, or none.
    pub async fn get_opposite(&self, dialogue: &Dialogue) -> Option<Dialogue> {
        if !dialogue.is_bridged() {
            return None;
        }
        let bridge_id = dialogue.bridge_id.clone();
        let own_id = dialogue.id.clone();
        self.dialogues
            .get(move |d| d.bridge_id == bridge_id && d.id != own_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::Uri;
    use std::convert::TryFrom;

    use crate::sip::dialogue::SipUserField;

    fn dialogue(id: &str, call_id: &str, local_tag: &str, remote_tag: &str) -> Dialogue {
        let uri = Uri::try_from("sip:alice@192.0.2.10").expect("uri");
        Dialogue {
            id: id.to_string(),
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
            cseq: 1,
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

    async fn index_with(dialogues: Vec<Dialogue>) -> DialogueIndex {
        let store = Arc::new(DialogueStore::new());
        for dialogue in dialogues {
            store.add(dialogue).await.expect("add dialogue");
        }
        DialogueIndex::new(store)
    }

    #[tokio::test]
    async fn strict_and_relaxed_triple_lookup() {
        let index = index_with(vec![dialogue("x", "a", "L", "R")]).await;

        let strict = index.get_by_triple("a", "L", "R").await.expect("strict");
        assert_eq!(strict.id, "x");

        // Wrong remote tag still resolves through the local-tag fallback.
        let relaxed = index.get_by_triple("a", "L", "R2").await.expect("fallback");
        assert_eq!(relaxed.id, "x");

        let by_remote = index.get_by_triple("a", "Lx", "R").await.expect("remote tag");
        assert_eq!(by_remote.id, "x");
    }

    #[tokio::test]
    async fn call_id_fallback_abandoned_on_ambiguity() {
        let index = index_with(vec![dialogue("x", "a", "L", "R")]).await;
        // Unique Call-ID resolves even with both tags wrong.
        assert!(index.get_by_triple("a", "Lx", "Rx").await.is_some());

        let index = index_with(vec![
            dialogue("x", "a", "L", "R"),
            dialogue("y", "a", "L2", "R2"),
        ])
        .await;
        assert!(index.get_by_triple("a", "Lx", "Rx").await.is_none());
    }

    #[tokio::test]
    async fn replaces_parsing_unescapes_and_delegates() {
        let index = index_with(vec![dialogue("x", "abc@host", "t", "f")]).await;

        let found = index
            .get_by_replaces("abc%40host;to-tag=t;from-tag=f")
            .await
            .expect("replaces lookup");
        assert_eq!(found.id, "x");

        assert!(index.get_by_replaces("abc%40host;to-tag=t").await.is_none());
        assert!(index.get_by_replaces("").await.is_none());
    }

    #[tokio::test]
    async fn relaxed_owner_lookup() {
        let mut named = dialogue("x", "call-1", "L", "R");
        named.owner = "bob".to_string();
        let index = index_with(vec![named]).await;

        // Call-ID match is owner-scoped.
        assert!(index.get_relaxed("alice", "call-1").await.is_none());
        assert_eq!(index.get_relaxed("bob", "call-1").await.unwrap().id, "x");

        // Local user field fragment.
        assert_eq!(index.get_relaxed("bob", "Alice").await.unwrap().id, "x");

        // Two dialogues with the same caller string: ambiguous, none.
        let mut first = dialogue("x", "call-1", "L", "R");
        first.owner = "bob".to_string();
        let mut second = dialogue("y", "call-2", "L2", "R2");
        second.owner = "bob".to_string();
        let index = index_with(vec![first, second]).await;
        assert!(index.get_relaxed("bob", "Alice").await.is_none());
    }

    #[tokio::test]
    async fn opposite_requires_shared_bridge() {
        let mut a = dialogue("a", "call-a", "La", "Ra");
        let mut b = dialogue("b", "call-b", "Lb", "Rb");
        let c = dialogue("c", "call-c", "Lc", "Rc");
        a.bridge_id = "bridge-1".to_string();
        b.bridge_id = "bridge-1".to_string();

        let index = index_with(vec![a.clone(), b, c.clone()]).await;
        assert_eq!(index.get_opposite(&a).await.unwrap().id, "b");
        assert!(index.get_opposite(&c).await.is_none());
    }
}
