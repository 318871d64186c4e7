use std::time::SystemTime;

use rsip::Uri;

use crate::store::Record;

/// Display-name + URI pair as carried in From/To headers.
#[derive(Debug, Clone)]
pub struct SipUserField {
    pub display_name: Option<String>,
    pub uri: Uri,
}

impl SipUserField {
    pub fn new(display_name: Option<&str>, uri: Uri) -> Self {
        Self {
            display_name: display_name.map(|name| name.to_string()),
            uri,
        }
    }

    /// Rendered form used by relaxed owner lookups.
    pub fn as_caller_string(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{} <{}>", name, self.uri),
            None => format!("<{}>", self.uri),
        }
    }
}

/// One confirmed peer leg of a bridged call.
///
/// A dialogue is created confirmed and deleted on hangup. Two dialogues
/// sharing a non-empty `bridge_id` are the two legs of one B2BUA call;
/// an empty `bridge_id` means unbridged. Mutations go through the
/// dialogue store so concurrent writers never clobber whole rows.
#[derive(Debug, Clone)]
pub struct Dialogue {
    pub id: String,
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    /// Sequence number of the last in-dialogue request on this leg,
    /// non-decreasing for the lifetime of the dialogue.
    pub cseq: u32,
    /// Pre-loaded Route header values, in order.
    pub route_set: Vec<String>,
    /// The far side's contact URI; in-dialogue requests are sent there.
    pub remote_target: Uri,
    pub local_user_field: SipUserField,
    pub remote_user_field: SipUserField,
    /// The local account this leg belongs to.
    pub owner: String,
    /// Empty iff unbridged. Shared by exactly two dialogues when set.
    pub bridge_id: String,
    /// Handle into the CDR store; may be empty.
    pub cdr_id: String,
    /// Last SDP offered by the far end.
    pub remote_sdp: String,
    /// Optional source-routing hint forwarded to next-hop resolution.
    pub proxy_send_from: Option<String>,
}

impl Dialogue {
    pub fn is_bridged(&self) -> bool {
        !self.bridge_id.is_empty()
    }

    /// The identifying triple.
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.call_id, &self.local_tag, &self.remote_tag)
    }
}

impl Record for Dialogue {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Call detail record. Outlives its dialogue; never deleted by the core.
#[derive(Debug, Clone)]
pub struct Cdr {
    pub id: String,
    pub bridge_id: String,
    pub owner: String,
    pub hungup_cause: Option<String>,
    pub hungup_at: Option<SystemTime>,
}

impl Cdr {
    pub fn new(id: impl Into<String>, bridge_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bridge_id: bridge_id.into(),
            owner: owner.into(),
            hungup_cause: None,
            hungup_at: None,
        }
    }

    /// Record the terminal reason. The first cause wins; later hangup
    /// attempts leave the record untouched.
    pub fn hungup(&mut self, cause: &str) {
        if self.hungup_cause.is_none() {
            self.hungup_cause = Some(cause.to_string());
            self.hungup_at = Some(SystemTime::now());
        }
    }
}

impl Record for Cdr {
    fn id(&self) -> &str {
        &self.id
    }
}
