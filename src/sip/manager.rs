//! Bridge lifecycle, in-dialogue forwarding and call transfer.
//!
//! The manager is invoked from inbound-request tasks, response-callback
//! tasks and public callers. It owns no long-lived state beyond the
//! forwarded-transaction map; per-dialogue mutations go through the
//! dialogue store so concurrent entry points never clobber whole rows.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use rsip::common::uri::param::{Branch, Tag};
use rsip::headers::{
    CallId, Contact, ContentLength, ContentType, MaxForwards, Route, ToTypedHeader, UntypedHeader,
};
use rsip::message::headers_ext::HeadersExt;
use rsip::transport::Transport;
use rsip::typed;
use rsip::{Method, Param, StatusCode, StatusCodeKind, Uri};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dialogue::Dialogue;
use super::index::DialogueIndex;
use super::transport::{
    ClientTransaction, ReceivedResponse, ServerTransaction, SipTransport, TransactionKey,
};
use super::utils::{
    apply_user_agent, format_socket_for_sip, new_branch, new_id, other_header_value,
};
use crate::config::B2buaConfig;
use crate::error::{Error, Result};
use crate::media::sdp::mangle;
use crate::store::{CdrStore, DialogueStore};

const ATTENDED_TRANSFER_CAUSE: &str = "Attended transfer";
const BLIND_TRANSFER_CAUSE: &str = "Blind transfer";
const SIPFRAG_CONTENT_TYPE: &str = "message/sipfrag;version=2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEventKind {
    DialogueCreated,
    DialogueRemoved,
    DialPlanError,
    TransferStarted,
    TransferCompleted,
}

/// Structured record handed to the monitor sink.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub owner: String,
    pub kind: MonitorEventKind,
    pub remote: Option<SocketAddr>,
    pub text: String,
}

/// Single observer slot for machine events.
pub trait DialogueMonitor: Send + Sync + 'static {
    fn on_event(&self, event: MonitorEvent);
}

/// Discards every event.
pub struct NullMonitor;

impl DialogueMonitor for NullMonitor {
    fn on_event(&self, _event: MonitorEvent) {}
}

pub struct DialogueManagerBuilder {
    config: B2buaConfig,
    monitor: Arc<dyn DialogueMonitor>,
    dialogues: Arc<DialogueStore>,
    cdrs: Arc<CdrStore>,
}

impl DialogueManagerBuilder {
    pub fn new(config: B2buaConfig) -> Self {
        Self {
            config,
            monitor: Arc::new(NullMonitor),
            dialogues: Arc::new(DialogueStore::new()),
            cdrs: Arc::new(CdrStore::new()),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn DialogueMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_dialogue_store(mut self, dialogues: Arc<DialogueStore>) -> Self {
        self.dialogues = dialogues;
        self
    }

    pub fn with_cdr_store(mut self, cdrs: Arc<CdrStore>) -> Self {
        self.cdrs = cdrs;
        self
    }

    pub fn build(self, transport: Arc<dyn SipTransport>) -> DialogueManager {
        let index = DialogueIndex::new(self.dialogues.clone());
        DialogueManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                transport,
                dialogues: self.dialogues,
                cdrs: self.cdrs,
                index,
                monitor: self.monitor,
                in_dialogue: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// B2BUA dialogue manager: glues confirmed dialogues into bridges and
/// relays in-dialogue traffic between the two legs.
#[derive(Clone)]
pub struct DialogueManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: B2buaConfig,
    transport: Arc<dyn SipTransport>,
    dialogues: Arc<DialogueStore>,
    cdrs: Arc<CdrStore>,
    index: DialogueIndex,
    monitor: Arc<dyn DialogueMonitor>,
    /// Forwarded transaction id mapped back to the transaction it
    /// originated from. Guarded by a plain mutex; no await happens while
    /// it is held.
    in_dialogue: Mutex<HashMap<TransactionKey, TransactionKey>>,
}

impl DialogueManager {
    pub fn builder(config: B2buaConfig) -> DialogueManagerBuilder {
        DialogueManagerBuilder::new(config)
    }

    pub fn dialogues(&self) -> &Arc<DialogueStore> {
        &self.inner.dialogues
    }

    pub fn cdrs(&self) -> &Arc<CdrStore> {
        &self.inner.cdrs
    }

    pub fn index(&self) -> &DialogueIndex {
        &self.inner.index
    }

    /// Pull inbound transactions off the transport and dispatch each on
    /// its own task until cancelled.
    pub async fn run(
        &self,
        mut incoming: mpsc::Receiver<ServerTransaction>,
        cancel: CancellationToken,
    ) {
        info!("dialogue manager event loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_txn = incoming.recv() => match maybe_txn {
                    Some(txn) => {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            manager.handle_in_dialogue_request(txn).await;
                        });
                    }
                    None => break,
                }
            }
        }
        info!("dialogue manager event loop stopped");
    }

    /// Top-level entry for one in-dialogue request. Locates the dialogue
    /// by the request's identifying triple and routes by method. Failures
    /// are logged and reported as dial-plan errors; nothing propagates.
    pub async fn handle_in_dialogue_request(&self, txn: ServerTransaction) {
        let call_id = match txn.request.call_id_header() {
            Ok(header) => header.value().to_string(),
            Err(err) => {
                warn!(error = %err, "in-dialogue request without Call-ID");
                return;
            }
        };
        let to_tag = txn
            .request
            .to_header()
            .ok()
            .and_then(|header| header.tag().ok().flatten())
            .map(|tag| tag.to_string())
            .unwrap_or_default();
        let from_tag = txn
            .request
            .from_header()
            .ok()
            .and_then(|header| header.tag().ok().flatten())
            .map(|tag| tag.to_string())
            .unwrap_or_default();

        // We are the UAS here, so our tag is the To tag.
        let Some(dialogue) = self.inner.index.get_by_triple(&call_id, &to_tag, &from_tag).await
        else {
            warn!(call_id, to_tag, from_tag, "no dialogue for in-dialogue request");
            let response =
                self.response_for(&txn.request, StatusCode::CallTransactionDoesNotExist);
            if let Err(err) = self.inner.transport.respond_reliable(&txn.key, response).await {
                warn!(error = %err, "failed to answer unmatched in-dialogue request");
            }
            return;
        };

        match txn.request.method {
            Method::Bye => {
                let response = self.response_for(&txn.request, StatusCode::OK);
                if let Err(err) = self.inner.transport.respond_reliable(&txn.key, response).await
                {
                    warn!(call_id = %dialogue.call_id, error = %err, "failed to answer BYE");
                }
                let cause = other_header_value(&txn.request.headers, "Reason")
                    .unwrap_or_else(|| "Hangup".to_string());
                self.call_hungup(&dialogue, &cause).await;
            }
            Method::Refer => {
                self.process_refer(&dialogue, &txn).await;
            }
            _ => {
                if let Err(err) = self
                    .forward_in_dialogue(&dialogue, &txn, txn.local, txn.source)
                    .await
                {
                    warn!(call_id = %dialogue.call_id, method = %txn.request.method, error = %err, "in-dialogue forward failed");
                    self.emit(
                        &dialogue.owner,
                        MonitorEventKind::DialPlanError,
                        Some(txn.source),
                        format!(
                            "failed to forward {} on call {}: {}",
                            txn.request.method, dialogue.call_id, err
                        ),
                    );
                }
            }
        }
    }

    /// Glue two unbridged dialogues into one call and persist both.
    pub async fn create_bridge(
        &self,
        mut first: Dialogue,
        mut second: Dialogue,
        owner: &str,
    ) -> Result<String> {
        if first.is_bridged() || second.is_bridged() {
            return Err(Error::invalid_argument(
                "cannot bridge a dialogue that is already bridged",
            ));
        }

        let bridge_id = new_id();
        first.bridge_id = bridge_id.clone();
        second.bridge_id = bridge_id.clone();

        for dialogue in [first, second] {
            let call_id = dialogue.call_id.clone();
            self.persist(dialogue).await?;
            self.emit(
                owner,
                MonitorEventKind::DialogueCreated,
                None,
                format!("dialogue created on call {call_id}"),
            );
        }

        debug!(bridge = %bridge_id, owner, "bridge created");
        Ok(bridge_id)
    }

    /// Tear down a bridged call: hang up both CDRs, BYE the peer leg and
    /// delete both dialogue records. Every step is best-effort; one
    /// failing step never stops the others.
    pub async fn call_hungup(&self, dialogue: &Dialogue, cause: &str) {
        if !dialogue.is_bridged() {
            warn!(dialogue = %dialogue.id, call_id = %dialogue.call_id, "hangup on unbridged dialogue, nothing to tear down");
            return;
        }
        info!(call_id = %dialogue.call_id, cause, "call hungup");

        if let Err(err) = self.inner.cdrs.hungup(&dialogue.cdr_id, cause).await {
            warn!(cdr = %dialogue.cdr_id, error = %err, "failed to hang up local cdr");
        }

        match self.inner.index.get_opposite(dialogue).await {
            Some(peer) => {
                if let Err(err) = self
                    .inner
                    .cdrs
                    .hungup(&peer.cdr_id, &self.inner.config.remote_hangup_cause)
                    .await
                {
                    warn!(cdr = %peer.cdr_id, error = %err, "failed to hang up peer cdr");
                }
                if let Err(err) = self.send_bye(&peer).await {
                    warn!(call_id = %peer.call_id, error = %err, "failed to send BYE to peer leg");
                }
                self.remove_dialogue(&peer).await;
            }
            None => {
                warn!(bridge = %dialogue.bridge_id, "no opposite dialogue for bridge");
            }
        }

        self.remove_dialogue(dialogue).await;
    }

    /// Relay one in-dialogue request onto the peer leg, rewriting its
    /// dialogue identity. The forwarded transaction is entered into the
    /// in-dialogue map before anything goes on the wire so a peer
    /// response can always find its way back.
    pub async fn forward_in_dialogue(
        &self,
        dialogue: &Dialogue,
        txn: &ServerTransaction,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<()> {
        let peer = self.inner.index.get_opposite(dialogue).await.ok_or_else(|| {
            Error::not_found(format!("no bridge peer for dialogue {}", dialogue.id))
        })?;
        debug!(
            method = %txn.request.method,
            call_id = %dialogue.call_id,
            peer_call_id = %peer.call_id,
            %local,
            %remote,
            "forwarding in-dialogue request"
        );

        let cseq = self.inner.dialogues.bump_cseq(&peer.id).await?;
        let method = txn.request.method.clone();

        let mut request = txn.request.clone();
        request.uri = peer.remote_target.clone();

        // Route sets are immutable within a dialogue; the peer leg uses
        // its own pre-loaded set.
        request.headers.retain(|header| {
            !matches!(header, rsip::Header::Route(_) | rsip::Header::RecordRoute(_))
        });
        for route in &peer.route_set {
            request
                .headers
                .push(rsip::Header::Route(Route::from(route.clone())));
        }

        request
            .headers
            .unique_push(rsip::Header::CallId(CallId::from(peer.call_id.clone())));
        request.headers.unique_push(rsip::Header::CSeq(
            typed::CSeq {
                seq: cseq,
                method: method.clone(),
            }
            .into(),
        ));

        let mut to_params = Vec::new();
        if !peer.remote_tag.is_empty() {
            to_params.push(Param::Tag(Tag::new(peer.remote_tag.clone())));
        }
        request.headers.unique_push(rsip::Header::To(
            typed::To {
                display_name: peer.remote_user_field.display_name.clone(),
                uri: peer.remote_user_field.uri.clone(),
                params: to_params,
            }
            .into(),
        ));
        request.headers.unique_push(rsip::Header::From(
            typed::From {
                display_name: peer.local_user_field.display_name.clone(),
                uri: peer.local_user_field.uri.clone(),
                params: vec![Param::Tag(Tag::new(peer.local_tag.clone()))],
            }
            .into(),
        ));

        request
            .headers
            .retain(|header| !matches!(header, rsip::Header::Contact(_)));
        request
            .headers
            .push(rsip::Header::Contact(self.local_contact()));

        request
            .headers
            .retain(|header| !matches!(header, rsip::Header::Via(_)));
        let branch = new_branch();
        request
            .headers
            .push(rsip::Header::Via(self.fresh_via(&branch)));

        request.headers.retain(|header| {
            !matches!(
                header,
                rsip::Header::Authorization(_) | rsip::Header::ProxyAuthorization(_)
            )
        });
        apply_user_agent(&mut request.headers, &self.inner.config.resolved_user_agent());

        if method == Method::Invite && !request.body.is_empty() {
            if let Ok(body) = String::from_utf8(request.body.clone()) {
                let apparent = other_header_value(&txn.request.headers, "Proxy-Received-From")
                    .and_then(|value| parse_endpoint_ip(&value))
                    .unwrap_or_else(|| remote.ip());
                let (mangled, changed) = mangle(&body, apparent);
                if changed {
                    request.body = mangled.into_bytes();
                }
            }
        }
        let content_length = request.body.len() as u32;
        request.headers.unique_push(rsip::Header::ContentLength(
            ContentLength::from(content_length),
        ));

        // Next-hop resolution is delegated; an unresolvable target is a
        // dial-plan problem, not a 4xx from here.
        let Some(target) = self
            .inner
            .transport
            .get_request_endpoint(&request, peer.proxy_send_from.as_deref())
            .await
        else {
            warn!(call_id = %peer.call_id, method = %method, "no endpoint resolves for forwarded request");
            self.emit(
                &dialogue.owner,
                MonitorEventKind::DialPlanError,
                Some(remote),
                format!(
                    "no route for in-dialogue {} on call {}",
                    method, peer.call_id
                ),
            );
            return Ok(());
        };

        // Track the inbound side's sequence number as well.
        if let Some(inbound_cseq) = txn
            .request
            .cseq_header()
            .ok()
            .and_then(|header| header.typed().ok())
            .map(|cseq| cseq.seq)
        {
            if let Err(err) = self
                .inner
                .dialogues
                .set_cseq_at_least(&dialogue.id, inbound_cseq)
                .await
            {
                warn!(dialogue = %dialogue.id, error = %err, "failed to record inbound cseq");
            }
        }

        let forwarded_key = TransactionKey::new(&branch, method.clone());
        {
            let mut map = self.inner.in_dialogue.lock().expect("in-dialogue map lock");
            map.insert(forwarded_key.clone(), txn.key.clone());
        }

        let created = if method == Method::Invite {
            self.inner.transport.create_uac_transaction(request, target).await
        } else {
            self.inner
                .transport
                .create_non_invite_transaction(request, target)
                .await
        };
        let client = match created {
            Ok(client) => client,
            Err(err) => {
                let mut map = self.inner.in_dialogue.lock().expect("in-dialogue map lock");
                map.remove(&forwarded_key);
                return Err(err);
            }
        };

        self.spawn_response_forwarder(client, method == Method::Invite);
        Ok(())
    }

    /// REFER entry point. Any fault that escapes the state machine is
    /// answered with a terminal 500 when possible.
    pub async fn process_refer(&self, dialogue: &Dialogue, txn: &ServerTransaction) {
        if let Err(err) = self.process_refer_inner(dialogue, txn).await {
            error!(call_id = %dialogue.call_id, error = %err, "REFER processing failed");
            let response = self.response_for(&txn.request, StatusCode::ServerInternalError);
            if let Err(send_err) = self.inner.transport.respond_reliable(&txn.key, response).await
            {
                warn!(error = %send_err, "failed to send 500 to REFER");
            }
        }
    }

    async fn process_refer_inner(
        &self,
        dialogue: &Dialogue,
        txn: &ServerTransaction,
    ) -> Result<()> {
        let refer_to = other_header_value(&txn.request.headers, "Refer-To");
        let Some(refer_to) = refer_to.filter(|value| refer_target_uri(value).is_some()) else {
            info!(call_id = %dialogue.call_id, "REFER with missing or malformed Refer-To");
            let response = self.response_for(&txn.request, StatusCode::BadRequest);
            self.inner
                .transport
                .respond_reliable(&txn.key, response)
                .await?;
            return Ok(());
        };

        let Some(replaces) = extract_replaces(&refer_to) else {
            debug!(call_id = %dialogue.call_id, "blind REFER, forwarding across the bridge");
            return self
                .forward_in_dialogue(dialogue, txn, txn.local, txn.source)
                .await;
        };

        let Some(replaced) = self.inner.index.get_by_replaces(&replaces).await else {
            info!(call_id = %dialogue.call_id, "Replaces dialogue not found, treating REFER as blind");
            return self
                .forward_in_dialogue(dialogue, txn, txn.local, txn.source)
                .await;
        };

        self.attended_transfer(dialogue, txn, replaced).await
    }

    /// Attended transfer: re-bridge the two surviving legs, keep the
    /// referrer posted over NOTIFY, refresh both survivors with each
    /// other's SDP and tear down the two dead legs. Past the 202 every
    /// step is best-effort; the original dialogues are dead either way.
    async fn attended_transfer(
        &self,
        dialogue: &Dialogue,
        txn: &ServerTransaction,
        replaced: Dialogue,
    ) -> Result<()> {
        let survivor_far = self.inner.index.get_opposite(&replaced).await.ok_or_else(|| {
            Error::internal(format!(
                "replaces dialogue {} has no bridge peer",
                replaced.id
            ))
        })?;
        let survivor_near = self.inner.index.get_opposite(dialogue).await.ok_or_else(|| {
            Error::internal(format!("dialogue {} has no bridge peer", dialogue.id))
        })?;

        info!(
            call_id = %dialogue.call_id,
            replaced_call_id = %replaced.call_id,
            "attended transfer accepted"
        );
        self.emit(
            &dialogue.owner,
            MonitorEventKind::TransferStarted,
            Some(txn.source),
            format!(
                "attended transfer of call {} replacing call {}",
                dialogue.call_id, replaced.call_id
            ),
        );

        let bridge_id = new_id();
        let survivor_far = {
            let bridge_id = bridge_id.clone();
            self.inner
                .dialogues
                .update_with(&survivor_far.id, move |d| {
                    d.bridge_id = bridge_id;
                    d.cseq = d.cseq.saturating_add(1);
                })
                .await?
        };
        let survivor_near = {
            let bridge_id = bridge_id.clone();
            self.inner
                .dialogues
                .update_with(&survivor_near.id, move |d| {
                    d.bridge_id = bridge_id;
                    d.cseq = d.cseq.saturating_add(1);
                })
                .await?
        };

        let accepted = self.response_for(&txn.request, StatusCode::Accepted);
        self.inner
            .transport
            .respond_reliable(&txn.key, accepted)
            .await?;

        if let Err(err) = self
            .send_refer_notify(dialogue, "SIP/2.0 100 Trying", "active;expires=32")
            .await
        {
            warn!(call_id = %dialogue.call_id, error = %err, "failed to send transfer progress NOTIFY");
        }

        // Both survivors learn the other's media; no ordering guarantee.
        let (far, near) = tokio::join!(
            self.reinvite(&survivor_far, &survivor_near.remote_sdp),
            self.reinvite(&survivor_near, &survivor_far.remote_sdp),
        );
        if let Err(err) = far {
            warn!(call_id = %survivor_far.call_id, error = %err, "transfer re-INVITE failed");
        }
        if let Err(err) = near {
            warn!(call_id = %survivor_near.call_id, error = %err, "transfer re-INVITE failed");
        }

        if let Err(err) = self
            .send_refer_notify(dialogue, "SIP/2.0 200 OK", "terminated;reason=noresource")
            .await
        {
            warn!(call_id = %dialogue.call_id, error = %err, "failed to send transfer completion NOTIFY");
        }

        if let Err(err) = self.send_bye(dialogue).await {
            warn!(call_id = %dialogue.call_id, error = %err, "failed to BYE referring leg");
        }
        self.call_hungup(dialogue, ATTENDED_TRANSFER_CAUSE).await;
        if let Err(err) = self.send_bye(&replaced).await {
            warn!(call_id = %replaced.call_id, error = %err, "failed to BYE replaced leg");
        }
        self.call_hungup(&replaced, ATTENDED_TRANSFER_CAUSE).await;

        self.emit(
            &dialogue.owner,
            MonitorEventKind::TransferCompleted,
            Some(txn.source),
            format!("attended transfer completed, new bridge {bridge_id}"),
        );
        Ok(())
    }

    /// Programmatic blind transfer: a higher layer answered a new call
    /// that replaces `dead`. Re-bridge `orphan` with `answered`, tear
    /// down `dead` and refresh `orphan` with the answered leg's SDP.
    pub async fn blind_transfer(
        &self,
        dead: &Dialogue,
        orphan: &Dialogue,
        mut answered: Dialogue,
    ) -> Result<()> {
        let bridge_id = new_id();
        let orphan = {
            let bridge_id = bridge_id.clone();
            self.inner
                .dialogues
                .update_with(&orphan.id, move |d| d.bridge_id = bridge_id)
                .await?
        };
        answered.bridge_id = bridge_id.clone();
        let answered_sdp = answered.remote_sdp.clone();
        let answered_owner = answered.owner.clone();
        let answered_call_id = answered.call_id.clone();
        self.inner.dialogues.add(answered).await?;
        self.emit(
            &answered_owner,
            MonitorEventKind::DialogueCreated,
            None,
            format!("dialogue created on call {answered_call_id}"),
        );
        info!(
            orphan_call_id = %orphan.call_id,
            answered_call_id = %answered_call_id,
            bridge = %bridge_id,
            "blind transfer re-bridged"
        );

        if let Err(err) = self.send_bye(dead).await {
            warn!(call_id = %dead.call_id, error = %err, "failed to BYE replaced leg");
        }
        self.call_hungup(dead, BLIND_TRANSFER_CAUSE).await;

        self.reinvite(&orphan, &answered_sdp).await
    }

    /// Refresh a dialogue with a replacement SDP body. Re-INVITEs never
    /// open a CDR row; the final response is observed but otherwise
    /// ignored.
    pub async fn reinvite(&self, dialogue: &Dialogue, replacement_sdp: &str) -> Result<()> {
        let cseq = self.inner.dialogues.bump_cseq(&dialogue.id).await?;
        let (request, _key) = self.build_in_dialogue_request(
            dialogue,
            Method::Invite,
            cseq,
            replacement_sdp.as_bytes().to_vec(),
            Some("application/sdp"),
        );

        let Some(target) = self
            .inner
            .transport
            .get_request_endpoint(&request, dialogue.proxy_send_from.as_deref())
            .await
        else {
            warn!(call_id = %dialogue.call_id, "no endpoint resolves for re-INVITE");
            self.emit(
                &dialogue.owner,
                MonitorEventKind::DialPlanError,
                None,
                format!("no route for re-INVITE on call {}", dialogue.call_id),
            );
            return Ok(());
        };

        let mut client = self
            .inner
            .transport
            .create_uac_transaction(request, target)
            .await?;

        let manager = self.clone();
        let triple = (
            dialogue.call_id.clone(),
            dialogue.local_tag.clone(),
            dialogue.remote_tag.clone(),
        );
        tokio::spawn(async move {
            while let Some(received) = client.receive().await {
                if matches!(
                    received.response.status_code.kind(),
                    StatusCodeKind::Provisional
                ) {
                    continue;
                }
                // Observability only.
                let located = manager
                    .inner
                    .index
                    .get_by_triple(&triple.0, &triple.1, &triple.2)
                    .await;
                debug!(
                    call_id = %triple.0,
                    status = %received.response.status_code,
                    located = located.is_some(),
                    "re-INVITE final response"
                );
            }
        });
        Ok(())
    }

    /// BYE on this dialogue's own leg with the next sequence number.
    async fn send_bye(&self, dialogue: &Dialogue) -> Result<()> {
        let cseq = self.inner.dialogues.bump_cseq(&dialogue.id).await?;
        let (request, _key) =
            self.build_in_dialogue_request(dialogue, Method::Bye, cseq, Vec::new(), None);

        let target = self
            .inner
            .transport
            .get_request_endpoint(&request, dialogue.proxy_send_from.as_deref())
            .await
            .ok_or_else(|| {
                Error::not_found(format!("no endpoint for BYE on call {}", dialogue.call_id))
            })?;

        let mut client = self
            .inner
            .transport
            .create_non_invite_transaction(request, target)
            .await?;
        tokio::spawn(async move { while client.receive().await.is_some() {} });
        Ok(())
    }

    /// Transfer progress NOTIFY: a single sipfrag status line with the
    /// matching subscription state.
    async fn send_refer_notify(
        &self,
        dialogue: &Dialogue,
        status_line: &str,
        subscription_state: &str,
    ) -> Result<()> {
        let cseq = self.inner.dialogues.bump_cseq(&dialogue.id).await?;
        let body = format!("{status_line}\r\n").into_bytes();
        let (mut request, _key) = self.build_in_dialogue_request(
            dialogue,
            Method::Notify,
            cseq,
            body,
            Some(SIPFRAG_CONTENT_TYPE),
        );
        request
            .headers
            .push(rsip::Header::Other("Event".into(), "refer".into()));
        request.headers.push(rsip::Header::Other(
            "Subscription-State".into(),
            subscription_state.into(),
        ));

        let target = self
            .inner
            .transport
            .get_request_endpoint(&request, dialogue.proxy_send_from.as_deref())
            .await
            .ok_or_else(|| {
                Error::not_found(format!(
                    "no endpoint for NOTIFY on call {}",
                    dialogue.call_id
                ))
            })?;

        let mut client = self
            .inner
            .transport
            .create_non_invite_transaction(request, target)
            .await?;
        tokio::spawn(async move { while client.receive().await.is_some() {} });
        Ok(())
    }

    /// Build a fresh in-dialogue request on this leg: the dialogue's
    /// identity headers, its route set, one fresh Via and our Contact.
    fn build_in_dialogue_request(
        &self,
        dialogue: &Dialogue,
        method: Method,
        cseq: u32,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> (rsip::Request, TransactionKey) {
        let mut headers = rsip::Headers::default();

        let branch = new_branch();
        headers.push(rsip::Header::Via(self.fresh_via(&branch)));
        headers.push(rsip::Header::MaxForwards(MaxForwards::from(70u32)));

        headers.push(rsip::Header::From(
            typed::From {
                display_name: dialogue.local_user_field.display_name.clone(),
                uri: dialogue.local_user_field.uri.clone(),
                params: vec![Param::Tag(Tag::new(dialogue.local_tag.clone()))],
            }
            .into(),
        ));
        let mut to_params = Vec::new();
        if !dialogue.remote_tag.is_empty() {
            to_params.push(Param::Tag(Tag::new(dialogue.remote_tag.clone())));
        }
        headers.push(rsip::Header::To(
            typed::To {
                display_name: dialogue.remote_user_field.display_name.clone(),
                uri: dialogue.remote_user_field.uri.clone(),
                params: to_params,
            }
            .into(),
        ));

        headers.push(rsip::Header::CallId(CallId::from(dialogue.call_id.clone())));
        headers.push(rsip::Header::CSeq(
            typed::CSeq {
                seq: cseq,
                method: method.clone(),
            }
            .into(),
        ));

        for route in &dialogue.route_set {
            headers.push(rsip::Header::Route(Route::from(route.clone())));
        }

        headers.push(rsip::Header::Contact(self.local_contact()));
        apply_user_agent(&mut headers, &self.inner.config.resolved_user_agent());

        if let Some(content_type) = content_type {
            headers.push(rsip::Header::ContentType(ContentType::from(
                content_type.to_string(),
            )));
        }
        headers.push(rsip::Header::ContentLength(ContentLength::from(
            body.len() as u32
        )));

        let request = rsip::Request {
            method: method.clone(),
            uri: dialogue.remote_target.clone(),
            version: rsip::Version::V2,
            headers,
            body,
        };
        (request, TransactionKey::new(&branch, method))
    }

    /// Response whose identity headers are those of the origin request.
    /// Route sets are immutable within a dialogue, so Record-Route and
    /// Route are never copied over.
    fn response_for(&self, request: &rsip::Request, status: StatusCode) -> rsip::Response {
        let mut headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                rsip::Header::Via(via) => headers.push(rsip::Header::Via(via.clone())),
                rsip::Header::To(to) => headers.push(rsip::Header::To(to.clone())),
                rsip::Header::From(from) => headers.push(rsip::Header::From(from.clone())),
                rsip::Header::CallId(call_id) => {
                    headers.push(rsip::Header::CallId(call_id.clone()))
                }
                rsip::Header::CSeq(cseq) => headers.push(rsip::Header::CSeq(cseq.clone())),
                _ => {}
            }
        }
        headers.push(rsip::Header::Contact(self.local_contact()));
        apply_user_agent(&mut headers, &self.inner.config.resolved_user_agent());
        headers.push(rsip::Header::ContentLength(ContentLength::from(0u32)));

        rsip::Response {
            status_code: status,
            version: rsip::Version::V2,
            headers,
            body: Vec::new(),
        }
    }

    fn spawn_response_forwarder(&self, mut client: ClientTransaction, is_invite: bool) {
        let manager = self.clone();
        tokio::spawn(async move {
            let forwarded_key = client.key().clone();
            while let Some(received) = client.receive().await {
                manager
                    .forward_transaction_response(&forwarded_key, received, is_invite)
                    .await;
            }
            // Transaction finalized: drop the mapping under the lock.
            let mut map = manager
                .inner
                .in_dialogue
                .lock()
                .expect("in-dialogue map lock");
            map.remove(&forwarded_key);
        });
    }

    async fn forward_transaction_response(
        &self,
        forwarded_key: &TransactionKey,
        received: ReceivedResponse,
        is_invite: bool,
    ) {
        let origin_key = {
            let map = self.inner.in_dialogue.lock().expect("in-dialogue map lock");
            map.get(forwarded_key).cloned()
        };
        let Some(origin_key) = origin_key else {
            warn!(forwarded = %forwarded_key, "response for unknown forwarded transaction");
            return;
        };
        let Some(origin) = self.inner.transport.get_transaction(&origin_key).await else {
            debug!(origin = %origin_key, "origin transaction gone, dropping response");
            return;
        };

        let status = received.response.status_code.clone();
        let mut response = self.response_for(&origin.request, status.clone());

        let mut body = received.response.body.clone();
        if is_invite && !body.is_empty() {
            if let Ok(text) = String::from_utf8(body.clone()) {
                let (mangled, changed) = mangle(&text, received.source.ip());
                if changed {
                    body = mangled.into_bytes();
                }
            }
        }
        if let Some(content_type) = received.response.headers.iter().find_map(|header| {
            match header {
                rsip::Header::ContentType(content_type) => Some(content_type.clone()),
                _ => None,
            }
        }) {
            response
                .headers
                .unique_push(rsip::Header::ContentType(content_type));
        }
        response.headers.unique_push(rsip::Header::ContentLength(
            ContentLength::from(body.len() as u32),
        ));
        response.body = body;

        let result = if matches!(status.kind(), StatusCodeKind::Provisional) {
            self.inner
                .transport
                .respond_provisional(&origin_key, response)
                .await
        } else {
            self.inner
                .transport
                .respond_reliable(&origin_key, response)
                .await
        };
        if let Err(err) = result {
            warn!(origin = %origin_key, status = %status, error = %err, "failed to forward response");
        }
    }

    async fn persist(&self, dialogue: Dialogue) -> Result<()> {
        if self.inner.dialogues.get_by_id(&dialogue.id).await.is_some() {
            self.inner.dialogues.update(dialogue).await
        } else {
            self.inner.dialogues.add(dialogue).await
        }
    }

    async fn remove_dialogue(&self, dialogue: &Dialogue) {
        if self.inner.dialogues.delete(&dialogue.id).await {
            self.emit(
                &dialogue.owner,
                MonitorEventKind::DialogueRemoved,
                None,
                format!("dialogue removed on call {}", dialogue.call_id),
            );
        }
    }

    fn emit(&self, owner: &str, kind: MonitorEventKind, remote: Option<SocketAddr>, text: String) {
        self.inner.monitor.on_event(MonitorEvent {
            owner: owner.to_string(),
            kind,
            remote,
            text,
        });
    }

    fn local_contact(&self) -> Contact {
        let local = self.inner.transport.get_default_endpoint();
        Contact::from(format!("<sip:{}>", format_socket_for_sip(&local)))
    }

    fn fresh_via(&self, branch: &str) -> rsip::headers::Via {
        let local = self.inner.transport.get_default_endpoint();
        typed::Via {
            version: rsip::Version::V2,
            transport: Transport::Udp,
            uri: Uri::from(local),
            params: vec![Param::Branch(Branch::new(branch.to_string()))],
        }
        .into()
    }

    #[cfg(test)]
    fn forwarded_transaction_count(&self) -> usize {
        self.inner
            .in_dialogue
            .lock()
            .expect("in-dialogue map lock")
            .len()
    }
}

/// The target URI inside a Refer-To value, without its embedded headers.
fn refer_target_uri(refer_to: &str) -> Option<Uri> {
    let inner = match (refer_to.find('<'), refer_to.find('>')) {
        (Some(open), Some(close)) if close > open => &refer_to[open + 1..close],
        _ => refer_to.trim(),
    };
    let uri_part = inner.split('?').next().unwrap_or(inner).trim();
    if uri_part.is_empty() {
        return None;
    }
    Uri::try_from(uri_part).ok()
}

/// Extract an embedded `Replaces` header value from a Refer-To URI,
/// still URI-escaped.
fn extract_replaces(refer_to: &str) -> Option<String> {
    let lower = refer_to.to_ascii_lowercase();
    let start = lower.find("replaces=")? + "replaces=".len();
    let rest = &refer_to[start..];
    let end = rest
        .find(|c| c == '>' || c == '&' || c == ';')
        .unwrap_or(rest.len());
    let value = rest[..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Best-effort IP extraction from endpoint strings such as
/// `udp:203.0.113.7:5060`, `203.0.113.7:5060` or a bare address.
fn parse_endpoint_ip(value: &str) -> Option<IpAddr> {
    let trimmed = value
        .trim()
        .trim_start_matches("udp:")
        .trim_start_matches("tcp:")
        .trim_start_matches("sip:");
    if let Ok(socket) = trimmed.parse::<SocketAddr>() {
        return Some(socket.ip());
    }
    trimmed.parse::<IpAddr>().ok()
}
