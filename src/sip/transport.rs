//! Collaborator surface of the SIP transaction layer.
//!
//! The dialogue manager never talks to sockets for signalling; it hands
//! fully-built requests to a [`SipTransport`] and pulls responses off the
//! returned client transaction, mirroring how the transaction layer below
//! matches responses to requests.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use rsip::transport::Transport;
use tokio::sync::mpsc;

use crate::error::Result;

/// Identifies one transaction: the Via branch plus the method, which is
/// what the transaction layer keys its matching on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey(String);

impl TransactionKey {
    pub fn new(branch: &str, method: rsip::Method) -> Self {
        Self(format!("{branch}|{method}"))
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved next hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipEndpoint {
    pub addr: SocketAddr,
    pub transport: Transport,
}

impl From<SocketAddr> for SipEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            addr,
            transport: Transport::Udp,
        }
    }
}

impl fmt::Display for SipEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.addr)
    }
}

/// A response delivered to a client transaction, together with the
/// transport-reported source it arrived from.
#[derive(Debug, Clone)]
pub struct ReceivedResponse {
    pub response: rsip::Response,
    pub source: SocketAddr,
}

/// UAC transaction handle. Responses are pulled with [`receive`]; the
/// stream ends when the transaction layer finalizes the transaction.
///
/// [`receive`]: ClientTransaction::receive
pub struct ClientTransaction {
    key: TransactionKey,
    request: rsip::Request,
    responses: mpsc::Receiver<ReceivedResponse>,
}

impl ClientTransaction {
    pub fn new(
        key: TransactionKey,
        request: rsip::Request,
        responses: mpsc::Receiver<ReceivedResponse>,
    ) -> Self {
        Self {
            key,
            request,
            responses,
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn request(&self) -> &rsip::Request {
        &self.request
    }

    pub async fn receive(&mut self) -> Option<ReceivedResponse> {
        self.responses.recv().await
    }
}

impl fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("key", &self.key)
            .field("method", &self.request.method)
            .finish()
    }
}

/// UAS transaction as delivered by the transport: the parsed request plus
/// the endpoints it travelled between.
#[derive(Debug, Clone)]
pub struct ServerTransaction {
    pub key: TransactionKey,
    pub request: rsip::Request,
    /// Transport-reported remote endpoint the request arrived from.
    pub source: SocketAddr,
    /// Local endpoint the request arrived on.
    pub local: SocketAddr,
}

#[async_trait]
pub trait SipTransport: Send + Sync + 'static {
    /// Start an INVITE client transaction; the request goes on the wire
    /// before this returns.
    async fn create_uac_transaction(
        &self,
        request: rsip::Request,
        target: SipEndpoint,
    ) -> Result<ClientTransaction>;

    /// Start a non-INVITE client transaction (BYE, NOTIFY, INFO, ...).
    async fn create_non_invite_transaction(
        &self,
        request: rsip::Request,
        target: SipEndpoint,
    ) -> Result<ClientTransaction>;

    /// Look up a live UAS transaction, typically the origin of a forwarded
    /// request whose response just came back.
    async fn get_transaction(&self, key: &TransactionKey) -> Option<ServerTransaction>;

    /// Dispatch a provisional response on a UAS transaction.
    async fn respond_provisional(
        &self,
        origin: &TransactionKey,
        response: rsip::Response,
    ) -> Result<()>;

    /// Dispatch a final response reliably on a UAS transaction.
    async fn respond_reliable(
        &self,
        origin: &TransactionKey,
        response: rsip::Response,
    ) -> Result<()>;

    /// Resolve the next hop for a request, honouring an optional
    /// source-routing hint. `None` means no endpoint resolves.
    async fn get_request_endpoint(
        &self,
        request: &rsip::Request,
        proxy_send_from: Option<&str>,
    ) -> Option<SipEndpoint>;

    /// The outward-facing local endpoint used for Contact and Via.
    fn get_default_endpoint(&self) -> SocketAddr;
}
