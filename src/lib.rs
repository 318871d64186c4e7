//! B2BUA dialogue core with an RTP media channel.
//! This crate tracks established SIP calls as bridged pairs of peer legs,
//! relays in-dialogue requests between them with full header rewriting and
//! NAT-corrected SDP, implements REFER-based call transfer, and manages
//! the paired UDP sockets a media session runs over.

mod net;

pub mod config;
pub mod error;
pub mod media;
pub mod sip;
pub mod store;

pub use config::{B2buaConfig, BindConfig, ChannelConfig, PortRange};
pub use error::{Error, Result};
pub use media::{ChannelEvent, PacketKind, RtpChannel, SendOutcome, UdpReceiver};
pub use sip::{
    Cdr, Dialogue, DialogueIndex, DialogueManager, DialogueManagerBuilder, DialogueMonitor,
    ServerTransaction, SipTransport, SipUserField,
};
pub use store::{CdrStore, DialogueStore};
