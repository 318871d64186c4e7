mod utils;

pub mod dialogue;
pub mod index;
pub mod manager;
pub mod transport;

pub use dialogue::{Cdr, Dialogue, SipUserField};
pub use index::DialogueIndex;
pub use manager::{
    DialogueManager, DialogueManagerBuilder, DialogueMonitor, MonitorEvent, MonitorEventKind,
    NullMonitor,
};
pub use transport::{
    ClientTransaction, ReceivedResponse, ServerTransaction, SipEndpoint, SipTransport,
    TransactionKey,
};
