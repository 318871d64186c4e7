pub mod channel;
pub mod receiver;
pub mod sdp;

pub use channel::{ChannelEvent, ChannelStats, PacketKind, RtpChannel, SendOutcome};
pub use receiver::{ReceiverEvent, UdpReceiver, RECV_BUFFER_SIZE};
pub use sdp::mangle;
