use std::net::{IpAddr, SocketAddr};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "sip-b2bua";

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct BindConfig {
    pub address: IpAddr,
    pub port: u16,
    /// Optional Linux interface name for SO_BINDTODEVICE.
    pub interface: Option<String>,
}

impl BindConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

/// Socket layout for one RTP channel: the range the media port is picked
/// from and whether a companion control (RTCP) socket is bound on the odd
/// port above it.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub bind: BindConfig,
    pub port_range: PortRange,
    /// When false the media socket carries RTP and RTCP multiplexed.
    pub create_control_socket: bool,
    /// Capacity of the packet event queue handed to the consumer.
    pub event_queue: usize,
}

impl ChannelConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.port_range.min % 2 != 0 {
            return Err(crate::Error::configuration(
                "media port range must start on an even port",
            ));
        }
        if self.port_range.max <= self.port_range.min {
            return Err(crate::Error::configuration(
                "media port range must span at least two ports",
            ));
        }
        if self.event_queue == 0 {
            return Err(crate::Error::configuration(
                "channel event queue must hold at least one event",
            ));
        }
        Ok(())
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct B2buaConfig {
    /// Value stamped into the User-Agent header of every re-dispatched message.
    pub user_agent: Option<String>,
    /// CDR cause recorded on the peer leg when the other side hangs up.
    pub remote_hangup_cause: String,
    /// Optional outbound proxy hint handed to next-hop resolution.
    pub outbound_proxy: Option<SocketAddr>,
}

impl B2buaConfig {
    pub fn resolved_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

impl Default for B2buaConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            remote_hangup_cause: "Remote hungup".to_string(),
            outbound_proxy: None,
        }
    }
}
