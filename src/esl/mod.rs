//! Event Socket integration: wire format, inbound client, command
//! adapters, the outbound event-relay server, and the RTP media plane.

pub mod client;
pub mod command;
pub mod event;
pub mod relay;
pub mod rtp;

pub use client::{EslClient, EslError, EslResult};
pub use command::{
    adapter_for_mode, EslCommandInterface, HybridCommandAdapter, InboundCommandAdapter,
    OutboundCommandAdapter,
};
pub use event::{ChannelVars, EslEvent, EslFrame};
pub use relay::{OutboundRelayHandle, RelayRegistry};
