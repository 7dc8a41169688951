//! A multi-reactor TCP networking library: single-threaded event loops,
//! each owning a set of channels, with cross-loop handoff for accepted and
//! initiated connections and a process-wide round-robin load balancer.

pub mod balancer;
pub mod channel;
pub mod channel_ref;
pub mod config;
pub mod domain;
pub mod error;
pub mod event;
pub mod profile;
pub mod reactor_loop;
pub mod timer;

pub use balancer::Balancer;
pub use channel::Channel;
pub use channel_ref::{Callback, ChannelRef};
pub use config::{AcceptorConfig, ConnectorConfig, FrameworkConfig, LoopBalanceOptions};
pub use domain::DomainRegistry;
pub use error::{ReactorError, Result};
pub use event::{ChannelEvent, ChannelState, EventMask};
pub use profile::{Bandwidth, Profile};
pub use reactor_loop::{Loop, LoopHandle};

pub fn init_logging(max_level: log::LevelFilter) -> std::result::Result<(), log::SetLoggerError> {
    reactor_logger::init(max_level, false)
}
