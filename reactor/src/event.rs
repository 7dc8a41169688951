use bitflags::bitflags;

bitflags! {
    /// Readiness interest/notification mask. Mirrors the selector's view of
    /// a channel: which directions it should be polled for, and which
    /// directions fired on a given `update`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventMask: u8 {
        const RECV = 0b01;
        const SEND = 0b10;
    }
}

/// Lifecycle event delivered to a channel reference's callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Connect,
    Accept,
    Recv,
    Send,
    Close,
    Timeout,
}

/// Exclusive channel states. `init` precedes any network operation; `close`
/// is terminal and is never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Connect,
    Accept,
    Active,
    Close,
}

impl ChannelState {
    pub fn is_in_loop(self) -> bool {
        matches!(self, ChannelState::Connect | ChannelState::Accept | ChannelState::Active)
    }
}
