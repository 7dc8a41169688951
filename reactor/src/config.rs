use std::net::IpAddr;
use std::time::Duration;

use bitflags::bitflags;

use crate::channel_ref::Callback;

bitflags! {
    /// Per-loop opt-in to the process balancer. Migration only occurs when
    /// the relevant bit is set and the balancer picks a different loop.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LoopBalanceOptions: u8 {
        const BALANCER_IN = 0b01;
        const BALANCER_OUT = 0b10;
    }
}

/// Configuration for a listening channel. Coercions are applied eagerly in
/// the constructor so the core never special-cases a zero sentinel once a
/// config exists.
#[derive(Clone)]
pub struct AcceptorConfig {
    pub ip: IpAddr,
    pub port: u16,
    pub backlog: u32,
    pub idle_timeout: Option<Duration>,
    pub max_send_list_count: usize,
    pub max_recv_buffer_length: usize,
    pub callback: Option<Callback>,
}

impl AcceptorConfig {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            backlog: 0,
            idle_timeout: None,
            max_send_list_count: 0,
            max_recv_buffer_length: 0,
            callback: None,
        }
        .coerced()
    }

    fn coerced(mut self) -> Self {
        if self.backlog == 0 {
            self.backlog = 100;
        }
        if self.max_send_list_count == 0 {
            self.max_send_list_count = i32::MAX as usize;
        }
        if self.max_recv_buffer_length == 0 {
            self.max_recv_buffer_length = 16 * 1024;
        }
        self
    }
}

/// Configuration for an outbound channel.
#[derive(Clone)]
pub struct ConnectorConfig {
    pub ip: IpAddr,
    pub port: u16,
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub max_send_list_count: usize,
    pub max_recv_buffer_length: usize,
    pub auto_reconnect: bool,
    pub callback: Option<Callback>,
}

impl ConnectorConfig {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            idle_timeout: None,
            connect_timeout: None,
            max_send_list_count: 0,
            max_recv_buffer_length: 0,
            auto_reconnect: false,
            callback: None,
        }
        .coerced()
    }

    fn coerced(mut self) -> Self {
        if self.max_send_list_count == 0 {
            self.max_send_list_count = i32::MAX as usize;
        }
        if self.max_recv_buffer_length == 0 {
            self.max_recv_buffer_length = 16 * 1024;
        }
        self
    }
}

/// Worker-thread settings for the higher-level framework that spawns loops
/// from declarative configuration. Not implemented by this crate; carried
/// here because the core's `Loop` constructor accepts its timer cadence.
#[derive(Clone, Copy, Debug)]
pub struct FrameworkConfig {
    pub worker_thread_count: usize,
    pub worker_timer_freq_ms: u64,
    pub worker_timer_slot: i32,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            worker_thread_count: 1,
            worker_timer_freq_ms: 1000,
            worker_timer_slot: 512,
        }
        .coerced()
    }
}

impl FrameworkConfig {
    fn coerced(mut self) -> Self {
        if self.worker_timer_freq_ms == 0 {
            self.worker_timer_freq_ms = 1000;
        }
        if self.worker_timer_slot <= 0 {
            self.worker_timer_slot = 360;
        }
        self
    }

    pub fn new(worker_thread_count: usize, worker_timer_freq_ms: u64, worker_timer_slot: i32) -> Self {
        Self {
            worker_thread_count,
            worker_timer_freq_ms,
            worker_timer_slot,
        }
        .coerced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptor_coerces_zero_backlog_and_buffer_sizes() {
        let cfg = AcceptorConfig::new("127.0.0.1".parse().unwrap(), 9000);
        assert_eq!(cfg.backlog, 100);
        assert_eq!(cfg.max_send_list_count, i32::MAX as usize);
        assert_eq!(cfg.max_recv_buffer_length, 16 * 1024);
    }

    #[test]
    fn framework_config_coerces_invalid_timer_settings() {
        let cfg = FrameworkConfig::new(4, 0, -1);
        assert_eq!(cfg.worker_timer_freq_ms, 1000);
        assert_eq!(cfg.worker_timer_slot, 360);
    }
}
