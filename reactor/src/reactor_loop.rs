use std::cell::Cell;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::{Events, Interest, Poll, Token};
use slotmap::{DefaultKey, SlotMap};

use crate::balancer::Balancer;
use crate::channel::Channel;
use crate::channel_ref::{Callback, ChannelRef, UpdateOutcome};
use crate::config::{AcceptorConfig, ConnectorConfig};
use crate::domain::DomainRegistry;
use crate::error::{ReactorError, Result};
use crate::event::EventMask;
use crate::profile::Profile;

thread_local! {
    static THREAD_NUMERIC_ID: Cell<u64> = const { Cell::new(0) };
}
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

fn current_thread_numeric_id() -> u64 {
    THREAD_NUMERIC_ID.with(|cell| {
        let mut id = cell.get();
        if id == 0 {
            id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            cell.set(id);
        }
        id
    })
}

/// Deferred operation enqueued by a thread other than the loop's own.
/// Drained at the start of every tick, before readiness events.
pub enum Message {
    Close(DefaultKey),
    Send(DefaultKey, Bytes),
    /// Selector interest should be re-synced to a reference's current mask.
    /// Dispatched by `ChannelRef::write_inline` even when the write itself
    /// ran inline, since only the loop can touch `mio::Poll`.
    Rearm(DefaultKey),
    /// An `accept` bind/listen that couldn't run inline; the reference is
    /// not yet in any loop's registry.
    AcceptAsync(ChannelRef, SocketAddr, u32),
    AcceptHandoff(ChannelRef),
    ConnectHandoff(ChannelRef),
}

/// Cheap, cloneable reference to a loop's identity and inbox. Channel
/// references hold one of these instead of an `Arc<Loop>` so that the loop
/// and its channels don't form an ownership cycle.
#[derive(Clone)]
pub struct LoopHandle {
    thread_id: Arc<AtomicU64>,
    inbox: Sender<Message>,
    profile: Arc<Profile>,
    domains: Arc<Mutex<DomainRegistry>>,
}

impl LoopHandle {
    pub fn is_same(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.thread_id, &other.thread_id)
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// `true` if the loop has not started yet (any thread may act inline)
    /// or the caller is already on the loop's own thread.
    pub fn runs_inline_for_caller(&self) -> bool {
        let owner = self.thread_id.load(Ordering::Acquire);
        owner == 0 || owner == current_thread_numeric_id()
    }

    pub fn dispatch(&self, msg: Message) {
        let _ = self.inbox.send(msg);
    }

    pub(crate) fn join_domain(&self, domain_id: u64, key: DefaultKey) {
        self.domains.lock().unwrap().join(domain_id, key);
    }

    pub(crate) fn leave_domain(&self, domain_id: u64, key: DefaultKey) {
        self.domains.lock().unwrap().leave(domain_id, key);
    }

    #[doc(hidden)]
    pub fn detached() -> Self {
        let (tx, _rx) = unbounded();
        Self {
            thread_id: Arc::new(AtomicU64::new(0)),
            inbox: tx,
            profile: Arc::new(Profile::default()),
            domains: Arc::new(Mutex::new(DomainRegistry::new())),
        }
    }
}

/// Single-threaded reactor. Owns every channel reference whose state is
/// `connect`, `accept`, or `active`; references in `init` or `close` are
/// never in `channels`.
pub struct Loop {
    poll: Poll,
    channels: SlotMap<DefaultKey, ChannelRef>,
    tokens: std::collections::HashMap<Token, DefaultKey>,
    keys_to_tokens: std::collections::HashMap<DefaultKey, Token>,
    next_token: usize,
    inbox_tx: Sender<Message>,
    inbox_rx: Receiver<Message>,
    thread_id: Arc<AtomicU64>,
    profile: Arc<Profile>,
    timers: crate::timer::TimerWheel,
    timer_freq: Duration,
    domains: Arc<Mutex<DomainRegistry>>,
    balancer: Option<Arc<Balancer>>,
}

impl Loop {
    pub fn new() -> std::io::Result<Self> {
        let (inbox_tx, inbox_rx) = unbounded();
        Ok(Self {
            poll: Poll::new()?,
            channels: SlotMap::new(),
            tokens: std::collections::HashMap::new(),
            keys_to_tokens: std::collections::HashMap::new(),
            next_token: 0,
            inbox_tx,
            inbox_rx,
            thread_id: Arc::new(AtomicU64::new(0)),
            profile: Arc::new(Profile::default()),
            timers: crate::timer::TimerWheel::new(),
            timer_freq: Duration::from_millis(1000),
            domains: Arc::new(Mutex::new(DomainRegistry::new())),
            balancer: None,
        })
    }

    /// Opts this loop into the given balancer under `options`. Registration
    /// happens immediately, so `options` must reflect the loop's final
    /// participation — there is no way to change it later.
    pub fn with_balancer(mut self, balancer: Arc<Balancer>, options: crate::config::LoopBalanceOptions) -> Self {
        balancer.register(self.handle(), options);
        self.balancer = Some(balancer);
        self
    }

    /// Cadence at which each channel's idle/connect deadline is re-checked.
    /// Defaults to 1000ms, matching `FrameworkConfig::worker_timer_freq_ms`'s
    /// own default.
    pub fn with_timer_freq(mut self, freq: Duration) -> Self {
        self.timer_freq = if freq.is_zero() { Duration::from_millis(1000) } else { freq };
        self
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            thread_id: Arc::clone(&self.thread_id),
            inbox: self.inbox_tx.clone(),
            profile: Arc::clone(&self.profile),
            domains: Arc::clone(&self.domains),
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn domains(&self) -> MutexGuard<'_, DomainRegistry> {
        self.domains.lock().unwrap()
    }

    /// Marks the loop as started on the calling thread. Must be called
    /// before the first `tick` on whichever thread owns the loop.
    pub fn mark_started(&self) {
        self.thread_id
            .store(current_thread_numeric_id(), Ordering::Release);
    }

    pub fn new_channel_ref(&self, max_recv: usize, max_send: usize) -> ChannelRef {
        ChannelRef::new(self.handle(), Channel::new(max_recv, max_send))
    }

    /// Builds a listening reference from an [`AcceptorConfig`], registers it
    /// with the selector, and returns its key. `backlog` is passed straight
    /// through to `listen(2)`.
    pub fn listen(&mut self, config: AcceptorConfig) -> Result<DefaultKey> {
        let channel_ref = ChannelRef::new(
            self.handle(),
            Channel::new(config.max_recv_buffer_length, config.max_send_list_count),
        );
        if let Some(cb) = config.callback {
            channel_ref.set_cb(cb);
        }
        if let Some(idle) = config.idle_timeout {
            channel_ref.set_timeout(Some(idle), None);
        }
        channel_ref.accept(SocketAddr::new(config.ip, config.port), config.backlog)?;
        Ok(self.add(channel_ref))
    }

    /// Builds an outbound reference from a [`ConnectorConfig`] and starts the
    /// connect. If a balancer is registered for outbound migration and picks
    /// a different loop, ownership hands off via `Message::ConnectHandoff`
    /// and the returned key is a null `DefaultKey` — the reference now lives
    /// in the destination loop's registry, not this one's.
    pub fn connect(&mut self, config: ConnectorConfig) -> Result<DefaultKey> {
        let channel_ref = ChannelRef::new(
            self.handle(),
            Channel::new(config.max_recv_buffer_length, config.max_send_list_count),
        );
        if let Some(cb) = config.callback {
            channel_ref.set_cb(cb);
        }
        if let Some(idle) = config.idle_timeout {
            channel_ref.set_timeout(Some(idle), None);
        }
        channel_ref.set_auto_reconnect(config.auto_reconnect);
        let addr = SocketAddr::new(config.ip, config.port);
        channel_ref.connect(addr, config.connect_timeout.unwrap_or(Duration::ZERO))?;

        let destination = self.balancer.as_ref().and_then(|b| b.pick_out(&self.handle()));
        match destination {
            Some(dest) if !dest.is_same(&self.handle()) => {
                dest.dispatch(Message::ConnectHandoff(channel_ref));
                Ok(DefaultKey::default())
            }
            _ => Ok(self.add(channel_ref)),
        }
    }

    fn register_interest(&mut self, key: DefaultKey) -> std::io::Result<()> {
        let token = match self.keys_to_tokens.get(&key) {
            Some(t) => *t,
            None => {
                let t = Token(self.next_token);
                self.next_token += 1;
                self.keys_to_tokens.insert(key, t);
                t
            }
        };
        self.tokens.insert(token, key);
        let channel_ref = &self.channels[key];
        let mask = channel_ref.mask();
        if let Some(interest) = mask_to_interest(mask) {
            channel_ref_register(&self.poll, channel_ref, token, interest)?;
        }
        Ok(())
    }

    pub fn add(&mut self, channel_ref: ChannelRef) -> DefaultKey {
        let key = self.channels.insert(channel_ref);
        self.channels[key].set_key(Some(key));
        self.profile.on_channel_established();
        let _ = self.register_interest(key);
        self.timers.schedule(key, Instant::now() + self.timer_freq);
        key
    }

    fn remove(&mut self, key: DefaultKey) {
        if let Some(channel_ref) = self.channels.remove(key) {
            channel_ref.set_key(None);
            self.profile.on_channel_closed();
        }
        if let Some(token) = self.keys_to_tokens.remove(&key) {
            self.tokens.remove(&token);
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(msg) = self.inbox_rx.try_recv() {
            match msg {
                Message::Close(key) => {
                    if let Some(channel_ref) = self.channels.get(key) {
                        channel_ref.close_inline();
                    }
                    self.remove(key);
                }
                Message::Send(key, bytes) => {
                    if let Some(channel_ref) = self.channels.get(key) {
                        let _ = channel_ref.write_inline(&bytes);
                    }
                }
                Message::Rearm(key) => {
                    let _ = self.register_interest(key);
                }
                Message::AcceptAsync(channel_ref, addr, backlog) => {
                    if channel_ref.accept_inline(addr, backlog).is_ok() {
                        match channel_ref.key() {
                            Some(key) => {
                                let _ = self.register_interest(key);
                            }
                            None => {
                                self.add(channel_ref);
                            }
                        }
                    }
                }
                Message::AcceptHandoff(channel_ref) => {
                    self.add(channel_ref);
                }
                Message::ConnectHandoff(channel_ref) => {
                    self.add(channel_ref);
                }
            }
        }
    }

    /// Polls the timer wheel for channels due a recheck this tick. A popped
    /// key whose channel has since closed is simply discarded; a still-live
    /// one is checked and rescheduled for the next cadence.
    fn check_timeouts(&mut self) {
        let now = Instant::now();
        for key in self.timers.drain_due(now) {
            if let Some(channel_ref) = self.channels.get(key) {
                channel_ref.check_timeout(now);
                self.timers.schedule(key, now + self.timer_freq);
            }
        }
    }

    fn apply_outcomes(&mut self, key: DefaultKey, outcomes: Vec<UpdateOutcome>) {
        for outcome in outcomes {
            match outcome {
                UpdateOutcome::None => {}
                UpdateOutcome::Rearm => {
                    let _ = self.register_interest(key);
                }
                UpdateOutcome::Closed => {
                    self.remove(key);
                }
                UpdateOutcome::Reconnected(fresh) => {
                    self.add(fresh);
                }
                UpdateOutcome::Accepted(client, addr) => {
                    self.handle_accepted(key, client, addr);
                }
            }
        }
    }

    fn handle_accepted(&mut self, listener_key: DefaultKey, client: Channel, _addr: SocketAddr) {
        let callback = self.channels.get(listener_key).and_then(listener_callback);
        let destination = self
            .balancer
            .as_ref()
            .and_then(|b| b.pick_in(&self.handle()));

        let owner = destination.clone().unwrap_or_else(|| self.handle());
        let client_ref = ChannelRef::new_active(owner, client, callback);

        match destination {
            Some(dest) if !dest.is_same(&self.handle()) => {
                dest.dispatch(Message::AcceptHandoff(client_ref));
            }
            _ => {
                self.add(client_ref);
            }
        }
    }

    /// Runs one iteration: drain the inbox, check timers, poll readiness
    /// with the given timeout, and update every channel that fired.
    pub fn tick(&mut self, poll_timeout: Option<Duration>) -> Result<()> {
        self.drain_inbox();
        self.check_timeouts();

        let mut events = Events::with_capacity(256);
        self.poll
            .poll(&mut events, poll_timeout)
            .map_err(ReactorError::Io)?;

        let now = Instant::now();
        let fired: Vec<(DefaultKey, EventMask)> = events
            .iter()
            .filter_map(|e| {
                let key = *self.tokens.get(&e.token())?;
                let mut mask = EventMask::empty();
                if e.is_readable() {
                    mask |= EventMask::RECV;
                }
                if e.is_writable() {
                    mask |= EventMask::SEND;
                }
                Some((key, mask))
            })
            .collect();

        for (key, mask) in fired {
            if let Some(channel_ref) = self.channels.get(key) {
                let outcomes = channel_ref.update(mask, now);
                self.apply_outcomes(key, outcomes);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

fn mask_to_interest(mask: EventMask) -> Option<Interest> {
    match (mask.contains(EventMask::RECV), mask.contains(EventMask::SEND)) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn channel_ref_register(
    poll: &Poll,
    channel_ref: &ChannelRef,
    token: Token,
    interest: Interest,
) -> std::io::Result<()> {
    channel_ref.with_registerable(|source| poll.registry().reregister(source, token, interest).or_else(|_| poll.registry().register(source, token, interest)))
}

fn listener_callback(channel_ref: &ChannelRef) -> Option<Callback> {
    // The listener's callback is copied onto every accepted client so the
    // client inherits lifecycle notification without the listener having
    // to re-register it per connection.
    channel_ref.cloned_callback()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_loop_starts_empty() {
        let l = Loop::new().unwrap();
        assert!(l.is_empty());
    }

    #[test]
    fn handles_compare_equal_by_identity() {
        let l = Loop::new().unwrap();
        let h1 = l.handle();
        let h2 = l.handle();
        assert!(h1.is_same(&h2));
        let other = Loop::new().unwrap();
        assert!(!h1.is_same(&other.handle()));
    }

    #[test]
    fn set_domain_id_moves_membership_once_added_and_removed() {
        let mut l = Loop::new().unwrap();
        let channel_ref = l.new_channel_ref(0, 0);
        channel_ref.set_domain_id(Some(7));
        // not yet added: the registry has nothing to track
        assert_eq!(l.domains().members(7).count(), 0);

        let key = l.add(channel_ref);
        assert_eq!(l.domains().members(7).count(), 1);

        l.remove(key);
        assert_eq!(l.domains().members(7).count(), 0);
    }

    #[test]
    fn with_balancer_registers_the_loop_itself() {
        let balancer = Arc::new(Balancer::new());
        let a = Loop::new()
            .unwrap()
            .with_balancer(Arc::clone(&balancer), crate::config::LoopBalanceOptions::BALANCER_IN);
        // sole registrant: the balancer never hands a loop its own accepted
        // connections, so pick_in from a's own handle finds nothing yet.
        assert!(balancer.pick_in(&a.handle()).is_none());

        let b = Loop::new()
            .unwrap()
            .with_balancer(Arc::clone(&balancer), crate::config::LoopBalanceOptions::BALANCER_IN);
        assert!(balancer.pick_in(&a.handle()).unwrap().is_same(&b.handle()));
    }
}
