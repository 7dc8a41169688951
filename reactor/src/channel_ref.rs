use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use slotmap::DefaultKey;
use uuid::Uuid;

use reactor_buf::Stream;

use crate::channel::Channel;
use crate::error::{ReactorError, Result};
use crate::event::{ChannelEvent, ChannelState, EventMask};
use crate::reactor_loop::{LoopHandle, Message};

pub type Callback = Arc<dyn Fn(&ChannelRef, ChannelEvent) + Send + Sync>;

static_assertions::assert_impl_all!(ChannelRef: Send, Sync);

/// Per-reference snapshot carried across a `reincarnate` (auto-reconnect).
#[derive(Clone)]
struct ReconnectProfile {
    addr: SocketAddr,
    callback: Option<Callback>,
    user_data: i64,
    user_ptr: usize,
    auto_reconnect: bool,
    max_send_list_count: usize,
    max_recv_buffer_length: usize,
    connect_timeout: Option<Duration>,
}

/// Shared info: the half of a channel reference's state visible to every
/// clone produced by `share`. Destroyed only once the shared reference
/// count reaches zero and the owning loop has removed the channel from its
/// list; see `Arc<Shared>`'s own drop for the actual deallocation instant.
struct Shared {
    channel: Mutex<Channel>,
    state: Mutex<ChannelState>,
    mask: Mutex<EventMask>,
    owner: LoopHandle,
    key: Mutex<Option<DefaultKey>>,
    share_count: AtomicUsize,
    peer_addr: OnceLock<SocketAddr>,
    local_addr: OnceLock<SocketAddr>,
    connect_addr: Mutex<Option<SocketAddr>>,
    callback: Mutex<Option<Callback>>,
    user_data: AtomicI64,
    user_ptr: AtomicUsize,
    auto_reconnect: AtomicBool,
    idle_timeout: Mutex<Option<Duration>>,
    last_recv_ts: Mutex<Instant>,
    connect_timeout: Mutex<Option<Duration>>,
    connect_deadline: Mutex<Option<Instant>>,
    close_fired: AtomicBool,
    max_send_list_count: AtomicUsize,
    max_recv_buffer_length: AtomicUsize,
}

/// What a loop tick must do after handing a readiness event to a channel
/// reference's `update`. `update` never touches the selector itself; the
/// loop applies these outcomes to `mio::Poll` and to its own registries.
pub enum UpdateOutcome {
    /// No change to selector interest or loop bookkeeping is needed.
    None,
    /// A listener accepted a client socket; the loop decides (via the
    /// balancer) which loop ultimately owns it.
    Accepted(Channel, SocketAddr),
    /// The reference transitioned to `Close` this tick and must be swept
    /// from the loop's registry at the end of the tick.
    Closed,
    /// An auto-reconnect produced a replacement reference that the loop
    /// must register in place of the one that just closed.
    Reconnected(ChannelRef),
    /// Selector interest should be re-armed to match the reference's
    /// current event mask (e.g. connect completed, or a send drained).
    Rearm,
}

/// The object application code and the owning loop both hold. Carries a
/// pointer into the shared info plus state unique to this handle: whether
/// it was produced by `share`, and its domain membership.
pub struct ChannelRef {
    shared: Arc<Shared>,
    is_share_clone: bool,
    domain_id: Mutex<Option<u64>>,
}

impl ChannelRef {
    pub(crate) fn new(owner: LoopHandle, channel: Channel) -> Self {
        let limits_recv = channel.recv_capacity();
        let limits_send = channel.send_capacity();
        Self {
            shared: Arc::new(Shared {
                channel: Mutex::new(channel),
                state: Mutex::new(ChannelState::Init),
                mask: Mutex::new(EventMask::empty()),
                owner,
                key: Mutex::new(None),
                share_count: AtomicUsize::new(0),
                peer_addr: OnceLock::new(),
                local_addr: OnceLock::new(),
                connect_addr: Mutex::new(None),
                callback: Mutex::new(None),
                user_data: AtomicI64::new(0),
                user_ptr: AtomicUsize::new(0),
                auto_reconnect: AtomicBool::new(false),
                idle_timeout: Mutex::new(None),
                last_recv_ts: Mutex::new(Instant::now()),
                connect_timeout: Mutex::new(None),
                connect_deadline: Mutex::new(None),
                close_fired: AtomicBool::new(false),
                max_send_list_count: AtomicUsize::new(limits_send),
                max_recv_buffer_length: AtomicUsize::new(limits_recv),
            }),
            is_share_clone: false,
            domain_id: Mutex::new(None),
        }
    }

    pub(crate) fn new_active(owner: LoopHandle, channel: Channel, callback: Option<Callback>) -> Self {
        let r = Self::new(owner, channel);
        *r.shared.state.lock().unwrap() = ChannelState::Active;
        *r.shared.mask.lock().unwrap() = EventMask::RECV;
        *r.shared.callback.lock().unwrap() = callback;
        r
    }

    pub fn uuid(&self) -> Uuid {
        self.shared.channel.lock().unwrap().uuid()
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock().unwrap()
    }

    pub fn owner(&self) -> &LoopHandle {
        &self.shared.owner
    }

    pub fn equal(a: &ChannelRef, b: &ChannelRef) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    pub(crate) fn key(&self) -> Option<DefaultKey> {
        *self.shared.key.lock().unwrap()
    }

    /// Moves the reference in or out of the owning loop's world. Joins or
    /// leaves its domain (if any) in lockstep, since membership is only
    /// meaningful while the reference is part of a loop's registry.
    pub(crate) fn set_key(&self, key: Option<DefaultKey>) {
        let previous = {
            let mut guard = self.shared.key.lock().unwrap();
            std::mem::replace(&mut *guard, key)
        };
        if let Some(domain_id) = self.domain_id() {
            match (previous, key) {
                (None, Some(k)) => self.shared.owner.join_domain(domain_id, k),
                (Some(k), None) => self.shared.owner.leave_domain(domain_id, k),
                _ => {}
            }
        }
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.shared.state.lock().unwrap() = state;
    }

    pub(crate) fn set_mask(&self, mask: EventMask) {
        *self.shared.mask.lock().unwrap() = mask;
    }

    pub fn mask(&self) -> EventMask {
        *self.shared.mask.lock().unwrap()
    }

    // -- reference counting -------------------------------------------------

    pub fn share(&self) -> ChannelRef {
        self.shared.share_count.fetch_add(1, Ordering::AcqRel);
        ChannelRef {
            shared: Arc::clone(&self.shared),
            is_share_clone: true,
            domain_id: Mutex::new(None),
        }
    }

    /// Handle clone for internal inbox transport only: points at the same
    /// shared info but never touches the user-facing `share_count`, unlike
    /// `share`. Used to move an operation across the inbox while the
    /// caller's own handle keeps working.
    fn internal_handle(&self) -> ChannelRef {
        ChannelRef {
            shared: Arc::clone(&self.shared),
            is_share_clone: self.is_share_clone,
            domain_id: Mutex::new(*self.domain_id.lock().unwrap()),
        }
    }

    pub fn leave(self) {
        self.shared.share_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn incref(&self) {
        self.shared.share_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decref(&self) -> usize {
        self.shared.share_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn get_ref(&self) -> usize {
        self.shared.share_count.load(Ordering::Acquire)
    }

    pub fn ref_zero(&self) -> bool {
        self.get_ref() == 0
    }

    /// Synchronously tears down a reference that never entered a loop's
    /// list. Refuses (`RefNonzero`) while outstanding `share` clones exist.
    pub fn destroy(self) -> Result<()> {
        if !self.ref_zero() {
            return Err(ReactorError::RefNonzero);
        }
        Ok(())
    }

    // -- configuration --------------------------------------------------

    pub fn set_cb(&self, cb: Callback) {
        *self.shared.callback.lock().unwrap() = Some(cb);
    }

    pub fn set_user_data(&self, data: i64) {
        self.shared.user_data.store(data, Ordering::Release);
    }

    pub fn user_data(&self) -> i64 {
        self.shared.user_data.load(Ordering::Acquire)
    }

    pub fn set_ptr(&self, ptr: usize) {
        self.shared.user_ptr.store(ptr, Ordering::Release);
    }

    pub fn ptr(&self) -> usize {
        self.shared.user_ptr.load(Ordering::Acquire)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.shared.auto_reconnect.store(enabled, Ordering::Release);
    }

    /// `idle` and `connect` are `None` to leave the existing value in place,
    /// `Some(Duration::ZERO)` to disable.
    pub fn set_timeout(&self, idle: Option<Duration>, connect: Option<Duration>) {
        if let Some(idle) = idle {
            *self.shared.idle_timeout.lock().unwrap() =
                if idle.is_zero() { None } else { Some(idle) };
        }
        if let Some(connect) = connect {
            *self.shared.connect_timeout.lock().unwrap() =
                if connect.is_zero() { None } else { Some(connect) };
        }
    }

    /// Updates this handle's domain id and moves its registry membership
    /// accordingly. A no-op on the registry while the reference has not yet
    /// been added to a loop (`key()` is `None`); `set_key` picks up the
    /// pending id once it is.
    pub fn set_domain_id(&self, domain_id: Option<u64>) {
        let previous = std::mem::replace(&mut *self.domain_id.lock().unwrap(), domain_id);
        if let Some(key) = self.key() {
            if let Some(old) = previous {
                self.shared.owner.leave_domain(old, key);
            }
            if let Some(new) = domain_id {
                self.shared.owner.join_domain(new, key);
            }
        }
    }

    pub fn domain_id(&self) -> Option<u64> {
        *self.domain_id.lock().unwrap()
    }

    pub fn is_share_clone(&self) -> bool {
        self.is_share_clone
    }

    // -- addressing -------------------------------------------------------

    pub fn get_peer_address(&self) -> Option<SocketAddr> {
        if let Some(addr) = self.shared.peer_addr.get() {
            return Some(*addr);
        }
        let addr = self.shared.channel.lock().unwrap().peer_addr()?;
        Some(*self.shared.peer_addr.get_or_init(|| addr))
    }

    pub fn get_local_address(&self) -> Option<SocketAddr> {
        if let Some(addr) = self.shared.local_addr.get() {
            return Some(*addr);
        }
        let addr = self.shared.channel.lock().unwrap().local_addr()?;
        Some(*self.shared.local_addr.get_or_init(|| addr))
    }

    /// Raw file descriptor of the underlying socket, or `None` before a
    /// `connect`/`accept` has actually produced one.
    pub fn get_socket_fd(&self) -> Option<std::os::fd::RawFd> {
        self.shared.channel.lock().unwrap().raw_fd()
    }

    pub fn with_stream<R>(&self, f: impl FnOnce(&mut Stream) -> R) -> R {
        let mut guard = self.shared.channel.lock().unwrap();
        let channel = &mut *guard;
        let mut stream = Stream::new(&mut channel.recv, &mut channel.send);
        f(&mut stream)
    }

    /// Exposes the underlying socket as an `mio::event::Source` for the
    /// owning loop's selector registration; never called from outside this
    /// crate.
    pub(crate) fn with_registerable(
        &self,
        f: impl FnOnce(&mut dyn mio::event::Source) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        let mut channel = self.shared.channel.lock().unwrap();
        match channel.as_source_mut() {
            Some(source) => f(source),
            None => Ok(()),
        }
    }

    pub(crate) fn cloned_callback(&self) -> Option<Callback> {
        self.shared.callback.lock().unwrap().clone()
    }

    // -- network operations -------------------------------------------------

    pub fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<()> {
        if self.state() == ChannelState::Connect {
            return Err(ReactorError::ConnectInProgress);
        }
        *self.shared.connect_addr.lock().unwrap() = Some(addr);
        if !timeout.is_zero() {
            *self.shared.connect_timeout.lock().unwrap() = Some(timeout);
        }
        let effective = self.shared.connect_timeout.lock().unwrap().unwrap_or(Duration::from_secs(30));
        *self.shared.connect_deadline.lock().unwrap() = Some(Instant::now() + effective);

        self.shared.channel.lock().unwrap().connect(addr)?;
        self.set_state(ChannelState::Connect);
        self.set_mask(EventMask::SEND);
        Ok(())
    }

    /// Binds and listens. If the owning loop has not started yet or is
    /// running on the calling thread, the bind happens inline; otherwise the
    /// request is handed to the owning loop's inbox and finished on its own
    /// thread.
    pub fn accept(&self, addr: SocketAddr, backlog: u32) -> Result<()> {
        if self.state() == ChannelState::Accept {
            return Err(ReactorError::AcceptInProgress);
        }
        if self.shared.owner.runs_inline_for_caller() {
            self.accept_inline(addr, backlog)
        } else {
            self.shared.owner.dispatch(Message::AcceptAsync(self.internal_handle(), addr, backlog));
            Ok(())
        }
    }

    pub(crate) fn accept_inline(&self, addr: SocketAddr, backlog: u32) -> Result<()> {
        self.shared.channel.lock().unwrap().listen(addr, backlog)?;
        self.set_state(ChannelState::Accept);
        self.set_mask(EventMask::RECV);
        Ok(())
    }

    /// Queues bytes for send. If the caller is on the owning loop's thread
    /// the list is mutated inline and a rearm is requested immediately;
    /// otherwise the bytes are copied and handed to the owning loop's inbox,
    /// which mutates and rearms on its own next tick.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.state() != ChannelState::Active {
            return Err(ReactorError::NotConnected);
        }
        debug_assert!(!data.is_empty(), "0-byte writes are not permitted");
        if self.shared.owner.runs_inline_for_caller() {
            self.write_inline(data)
        } else {
            let key = self.key().ok_or(ReactorError::NotConnected)?;
            self.shared.owner.dispatch(Message::Send(key, Bytes::copy_from_slice(data)));
            Ok(())
        }
    }

    /// Mutates the send list and requests selector rearm via the owning
    /// loop's inbox. Rearm always goes through the inbox, even when called
    /// from the loop's own thread, so `ChannelRef` never needs a mutable
    /// handle back into `Loop`'s selector bookkeeping.
    pub(crate) fn write_inline(&self, data: &[u8]) -> Result<()> {
        self.with_stream(|s| s.write(data)).map_err(|_| ReactorError::SendFail)?;
        self.set_mask(self.mask() | EventMask::SEND);
        if let Some(key) = self.key() {
            self.shared.owner.dispatch(Message::Rearm(key));
        }
        Ok(())
    }

    /// If the caller is on the owning loop's thread (or the loop has not
    /// started, or the reference never left `init`), closes inline.
    /// Otherwise hands off to the owning loop's inbox.
    pub fn close(&self) {
        if self.shared.close_fired.load(Ordering::Acquire) {
            return;
        }
        let must_dispatch = !self.shared.owner.runs_inline_for_caller() && self.state() != ChannelState::Init;
        if must_dispatch {
            if let Some(key) = self.key() {
                self.shared.owner.dispatch(Message::Close(key));
                return;
            }
        }
        self.close_inline();
    }

    pub(crate) fn close_inline(&self) {
        if self.shared.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cb) = self.shared.callback.lock().unwrap().clone() {
            cb(self, ChannelEvent::Close);
        }
        self.set_mask(EventMask::empty());
        self.set_state(ChannelState::Close);
    }

    fn reconnect_profile(&self) -> Option<ReconnectProfile> {
        Some(ReconnectProfile {
            addr: self.shared.connect_addr.lock().unwrap().or_else(|| self.get_peer_address())?,
            callback: self.shared.callback.lock().unwrap().clone(),
            user_data: self.user_data(),
            user_ptr: self.ptr(),
            auto_reconnect: self.shared.auto_reconnect.load(Ordering::Acquire),
            max_send_list_count: self.shared.max_send_list_count.load(Ordering::Acquire),
            max_recv_buffer_length: self.shared.max_recv_buffer_length.load(Ordering::Acquire),
            connect_timeout: *self.shared.connect_timeout.lock().unwrap(),
        })
    }

    /// Builds a fresh reference inheriting this one's configuration and
    /// initiates a connect on it. Does not touch `self`'s state; the caller
    /// is responsible for closing the old reference once this succeeds.
    pub fn reconnect(&self, timeout: Duration) -> Result<ChannelRef> {
        let profile = self.reconnect_profile().ok_or(ReactorError::Fail)?;
        let channel = Channel::new(profile.max_recv_buffer_length, profile.max_send_list_count);
        let fresh = ChannelRef::new(self.shared.owner.clone(), channel);
        if let Some(cb) = &profile.callback {
            fresh.set_cb(cb.clone());
        }
        fresh.set_user_data(profile.user_data);
        fresh.set_ptr(profile.user_ptr);
        fresh.set_auto_reconnect(profile.auto_reconnect);
        let effective_timeout = if !timeout.is_zero() {
            timeout
        } else {
            profile.connect_timeout.unwrap_or(Duration::from_secs(30))
        };
        fresh.connect(profile.addr, effective_timeout)?;
        Ok(fresh)
    }

    /// Idle/connect timeout check, invoked once per tick by the loop's
    /// timer wheel. Returns `true` if a timeout fired.
    pub(crate) fn check_timeout(&self, now: Instant) -> bool {
        let mut fired = false;
        if self.state() == ChannelState::Active {
            if let Some(idle) = *self.shared.idle_timeout.lock().unwrap() {
                let last = *self.shared.last_recv_ts.lock().unwrap();
                if now.saturating_duration_since(last) > idle {
                    *self.shared.last_recv_ts.lock().unwrap() = now;
                    if let Some(cb) = self.shared.callback.lock().unwrap().clone() {
                        cb(self, ChannelEvent::Timeout);
                    }
                    fired = true;
                }
            }
        }
        if self.state() == ChannelState::Connect {
            let mut deadline = self.shared.connect_deadline.lock().unwrap();
            if let Some(d) = *deadline {
                if now >= d {
                    if let Some(timeout) = *self.shared.connect_timeout.lock().unwrap() {
                        *deadline = Some(now + timeout);
                    }
                    fired = true;
                }
            }
        }
        fired
    }

    /// Drives the state machine for one readiness notification. Never
    /// touches the selector; see `UpdateOutcome`.
    pub(crate) fn update(&self, event: EventMask, now: Instant) -> Vec<UpdateOutcome> {
        match self.state() {
            ChannelState::Accept => self.update_accept(event),
            ChannelState::Connect => self.update_connect(event),
            ChannelState::Active => self.update_active(event, now),
            ChannelState::Init | ChannelState::Close => Vec::new(),
        }
    }

    fn update_accept(&self, event: EventMask) -> Vec<UpdateOutcome> {
        if !event.contains(EventMask::RECV) {
            return Vec::new();
        }
        let mut outcomes = Vec::new();
        loop {
            let accepted = self.shared.channel.lock().unwrap().accept();
            match accepted {
                Ok((client, addr)) => outcomes.push(UpdateOutcome::Accepted(client, addr)),
                Err(ReactorError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        outcomes
    }

    fn update_connect(&self, event: EventMask) -> Vec<UpdateOutcome> {
        if !event.contains(EventMask::SEND) {
            return Vec::new();
        }
        // bound before matching so the channel mutex is released before a
        // failure path below can call `fail` -> `reconnect_profile` ->
        // `get_peer_address`, which would otherwise re-lock the same mutex
        let result = self.shared.channel.lock().unwrap().take_connect_result();
        match result {
            Ok(()) => {
                self.set_state(ChannelState::Active);
                self.set_mask(EventMask::RECV);
                if let Some(cb) = self.shared.callback.lock().unwrap().clone() {
                    cb(self, ChannelEvent::Connect);
                }
                vec![UpdateOutcome::Rearm]
            }
            Err(_) => self.fail(),
        }
    }

    fn update_active(&self, event: EventMask, now: Instant) -> Vec<UpdateOutcome> {
        let mut outcomes = Vec::new();
        if event.contains(EventMask::RECV) {
            let result = self.shared.channel.lock().unwrap().fill_recv();
            match result {
                Ok(n) if n > 0 => {
                    *self.shared.last_recv_ts.lock().unwrap() = now;
                    self.shared.owner.profile().on_bytes_recv(n as u64);
                    if let Some(cb) = self.shared.callback.lock().unwrap().clone() {
                        cb(self, ChannelEvent::Recv);
                    }
                }
                Ok(_) => {}
                Err(_) => return self.fail(),
            }
        }
        if event.contains(EventMask::SEND) {
            let result = self.shared.channel.lock().unwrap().drain_send();
            match result {
                Ok((written, complete)) => {
                    if written > 0 {
                        self.shared.owner.profile().on_bytes_send(written as u64);
                    }
                    if let Some(cb) = self.shared.callback.lock().unwrap().clone() {
                        cb(self, ChannelEvent::Send);
                    }
                    if complete {
                        self.set_mask(self.mask() - EventMask::SEND);
                        outcomes.push(UpdateOutcome::Rearm);
                    }
                }
                Err(_) => return self.fail(),
            }
        }
        outcomes
    }

    /// `send_fail`/`recv_fail`/`recv_buffer_full` path: either reincarnate
    /// (auto-reconnect) or close outright.
    fn fail(&self) -> Vec<UpdateOutcome> {
        if self.shared.auto_reconnect.load(Ordering::Acquire) {
            if let Ok(fresh) = self.reconnect(Duration::ZERO) {
                self.close();
                return vec![UpdateOutcome::Closed, UpdateOutcome::Reconnected(fresh)];
            }
        }
        self.close();
        vec![UpdateOutcome::Closed]
    }
}
