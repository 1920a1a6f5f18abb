//! Per-client session state.
//!
//! Tree membership and priority live in the [`TtyTree`](crate::tty::TtyTree);
//! everything else a connection owns is here. The key filter and the window
//! each have their own lock because both the client's session task and the
//! core thread touch them. Never hold both at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use dot_driver::Geometry;
use dot_proto::keys::KeyCode;
use dot_proto::{ParamId, Response};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::ranges::KeyRangeSet;
use crate::server::lock;
use crate::tty::ConnId;
use crate::window::BrailleWindow;

/// How a tty-mode connection wants its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDelivery {
    /// Interpreted command codes.
    Commands,
    /// Undecoded driver key codes.
    RawKeycodes,
}

/// Keys a tty-mode connection is willing to take.
#[derive(Debug, Clone)]
pub struct KeyFilter {
    pub delivery: KeyDelivery,
    pub ranges: KeyRangeSet,
}

impl KeyFilter {
    /// Default accepted ranges for a delivery mode.
    pub fn new(delivery: KeyDelivery) -> Self {
        let ranges = match delivery {
            KeyDelivery::RawKeycodes => KeyRangeSet::full(),
            KeyDelivery::Commands => KeyRangeSet::without_reserved(),
        };
        Self { delivery, ranges }
    }
}

/// One parameter watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub param: ParamId,
    pub subparam: u64,
    pub global: bool,
    /// Also notify when this connection made the change itself.
    pub self_echo: bool,
}

impl Subscription {
    fn matches(&self, param: ParamId, subparam: u64, global: bool) -> bool {
        self.param == param && self.subparam == subparam && self.global == global
    }
}

pub struct Connection {
    id: ConnId,
    peer: String,
    outbound: mpsc::Sender<Response>,
    connected_at: Instant,
    authenticated: AtomicBool,
    retain_dots: AtomicBool,
    keys: Mutex<Option<KeyFilter>>,
    window: Mutex<Option<BrailleWindow>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(id: ConnId, peer: impl Into<String>, outbound: mpsc::Sender<Response>) -> Self {
        Self {
            id,
            peer: peer.into(),
            outbound,
            connected_at: Instant::now(),
            authenticated: AtomicBool::new(false),
            retain_dots: AtomicBool::new(false),
            keys: Mutex::new(None),
            window: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Returns `false` if it already was.
    pub(crate) fn mark_authenticated(&self) -> bool {
        !self.authenticated.swap(true, Ordering::AcqRel)
    }

    pub fn retains_dots(&self) -> bool {
        self.retain_dots.load(Ordering::Relaxed)
    }

    pub fn set_retain_dots(&self, retain: bool) {
        self.retain_dots.store(retain, Ordering::Relaxed);
    }

    /// Queue a reply. Waits for room; returns `false` once the session's
    /// writer is gone.
    pub async fn send(&self, response: Response) -> bool {
        self.outbound.send(response).await.is_ok()
    }

    /// Queue an unsolicited message without waiting. Dropped if the queue
    /// is full.
    pub fn try_send(&self, response: Response) -> bool {
        self.outbound.try_send(response).is_ok()
    }

    // Tty mode state

    pub(crate) fn enter_tty(&self, delivery: KeyDelivery, geometry: Geometry) {
        *lock(&self.keys) = Some(KeyFilter::new(delivery));
        *lock(&self.window) = Some(BrailleWindow::new(geometry));
    }

    pub(crate) fn leave_tty(&self) {
        *lock(&self.keys) = None;
        *lock(&self.window) = None;
    }

    pub fn in_tty_mode(&self) -> bool {
        lock(&self.keys).is_some()
    }

    pub fn accepts(&self, code: KeyCode, delivery: KeyDelivery) -> bool {
        lock(&self.keys)
            .as_ref()
            .is_some_and(|k| k.delivery == delivery && k.ranges.contains(code))
    }

    /// Edit the accepted ranges. Returns `None` outside tty mode.
    pub(crate) fn update_ranges<T>(&self, f: impl FnOnce(&mut KeyRangeSet) -> T) -> Option<T> {
        lock(&self.keys).as_mut().map(|k| f(&mut k.ranges))
    }

    /// Work on the window, resized to `geometry` first. Returns `None`
    /// outside tty mode.
    pub(crate) fn with_window<T>(
        &self,
        geometry: Geometry,
        f: impl FnOnce(&mut BrailleWindow) -> T,
    ) -> Option<T> {
        let mut window = lock(&self.window);
        let window = window.as_mut()?;
        window.fit(geometry);
        Some(f(window))
    }

    // Parameter watches

    /// Add or update a watch. Returns `true` if it is new.
    pub(crate) fn subscribe(&self, sub: Subscription) -> bool {
        let mut subs = lock(&self.subscriptions);
        match subs
            .iter_mut()
            .find(|s| s.matches(sub.param, sub.subparam, sub.global))
        {
            Some(existing) => {
                existing.self_echo = sub.self_echo;
                false
            }
            None => {
                subs.push(sub);
                true
            }
        }
    }

    /// Returns `true` if the watch existed.
    pub(crate) fn unsubscribe(&self, param: ParamId, subparam: u64, global: bool) -> bool {
        let mut subs = lock(&self.subscriptions);
        let before = subs.len();
        subs.retain(|s| !s.matches(param, subparam, global));
        subs.len() != before
    }

    pub fn subscription(&self, param: ParamId, subparam: u64, global: bool) -> Option<Subscription> {
        lock(&self.subscriptions)
            .iter()
            .find(|s| s.matches(param, subparam, global))
            .copied()
    }

    pub(crate) fn take_subscriptions(&self) -> Vec<Subscription> {
        std::mem::take(&mut *lock(&self.subscriptions))
    }
}
