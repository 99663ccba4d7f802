//! Session store: the authoritative map of repeater id to runtime state.
//!
//! Session fields churn at heartbeat frequency, so they live here rather
//! than in the persistent registry. Updates publish atomically: once an
//! update method returns, a `get` from any task sees the new state.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::Timeslot;

/// Connection state of a repeater session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No live connection.
    Disconnected,
    /// Login received, challenge not yet issued.
    LoggedIn,
    /// Challenge salt sent, awaiting the digest.
    AuthSent,
    /// Digest verified.
    Authed,
    /// Configuration received.
    Configured,
    /// Heartbeating and eligible for traffic.
    Online,
}

impl ConnectionState {
    /// Whether voice bursts from this session may be routed.
    pub fn is_routable(self) -> bool {
        matches!(self, Self::Online)
    }

    /// Whether the session may heartbeat.
    pub fn can_ping(self) -> bool {
        matches!(self, Self::Configured | Self::Online)
    }

    /// Whether the session is still waiting to complete authentication.
    pub fn is_login_pending(self) -> bool {
        matches!(self, Self::LoggedIn | Self::AuthSent)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::LoggedIn => write!(f, "logged-in"),
            Self::AuthSent => write!(f, "auth-sent"),
            Self::Authed => write!(f, "authed"),
            Self::Configured => write!(f, "configured"),
            Self::Online => write!(f, "online"),
        }
    }
}

/// Denormalized routing view of a repeater.
///
/// Rebuilt from the registry on configuration; the router reads this
/// instead of chasing the entity graph. A `None` dynamic slot means no
/// dynamic subscription.
#[derive(Debug, Clone, Default)]
pub struct RoutingView {
    pub owner_id: u32,
    pub static_ts1: HashSet<u32>,
    pub static_ts2: HashSet<u32>,
    pub dynamic_ts1: Option<u32>,
    pub dynamic_ts2: Option<u32>,
}

impl RoutingView {
    /// The static set for a timeslot.
    pub fn static_for(&self, slot: Timeslot) -> &HashSet<u32> {
        match slot {
            Timeslot::One => &self.static_ts1,
            Timeslot::Two => &self.static_ts2,
        }
    }

    /// The dynamic subscription for a timeslot.
    pub fn dynamic_for(&self, slot: Timeslot) -> Option<u32> {
        match slot {
            Timeslot::One => self.dynamic_ts1,
            Timeslot::Two => self.dynamic_ts2,
        }
    }
}

/// Runtime state of one repeater connection.
pub struct RepeaterSession {
    /// Radio id of the repeater.
    pub radio_id: u32,
    /// Current remote address.
    addr: RwLock<SocketAddr>,
    /// Connection state.
    state: RwLock<ConnectionState>,
    /// Challenge salt; cleared once authentication succeeds.
    salt: RwLock<Option<u32>>,
    /// Last heartbeat.
    last_ping: RwLock<Instant>,
    /// Heartbeats received over the session lifetime.
    pings_received: AtomicU32,
    /// Session creation (monotonic, for timeouts).
    created: Instant,
    /// Session creation (wall clock, for display).
    pub connected_at: SystemTime,
    /// Talker alias last announced via DMRA.
    talker_alias: RwLock<Option<String>>,
    /// Routing view.
    view: RwLock<RoutingView>,
}

impl RepeaterSession {
    /// Create a fresh session in `LoggedIn` state.
    pub fn new(radio_id: u32, addr: SocketAddr, salt: u32) -> Self {
        let now = Instant::now();
        Self {
            radio_id,
            addr: RwLock::new(addr),
            state: RwLock::new(ConnectionState::LoggedIn),
            salt: RwLock::new(Some(salt)),
            last_ping: RwLock::new(now),
            pings_received: AtomicU32::new(0),
            created: now,
            connected_at: SystemTime::now(),
            talker_alias: RwLock::new(None),
            view: RwLock::new(RoutingView::default()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        *self.addr.read()
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        *self.addr.write() = addr;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    pub fn salt(&self) -> Option<u32> {
        *self.salt.read()
    }

    /// Clear the salt after a successful authentication.
    pub fn clear_salt(&self) {
        *self.salt.write() = None;
    }

    /// Record a heartbeat.
    pub fn touch_ping(&self) {
        *self.last_ping.write() = Instant::now();
        self.pings_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pings_received(&self) -> u32 {
        self.pings_received.load(Ordering::Relaxed)
    }

    /// Time since the last heartbeat (or since creation, before the first).
    pub fn ping_age(&self) -> Duration {
        self.last_ping.read().elapsed()
    }

    /// Session age.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn talker_alias(&self) -> Option<String> {
        self.talker_alias.read().clone()
    }

    pub fn set_talker_alias(&self, alias: String) {
        *self.talker_alias.write() = Some(alias);
    }

    /// Snapshot the routing view.
    pub fn view(&self) -> RoutingView {
        self.view.read().clone()
    }

    /// Replace the routing view (on RPTC/RPTO).
    pub fn set_view(&self, view: RoutingView) {
        *self.view.write() = view;
    }

    /// Replace one slot's static talkgroup set.
    pub fn set_static(&self, slot: Timeslot, talkgroups: HashSet<u32>) {
        let mut view = self.view.write();
        match slot {
            Timeslot::One => view.static_ts1 = talkgroups,
            Timeslot::Two => view.static_ts2 = talkgroups,
        }
    }

    /// Replace one slot's dynamic subscription.
    pub fn set_dynamic(&self, slot: Timeslot, talkgroup: Option<u32>) {
        let mut view = self.view.write();
        match slot {
            Timeslot::One => view.dynamic_ts1 = talkgroup,
            Timeslot::Two => view.dynamic_ts2 = talkgroup,
        }
    }
}

/// Session lifecycle events, published for observability only. The
/// protocol core never depends on their ordering.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created(u32),
    StateChanged { radio_id: u32, state: ConnectionState },
    Evicted(u32),
}

/// The session store.
pub struct SessionStore {
    sessions: DashMap<u32, Arc<RepeaterSession>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            sessions: DashMap::new(),
            event_tx,
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Get a session by radio id.
    pub fn get(&self, radio_id: u32) -> Option<Arc<RepeaterSession>> {
        self.sessions.get(&radio_id).map(|r| Arc::clone(&r))
    }

    /// All sessions.
    pub fn list(&self) -> Vec<Arc<RepeaterSession>> {
        self.sessions.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Insert a session, superseding any existing one for the same id.
    pub fn store(&self, session: Arc<RepeaterSession>) {
        let radio_id = session.radio_id;
        let superseded = self.sessions.insert(radio_id, session).is_some();
        if superseded {
            debug!("Session {radio_id} superseded by new login");
        }
        let _ = self.event_tx.send(SessionEvent::Created(radio_id));
    }

    /// Remove a session. Idempotent; returns whether one was present.
    pub fn delete(&self, radio_id: u32) -> bool {
        let removed = self.sessions.remove(&radio_id).is_some();
        if removed {
            let _ = self.event_tx.send(SessionEvent::Evicted(radio_id));
            debug!("Session {radio_id} evicted");
        }
        removed
    }

    /// Update a session's connection state. Returns false if unknown.
    pub fn update_connection(&self, radio_id: u32, state: ConnectionState) -> bool {
        match self.get(radio_id) {
            Some(session) => {
                session.set_state(state);
                let _ = self
                    .event_tx
                    .send(SessionEvent::StateChanged { radio_id, state });
                true
            }
            None => false,
        }
    }

    /// Record a heartbeat for a session. Returns false if unknown.
    pub fn update_ping(&self, radio_id: u32) -> bool {
        match self.get(radio_id) {
            Some(session) => {
                session.touch_ping();
                true
            }
            None => false,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions currently in `Online` state.
    pub fn online(&self) -> Vec<Arc<RepeaterSession>> {
        self.sessions
            .iter()
            .filter(|r| r.state().is_routable())
            .map(|r| Arc::clone(&r))
            .collect()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
