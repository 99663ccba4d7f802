//! The DMR server: packet classification, session lifecycle, and the
//! background sweeps.

mod handlers;
mod signals;

pub use signals::{setup_signal_handlers, Signal, SignalHandler};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{PacketBus, RawPacket};
use crate::calls::CallTracker;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::identdb::IdentDb;
use crate::parrot::Parrot;
use crate::protocol::{close, Command};
use crate::registry::Registry;
use crate::router::Router;
use crate::store::{ConnectionState, SessionStore};
use crate::transport::{SocketConfig, UdpTransport};

/// Interval of the call and parrot finalization sweeps.
const FINALIZE_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// The DMR server.
pub struct DmrServer {
    config: Config,
    bus: Arc<PacketBus>,
    store: Arc<SessionStore>,
    registry: Arc<Registry>,
    identdb: Arc<IdentDb>,
    tracker: Arc<CallTracker>,
    parrot: Arc<Parrot>,
    router: Router,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DmrServer {
    /// Assemble a server from its collaborators.
    pub fn new(config: Config, registry: Arc<Registry>, identdb: Arc<IdentDb>) -> Self {
        let bus = Arc::new(PacketBus::default());
        let store = Arc::new(SessionStore::new());
        let tracker = Arc::new(CallTracker::new(
            Arc::clone(&registry),
            config.server.call_inactivity,
        ));
        let parrot = Arc::new(Parrot::new(
            Arc::clone(&bus),
            config.server.parrot_id,
            config.server.parrot_inactivity,
        ));
        let router = Router::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            Arc::clone(&parrot),
            Arc::clone(&bus),
        );
        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            config,
            bus,
            store,
            registry,
            identdb,
            tracker,
            parrot,
            router,
            local_addr: RwLock::new(None),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// The packet bus.
    pub fn bus(&self) -> &Arc<PacketBus> {
        &self.bus
    }

    /// The session store.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The call tracker.
    pub fn tracker(&self) -> &Arc<CallTracker> {
        &self.tracker
    }

    /// The address the socket bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Bind the socket and spawn the worker tasks.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal("server already started".into()));
        }

        let server_config = &self.config.server;
        let socket_config = SocketConfig {
            send_buffer_size: server_config.write_buffer,
            recv_buffer_size: server_config.read_buffer,
            reuse_addr: true,
        };

        let transport = UdpTransport::bind(server_config.socket_addr(), &socket_config)?;
        let local = transport.local_addr()?;
        *self.local_addr.write() = Some(local);

        info!("DMR server listening on {local}");

        let mut tasks =
            transport.start(Arc::clone(&self.bus), Arc::clone(&self.store), &self.shutdown_tx);

        // Dispatch loop: classify every received datagram.
        {
            let server = Arc::clone(&self);
            let mut rx = self.bus.subscribe_incoming();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = rx.recv() => match result {
                            Ok(raw) => server.handle_datagram(&raw),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Dispatch loop lagged, dropped {n} datagrams");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown.recv() => break,
                    }
                }
                debug!("Dispatch loop stopped");
            }));
        }

        // Session eviction sweep.
        {
            let server = Arc::clone(&self);
            let mut shutdown = self.shutdown_tx.subscribe();
            let interval = server_config.sweep_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => server.sweep_sessions(),
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        // Call and parrot finalization sweeps.
        {
            let tracker = Arc::clone(&self.tracker);
            let parrot = Arc::clone(&self.parrot);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(FINALIZE_SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            tracker.sweep();
                            parrot.sweep();
                        }
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        *self.tasks.lock() = tasks;
        Ok(())
    }

    /// Gracefully stop: close every online session, flush, tear down.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping DMR server");

        for session in self.store.list() {
            if session.state().is_routable() {
                self.bus.publish_outgoing(RawPacket {
                    addr: session.addr(),
                    data: close(session.radio_id),
                });
            }
            self.store
                .update_connection(session.radio_id, ConnectionState::Disconnected);
            self.store.delete(session.radio_id);
        }

        // Bounded flush so queued MSTCLs reach the wire before the loops die.
        let flush = tokio::time::sleep(Duration::from_millis(250));
        let _ = tokio::time::timeout(self.config.server.shutdown_grace, flush).await;

        let _ = self.shutdown_tx.send(());
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }

        info!("DMR server stopped");
    }

    /// Evict sessions that stalled during login or stopped heartbeating.
    ///
    /// Idempotent: a session evicted by one sweep is simply absent for the
    /// next.
    pub fn sweep_sessions(&self) {
        let server_config = &self.config.server;

        for session in self.store.list() {
            let state = session.state();
            let evict = if state.is_login_pending() {
                session.age() > server_config.login_timeout
            } else {
                session.ping_age() > server_config.ping_timeout
            };

            if evict {
                info!(
                    "Evicting repeater {} (state {state}, silent too long)",
                    session.radio_id
                );
                self.store
                    .update_connection(session.radio_id, ConnectionState::Disconnected);
                self.store.delete(session.radio_id);
            }
        }
    }

    /// Classify one datagram and dispatch it to its handler.
    pub fn handle_datagram(&self, raw: &RawPacket) {
        if self.config.server.debug {
            debug!("Read {} bytes from {}", raw.data.len(), raw.addr);
        }

        match Command::classify(&raw.data) {
            Ok(Command::DmrA) => self.handle_dmra(raw),
            Ok(Command::DmrD) => self.handle_dmrd(raw),
            Ok(Command::RptL) => self.handle_rptl(raw),
            Ok(Command::RptK) => self.handle_rptk(raw),
            Ok(Command::RptC) => self.handle_rptc(raw),
            Ok(Command::RptCl) => self.handle_rptcl(raw),
            Ok(Command::RptO) => self.handle_rpto(raw),
            Ok(Command::RptPing) => self.handle_rptping(raw),
            Ok(
                cmd @ (Command::RptAck
                | Command::RptSbkn
                | Command::MstCl
                | Command::MstNak
                | Command::MstPong),
            ) => {
                debug!("Ignoring server-bound {cmd} from {}", raw.addr);
            }
            Err(e) => warn!("Dropping datagram from {}: {e}", raw.addr),
        }
    }
}
