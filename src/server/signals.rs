//! Signal handling for graceful shutdown and snapshot reload.
//!
//! Handles:
//! - SIGTERM/SIGINT for graceful shutdown
//! - SIGHUP for identity snapshot reload

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Signal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Terminate signal (SIGTERM).
    Terminate,
    /// Interrupt signal (SIGINT).
    Interrupt,
    /// Hangup signal (SIGHUP) - reload the identity snapshot.
    Hangup,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Terminate => write!(f, "SIGTERM"),
            Signal::Interrupt => write!(f, "SIGINT"),
            Signal::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Signal handler that broadcasts signals to subscribers.
pub struct SignalHandler {
    /// Shutdown flag.
    shutdown: Arc<RwLock<bool>>,
    /// Signal broadcaster.
    signal_tx: broadcast::Sender<Signal>,
    /// Reload callback.
    reload_callback: Arc<RwLock<Option<Box<dyn Fn() + Send + Sync>>>>,
}

impl SignalHandler {
    /// Create a new signal handler.
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(16);

        Self {
            shutdown: Arc::new(RwLock::new(false)),
            signal_tx,
            reload_callback: Arc::new(RwLock::new(None)),
        }
    }

    /// Subscribe to signals.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signal_tx.subscribe()
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.read()
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        *self.shutdown.write() = true;
        let _ = self.signal_tx.send(Signal::Terminate);
    }

    /// Set the reload callback.
    pub fn set_reload_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.reload_callback.write() = Some(Box::new(callback));
    }

    /// Handle a signal.
    fn handle_signal(&self, signal: Signal) {
        info!("Received signal: {}", signal);

        match signal {
            Signal::Terminate | Signal::Interrupt => {
                info!("Initiating graceful shutdown");
                self.request_shutdown();
            }
            Signal::Hangup => {
                info!("Reloading identity snapshot");
                if let Some(callback) = self.reload_callback.read().as_ref() {
                    callback();
                }
                let _ = self.signal_tx.send(signal);
            }
        }
    }

    /// Start listening for signals (Unix).
    #[cfg(unix)]
    pub async fn listen(&self) {
        use futures::StreamExt;
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook_tokio::Signals;

        let signals = match Signals::new([SIGTERM, SIGINT, SIGHUP]) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register signal handlers: {}", e);
                return;
            }
        };

        let mut signals = signals.fuse();

        info!("Signal handler started");

        while let Some(signal) = signals.next().await {
            let sig = match signal {
                SIGTERM => Signal::Terminate,
                SIGINT => Signal::Interrupt,
                SIGHUP => Signal::Hangup,
                _ => continue,
            };

            self.handle_signal(sig);

            if sig == Signal::Terminate || sig == Signal::Interrupt {
                break;
            }
        }

        info!("Signal handler stopped");
    }

    /// Start listening for signals (non-Unix fallback).
    #[cfg(not(unix))]
    pub async fn listen(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                self.handle_signal(Signal::Interrupt);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SignalHandler {
    fn clone(&self) -> Self {
        Self {
            shutdown: Arc::clone(&self.shutdown),
            signal_tx: self.signal_tx.clone(),
            reload_callback: Arc::clone(&self.reload_callback),
        }
    }
}

/// Setup signal handlers and return a shutdown receiver.
pub fn setup_signal_handlers() -> (Arc<SignalHandler>, broadcast::Receiver<Signal>) {
    let handler = Arc::new(SignalHandler::new());
    let rx = handler.subscribe();

    let handler_clone = Arc::clone(&handler);
    tokio::spawn(async move {
        handler_clone.listen().await;
    });

    (handler, rx)
}
