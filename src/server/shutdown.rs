//! Graceful shutdown coordination
//!
//! A shutdown request can come from SIGTERM/SIGINT, from an explicit
//! `ShutdownController::shutdown()` call, or from an external cancellation
//! signal handed to `serve_with_shutdown`. All of them latch the same flag:
//! - The first request wins; later requests are no-ops
//! - A request made before serving starts stays latched

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Receiving side of a shutdown channel
///
/// Cheap to clone; every clone observes the same flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for shutdown signal
    pub async fn wait(&mut self) {
        // Wait until the value becomes true
        while !*self.receiver.borrow_and_update() {
            if self.receiver.changed().await.is_err() {
                // Sender dropped, treat as shutdown
                break;
            }
        }
    }

    /// Check if shutdown was signaled (non-blocking)
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Controller for triggering shutdown
///
/// Clones share the underlying channel, so any holder can request shutdown.
#[derive(Clone)]
pub struct ShutdownController {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownController {
    /// Trigger shutdown
    ///
    /// Returns `true` only for the call that flipped the flag.
    pub fn shutdown(&self) -> bool {
        let first = self.sender.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        });
        if first {
            info!("Shutdown signal sent");
        }
        first
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// New receiver observing this controller
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Create a new shutdown signal pair
///
/// Returns (controller, signal) where:
/// - controller: Used to trigger shutdown
/// - signal: Cloned and passed to components that need to listen
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        ShutdownController {
            sender: Arc::new(sender),
        },
        ShutdownSignal { receiver },
    )
}

/// Wait for SIGTERM or SIGINT signal
///
/// Returns the signal name that was received, or the registration error if
/// the handlers could not be installed.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

/// Wait for Ctrl+C signal (Windows)
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok("CTRL_C")
}
