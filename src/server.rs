//! Gateway lifecycle.
//!
//! [`Gateway`] owns the listener and the worker that runs it. In the
//! default (non-blocking) mode, `start` spawns a dedicated thread with a
//! single-threaded event loop and synchronizes with it through a startup
//! channel: by the time `start` returns, the listener is either bound (and
//! `local_addr` is observable) or the bind error has been returned. In
//! blocking mode the event loop runs on the calling thread and `start`
//! returns when the loop exits; clone the handle first if something else
//! needs to stop it.
//!
//! `shutdown` is idempotent: the first caller wins a compare-and-swap,
//! cancels the event loop and joins the worker; later calls return quietly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::thread;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::http::{self, AppState};

/// Handle to a running (or startable) gateway.
///
/// Cheap to clone; all clones control the same gateway.
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<Shared>,
}

struct Shared {
    db: Arc<dyn Database>,
    config: GatewayConfig,
    cancel: CancellationToken,
    started: AtomicBool,
    terminated: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone: stop the event loop. Joining is shutdown's job.
        self.cancel.cancel();
    }
}

impl Gateway {
    /// Creates a gateway for `db` under `config`.
    ///
    /// Returns `None` when the configuration disables the gateway; the
    /// embedding host treats that as a successful no-op.
    #[must_use]
    pub fn new(db: Arc<dyn Database>, config: GatewayConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            shared: Arc::new(Shared {
                db,
                config,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                local_addr: OnceLock::new(),
                worker: Mutex::new(None),
            }),
        })
    }

    /// Starts the gateway.
    ///
    /// Non-blocking mode returns once the listener is bound. Blocking mode
    /// runs the event loop here and returns when it exits.
    ///
    /// # Errors
    ///
    /// [`Error::Listen`] when the listener cannot bind,
    /// [`Error::WorkerStart`] when the worker thread or its runtime cannot
    /// be created, and [`Error::AlreadyStarted`] on reuse of the handle.
    pub fn start(&self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        if self.shared.config.blocking {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(Error::WorkerStart)?;
            return runtime.block_on(serve(Arc::clone(&self.shared), None));
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("docgate-http".to_string())
            .spawn(move || worker_main(&shared, ready_tx))
            .map_err(Error::WorkerStart)?;
        *self.shared.worker.lock().expect("worker mutex poisoned") = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.shutdown();
                Err(err)
            }
            Err(_) => {
                self.shutdown();
                Err(Error::WorkerStart(std::io::Error::other(
                    "worker exited before startup completed",
                )))
            }
        }
    }

    /// Stops the gateway. Safe to call any number of times, from any clone
    /// of the handle.
    pub fn shutdown(&self) {
        if self
            .shared
            .terminated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shared.cancel.cancel();
            let handle = self
                .shared
                .worker
                .lock()
                .expect("worker mutex poisoned")
                .take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }

    /// The address the listener is bound to, once `start` has bound it.
    /// Useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }
}

/// Worker-thread entry point: builds the runtime and runs the event loop.
fn worker_main(shared: &Arc<Shared>, ready: mpsc::Sender<Result<()>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready.send(Err(Error::WorkerStart(err)));
            return;
        }
    };
    if let Err(err) = runtime.block_on(serve(Arc::clone(shared), Some(ready))) {
        error!(error = %err, "gateway event loop failed");
    }
}

/// Binds the listener and runs the accept loop until cancellation.
///
/// When `ready` is present (non-blocking mode), the bind outcome is
/// delivered through it instead of the return value, releasing the thread
/// waiting in `start`.
async fn serve(shared: Arc<Shared>, ready: Option<mpsc::Sender<Result<()>>>) -> Result<()> {
    let bound = bind(&shared.config).await;
    let (listener, addr) = match bound {
        Ok(bound) => bound,
        Err(err) => {
            error!(error = %err, "failed to start HTTP endpoint");
            return match ready {
                Some(tx) => {
                    let _ = tx.send(Err(err));
                    Ok(())
                }
                None => Err(err),
            };
        }
    };

    shared.local_addr.set(addr).ok();
    info!(%addr, "HTTP endpoint listening");
    if let Some(tx) = ready {
        let _ = tx.send(Ok(()));
    }

    let state = AppState {
        db: Arc::clone(&shared.db),
        config: Arc::new(shared.config.clone()),
    };
    let cancel = shared.cancel.clone();
    let result = axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await;
    info!("HTTP endpoint closed");
    result.map_err(Error::EventLoop)
}

async fn bind(config: &GatewayConfig) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(config.bind_addr())
        .await
        .map_err(Error::Listen)?;
    let addr = listener.local_addr().map_err(Error::Listen)?;
    Ok((listener, addr))
}
