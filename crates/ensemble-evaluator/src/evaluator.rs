//! The evaluator: owns the service thread and its lifecycle.
//!
//! [`Evaluator::run`] binds the listener on the calling thread, so an
//! address conflict is reported to the caller, then starts a dedicated
//! OS thread running a current-thread Tokio runtime. Every connection
//! task and the control loop run on that single runtime. The caller
//! keeps its own thread (or runtime) and may stop the service from
//! anywhere with [`Evaluator::stop`].

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;

use ensemble_core::config::EvaluatorConfig;
use ensemble_core::topology::{Ensemble, EvaluatorEndpoint, build_snapshot};
use ensemble_types::Snapshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{EvaluatorError, MonitorError, ServerError};
use crate::monitor::Monitor;
use crate::server::serve_until_done;
use crate::state::EvaluatorState;

/// An ensemble evaluation service.
pub struct Evaluator {
    ensemble: Arc<dyn Ensemble>,
    config: EvaluatorConfig,
    /// Initial tree, taken by the first `run`.
    tree: Mutex<Option<Snapshot>>,
    done: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
    endpoint: OnceLock<EvaluatorEndpoint>,
}

impl core::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Evaluator")
            .field("config", &self.config)
            .field("endpoint", &self.endpoint.get())
            .field("done", &self.done.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    /// Build the initial state tree from the ensemble's topology.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluatorError::Ensemble`] if the topology has duplicate
    /// ids.
    pub fn new(ensemble: Arc<dyn Ensemble>, config: EvaluatorConfig) -> Result<Self, EvaluatorError> {
        let topology = ensemble.topology();
        topology.validate()?;
        let tree = build_snapshot(&topology, ensemble.metadata());
        info!(
            evaluator = %config.id,
            realizations = tree.reals.len(),
            jobs = tree.jobs().count(),
            "Built initial snapshot"
        );
        Ok(Self {
            ensemble,
            config,
            tree: Mutex::new(Some(tree)),
            done: CancellationToken::new(),
            thread: Mutex::new(None),
            endpoint: OnceLock::new(),
        })
    }

    /// Start serving and signal the ensemble to begin.
    ///
    /// Returns the bound address; with port 0 this is where the
    /// ephemeral port can be read.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluatorError::Bind`] if the address is unavailable,
    /// [`EvaluatorError::Runtime`] if the service thread cannot start,
    /// [`EvaluatorError::Ensemble`] if the collaborator fails to start
    /// (the service is stopped again first), and
    /// [`EvaluatorError::AlreadyRunning`] on a second call.
    pub fn run(&self) -> Result<SocketAddr, EvaluatorError> {
        let tree = self
            .tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EvaluatorError::AlreadyRunning)?;

        let requested = format!("{}:{}", self.config.host, self.config.port);
        let bind_error = |source| EvaluatorError::Bind {
            addr: requested.clone(),
            source,
        };
        let listener = StdTcpListener::bind((self.config.host.as_str(), self.config.port))
            .map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| EvaluatorError::Runtime { source })?;

        let (state, control_loop) = EvaluatorState::new(tree, self.config.clone(), self.done.clone());
        let handle = std::thread::Builder::new()
            .name(String::from("ensemble-evaluator"))
            .spawn(move || {
                let result = runtime.block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener)
                        .map_err(|source| ServerError::Listener { source })?;
                    serve_until_done(listener, state, control_loop).await
                });
                if let Err(e) = result {
                    error!(error = %e, "Evaluator server failed");
                }
            })
            .map_err(|source| EvaluatorError::Runtime { source })?;
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let endpoint = EvaluatorEndpoint {
            host: self.config.host.clone(),
            port: addr.port(),
            evaluator_id: self.config.id.clone(),
        };
        info!(%addr, client_url = %endpoint.client_url(), "Evaluator started");
        let endpoint = self.endpoint.get_or_init(|| endpoint);

        if let Err(e) = self.ensemble.evaluate(endpoint) {
            error!(error = %e, "Ensemble failed to start, stopping evaluator");
            self.stop();
            return Err(e.into());
        }
        Ok(addr)
    }

    /// Begin shutdown and block until the service thread has exited.
    ///
    /// Safe to call from any thread, any number of times. Concurrent
    /// callers all return only after the thread is gone. Must not be
    /// called from the evaluator's own runtime.
    pub fn stop(&self) {
        self.done.cancel();
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = thread.take() {
            if handle.join().is_err() {
                error!("Evaluator thread panicked");
            }
            info!("Evaluator stopped");
        }
    }

    /// Resolves once shutdown has begun, whether from [`stop`](Self::stop)
    /// or an observer's `terminate-request`.
    pub async fn stopped(&self) {
        self.done.cancelled().await;
    }

    /// Where the service is listening, once [`run`](Self::run) succeeded.
    pub fn endpoint(&self) -> Option<&EvaluatorEndpoint> {
        self.endpoint.get()
    }

    /// URL observers connect to, once running.
    pub fn monitor_url(&self) -> Option<String> {
        self.endpoint().map(EvaluatorEndpoint::client_url)
    }

    /// URL reporters connect to, once running.
    pub fn dispatch_url(&self) -> Option<String> {
        self.endpoint().map(EvaluatorEndpoint::dispatch_url)
    }

    /// Connect a [`Monitor`] to this evaluator.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::NotRunning`] before [`run`](Self::run), or
    /// [`MonitorError::Connect`] if the handshake fails.
    pub async fn monitor(&self) -> Result<Monitor, MonitorError> {
        let url = self.monitor_url().ok_or(MonitorError::NotRunning)?;
        Monitor::connect(&url).await
    }
}

impl Drop for Evaluator {
    fn drop(&mut self) {
        self.stop();
    }
}
