//! Self-expiring HTTP server.
//!
//! Binds a port, serves exactly one request to its [`Endpoint`], then
//! shuts down. A watchdog stops the server when no request has arrived
//! by the deadline, and cancelling the caller's token stops it at once.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api_error::ApiError;
use crate::body::GuardedBody;
use crate::error::ServerError;
use crate::mode::Endpoint;
use crate::{DEFAULT_DEADLINE, DEFAULT_GRACEFUL_PERIOD};

/// Where the server listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bind {
    /// All interfaces. Port 0 picks an ephemeral port.
    Port(u16),
    /// Loopback only. Port 0 picks an ephemeral port.
    LocalPort(u16),
}

impl Bind {
    fn addr(self) -> SocketAddr {
        match self {
            Bind::Port(port) => (Ipv4Addr::UNSPECIFIED, port).into(),
            Bind::LocalPort(port) => (Ipv4Addr::LOCALHOST, port).into(),
        }
    }
}

/// Server lifetime settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long to wait for the request before stopping.
    pub deadline: Duration,
    /// How long open connections may finish during shutdown. Zero closes
    /// them immediately.
    pub graceful_period: Duration,
    /// Log start and stop at debug level instead of info.
    pub silent: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            graceful_period: DEFAULT_GRACEFUL_PERIOD,
            silent: false,
        }
    }
}

impl ServerConfig {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_graceful_period(mut self, period: Duration) -> Self {
        self.graceful_period = period;
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Why a server stopped without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The request was accepted and its response finished or was dropped.
    Served,
    /// The deadline passed with no request.
    Expired,
    /// The caller's token was cancelled before any request.
    Cancelled,
}

/// A running server.
#[derive(Debug)]
pub struct Server {
    /// The bound port, resolved when an ephemeral port was asked for.
    pub port: u16,
    /// Resolves once, after the listener and every connection are closed.
    pub stopped: oneshot::Receiver<Result<StopReason, ServerError>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Armed,
    Handling,
    Expired,
    Closed,
}

/// Admission gate: the first of "a request arrives" and "the watchdog
/// fires" wins, and only once.
struct Gate {
    phase: Mutex<Phase>,
    serving: CancellationToken,
}

impl Gate {
    fn new(serving: CancellationToken) -> Self {
        Self {
            phase: Mutex::new(Phase::Armed),
            serving,
        }
    }

    fn transition(&self, to: Phase) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != Phase::Armed {
            return false;
        }
        *phase = to;
        true
    }

    fn admit(&self) -> bool {
        self.transition(Phase::Handling)
    }

    fn expire(&self) -> bool {
        self.transition(Phase::Expired)
    }

    /// Refuses further requests and reports how serving ended.
    fn close(&self) -> StopReason {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let reason = match *phase {
            Phase::Handling => StopReason::Served,
            Phase::Expired => StopReason::Expired,
            Phase::Armed | Phase::Closed => StopReason::Cancelled,
        };
        if *phase == Phase::Armed {
            *phase = Phase::Closed;
        }
        reason
    }
}

/// Starts serving `endpoint`.
///
/// Returns once the listener is bound, so [`Server::port`] is final. The
/// server stops after the first request to the endpoint has been answered
/// (or its client went away), when `config.deadline` passes with no such
/// request, or when `cancel` is cancelled. Requests racing with the first
/// one, or arriving after expiry, get 404. Requests to other paths do not
/// count.
pub async fn start(
    cancel: CancellationToken,
    bind: Bind,
    endpoint: Endpoint,
    config: ServerConfig,
) -> Result<Server, ServerError> {
    let listener = TcpListener::bind(bind.addr()).await?;
    let port = listener.local_addr()?.port();

    let serving = cancel.child_token();
    let gate = Arc::new(Gate::new(serving.clone()));

    if config.silent {
        debug!(port, method = %endpoint.method, path = %endpoint.path, "data agent server listening");
    } else {
        info!(port, method = %endpoint.method, path = %endpoint.path, "data agent server listening");
    }

    let app = endpoint
        .into_router()
        .route_layer(middleware::from_fn_with_state(gate.clone(), admit_once));

    tokio::spawn(watchdog(gate.clone(), config.deadline));

    let (stopped_tx, stopped) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = serve(listener, app, &gate, &config).await;
        let reason = gate.close();
        let outcome = outcome.map(|()| reason);
        match &outcome {
            Ok(reason) if config.silent => debug!(port, ?reason, "data agent server stopped"),
            Ok(reason) => info!(port, ?reason, "data agent server stopped"),
            Err(err) => warn!(port, error = %err, "data agent server failed"),
        }
        let _ = stopped_tx.send(outcome);
    });

    Ok(Server { port, stopped })
}

async fn watchdog(gate: Arc<Gate>, deadline: Duration) {
    tokio::select! {
        _ = gate.serving.cancelled() => {}
        _ = tokio::time::sleep(deadline) => {
            if gate.expire() {
                debug!(?deadline, "no request before deadline; stopping");
                gate.serving.cancel();
            }
        }
    }
}

async fn admit_once(State(gate): State<Arc<Gate>>, request: Request, next: Next) -> Response {
    if !gate.admit() {
        debug!(uri = %request.uri(), "request refused; server already used or expired");
        return ApiError::not_found().into_response();
    }

    // Teardown starts when the response body is dropped, or when this
    // future is dropped because the client disconnected mid-handler.
    let guard = gate.serving.clone().drop_guard();
    let response = next.run(request).await;
    response.map(|body| Body::new(GuardedBody::new(body, guard)))
}

/// Accepts connections until `serving` is cancelled, then drains them.
async fn serve(
    listener: TcpListener,
    app: Router,
    gate: &Gate,
    config: &ServerConfig,
) -> Result<(), ServerError> {
    let mut connections = JoinSet::new();

    let result = loop {
        tokio::select! {
            biased;
            _ = gate.serving.cancelled() => break Ok(()),
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => break Err(ServerError::Io(err)),
                };
                debug!(%addr, "connection accepted");
                let service = TowerToHyperService::new(app.clone());
                let serving = gate.serving.clone();
                connections.spawn(async move {
                    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);
                    let result = tokio::select! {
                        result = conn.as_mut() => result,
                        _ = serving.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };
                    if let Err(err) = result {
                        debug!(%addr, error = %err, "connection closed with error");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    // Teardown proceeds even when the caller's token was the trigger.
    gate.serving.cancel();
    drop(listener);

    if !config.graceful_period.is_zero() && !connections.is_empty() {
        let drained = tokio::time::timeout(config.graceful_period, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                period = ?config.graceful_period,
                remaining = connections.len(),
                "graceful period elapsed; closing connections"
            );
        }
    }
    connections.abort_all();
    while connections.join_next().await.is_some() {}

    result
}
