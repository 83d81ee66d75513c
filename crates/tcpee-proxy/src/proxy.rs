//! Proxy instance lifecycle.
//!
//! A [`TcpProxy`] is constructed once, serves with [`TcpProxy::run`] until
//! cancelled, and drains with [`TcpProxy::close`]. Several `run` calls may
//! share one instance (one per `src -> dst` route); they share the
//! cancellation token, the session barrier, the counters and the
//! statistics ticker.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::session;
use crate::sock::{self, KeepAlive};
use crate::stats::{format_bytes, Counters, TrafficStats};
use crate::{ProxyError, Result};

/// Name used in log events when none is configured.
const DEFAULT_NAME: &str = "proxy";

/// Cadence of the statistics ticker unless overridden.
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Pause after a temporary accept error, so fd exhaustion does not turn
/// the accept loop into a busy loop.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

const LISTEN_BACKLOG: u32 = 1024;

/// Knobs for one proxy instance. All immutable after construction.
///
/// Zero durations mean "no limit" for the timeouts; the keep-alive policy
/// carries its default/disabled states explicitly.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Write a PROXY protocol v1 header on each back-end connection.
    pub proxy_proto: bool,
    /// Apply `IP_TRANSPARENT` to the listener and dialer sockets.
    pub transparent: bool,
    /// Maximum time a back-end dial may take. Zero = no deadline.
    pub dial_timeout: Duration,
    /// Idle read budget on the front-side socket. Zero = unlimited.
    pub client_idle_timeout: Duration,
    /// Idle write budget on the front-side socket. Zero = unlimited.
    pub server_idle_timeout: Duration,
    /// Keep-alive policy for accepted (front) connections.
    pub client_keep_alive: KeepAlive,
    /// Keep-alive policy for dialed (back) connections.
    pub server_keep_alive: KeepAlive,
    /// Cadence of the periodic traffic log. Zero = the 60 s default.
    pub stats_interval: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            proxy_proto: false,
            transparent: false,
            dial_timeout: Duration::ZERO,
            client_idle_timeout: Duration::ZERO,
            server_idle_timeout: Duration::ZERO,
            client_keep_alive: KeepAlive::Default,
            server_keep_alive: KeepAlive::Default,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

/// State shared between the accept loop, every session driver and the
/// statistics ticker of one instance.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) opts: ProxyOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) sessions: TaskTracker,
    pub(crate) counters: Counters,
    stats_started: AtomicBool,
}

impl Shared {
    /// Dial the back-end. Transparent mode is applied to the raw socket
    /// before connecting; the keep-alive policy after. The dial races the
    /// instance's cancellation token and the configured deadline.
    pub(crate) async fn dial(&self, dst: &str) -> Result<TcpStream> {
        let attempt = async {
            let addr = resolve_addr(dst).await?;
            let socket = new_socket(addr)?;
            if self.opts.transparent {
                sock::set_transparent(SockRef::from(&socket))?;
            }
            socket.connect(addr).await
        };

        let bounded = async {
            if self.opts.dial_timeout.is_zero() {
                attempt.await
            } else {
                match tokio::time::timeout(self.opts.dial_timeout, attempt).await {
                    Ok(res) => res,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")),
                }
            }
        };

        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "proxy closed"))
            }
            res = bounded => res,
        }
        .map_err(|source| ProxyError::Dial {
            addr: dst.to_string(),
            source,
        })?;

        let _ = sock::apply_keepalive(SockRef::from(&stream), self.opts.server_keep_alive);
        Ok(stream)
    }

    /// Bind the front-side listener.
    async fn listen(&self, src: &str) -> Result<TcpListener> {
        let bind_err = |source: io::Error| ProxyError::Bind {
            addr: src.to_string(),
            source,
        };

        let addr = resolve_addr(src).await.map_err(bind_err)?;
        let socket = new_socket(addr).map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        if self.opts.transparent {
            sock::set_transparent(SockRef::from(&socket)).map_err(ProxyError::Transparent)?;
        }
        socket.bind(addr).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)
    }

    /// Start the periodic traffic log. One ticker per instance, however
    /// many routes it serves; it stops when the token trips.
    fn spawn_stats(self: Arc<Self>) {
        if self.stats_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.opts.stats_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let stats = shared.counters.snapshot();
                        info!(
                            proxy = %shared.name,
                            bytes_in = %format_bytes(stats.bytes_in),
                            bytes_out = %format_bytes(stats.bytes_out),
                            active_connections = stats.open_connections,
                            "stats",
                        );
                    }
                }
            }
        });
    }
}

/// One named proxy instance.
///
/// Cheaply cloneable; clones share all state, so a clone can `close` an
/// instance another task is `run`ning.
#[derive(Clone)]
pub struct TcpProxy {
    shared: Arc<Shared>,
}

impl TcpProxy {
    /// Create an inert instance. An empty name falls back to `"proxy"`.
    ///
    /// # Errors
    /// `ProxyError::Transparent` when transparent mode is requested on a
    /// platform without `IP_TRANSPARENT`.
    pub fn new(name: impl Into<String>, mut opts: ProxyOptions) -> Result<Self> {
        let mut name = name.into();
        if name.is_empty() {
            name = DEFAULT_NAME.to_string();
        }
        if opts.transparent && !cfg!(target_os = "linux") {
            return Err(ProxyError::Transparent(io::Error::new(
                io::ErrorKind::Unsupported,
                "transparent proxying requires Linux IP_TRANSPARENT",
            )));
        }
        if opts.stats_interval.is_zero() {
            opts.stats_interval = DEFAULT_STATS_INTERVAL;
        }
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                opts,
                cancel: CancellationToken::new(),
                sessions: TaskTracker::new(),
                counters: Counters::default(),
                stats_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Snapshot of the instance's traffic counters.
    pub fn stats(&self) -> TrafficStats {
        self.shared.counters.snapshot()
    }

    /// Serve `src -> dst` until the instance is closed.
    ///
    /// Dials `dst` once before binding the listener so an unreachable
    /// back-end fails fast, then accepts forever. Temporary accept errors
    /// are logged and retried after a one-second pause.
    ///
    /// # Errors
    /// * `ProxyError::Closed` after `close` interrupted the loop — the
    ///   expected way out, not a failure.
    /// * `ProxyError::Dial` when the pre-flight dial fails.
    /// * `ProxyError::Bind` / `ProxyError::Transparent` for listener setup.
    /// * `ProxyError::Accept` for non-recoverable accept errors.
    pub async fn run(&self, src: &str, dst: &str) -> Result<()> {
        let shared = &self.shared;
        Arc::clone(shared).spawn_stats();

        // Fail fast before binding the listener.
        let probe = shared.dial(dst).await?;
        drop(probe);

        let listener = shared.listen(src).await?;

        loop {
            let front = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return Err(ProxyError::Closed),
                res = listener.accept() => match res {
                    Ok((front, _peer)) => front,
                    Err(err) if is_temporary_accept_error(&err) => {
                        error!(proxy = %shared.name, error = %err, "temp. accept error");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(err) => {
                        error!(proxy = %shared.name, error = %err, "accept error");
                        return Err(ProxyError::Accept(err));
                    }
                },
            };

            let _ = sock::apply_keepalive(SockRef::from(&front), shared.opts.client_keep_alive);

            // Counted in before the driver task exists; the driver owns
            // the matching decrement on every exit path.
            shared.counters.open.fetch_add(1, Ordering::SeqCst);
            shared
                .sessions
                .spawn(session::serve(Arc::clone(shared), front, dst.to_string()));
        }
    }

    /// Trip the cancellation token and wait until every session has
    /// finished its cleanup. Idempotent; a second call returns once the
    /// first drain is done.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.sessions.close();
        self.shared.sessions.wait().await;
    }
}

fn new_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

async fn resolve_addr(addr: &str) -> io::Result<SocketAddr> {
    lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))
}

/// Transient accept failures worth retrying: interrupted/aborted handshakes
/// and resource exhaustion.
fn is_temporary_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) {
        return true;
    }
    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        return matches!(code, libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM);
    }
    false
}
