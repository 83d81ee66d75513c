//! Per-connection session driver and copy pumps.
//!
//! Each accepted connection gets one driver task: it dials the back-end,
//! optionally emits the PROXY v1 header, then runs two unidirectional pumps
//! until one of them finishes, fails, or the instance is cancelled.
//!
//! Close discipline: each pump half-closes its own destination on exit, so
//! buffered writes can flush after the opposite read side has seen EOF. On
//! cancellation the driver reclaims both pumps instead, which drops all four
//! socket halves and forces in-flight I/O to unblock.

use std::future::Future;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::header;
use crate::proxy::Shared;
use crate::stats::Counters;

/// Copy chunk size for the pumps.
const COPY_BUF_SIZE: usize = 16 * 1024;

/// Which way bytes flow through a pump, and which counter they land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// front → back
    Inbound,
    /// back → front
    Outbound,
}

/// Bounds a single pump operation by the configured idle budget.
///
/// A zero duration disables the budget entirely; otherwise the budget is
/// re-armed for every operation it watches.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdleBudget(Option<Duration>);

impl IdleBudget {
    pub(crate) fn new(limit: Duration) -> Self {
        Self((!limit.is_zero()).then_some(limit))
    }

    /// Run `op` under the budget. Returns `None` when the budget elapsed
    /// before the operation completed.
    pub(crate) async fn watch<F: Future>(&self, op: F) -> Option<F::Output> {
        match self.0 {
            None => Some(op.await),
            Some(limit) => tokio::time::timeout(limit, op).await.ok(),
        }
    }
}

/// Decrements the live-connection count exactly once, on every exit path
/// out of the driver, unwinding included.
struct OpenGuard(Arc<Shared>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drive one accepted connection: dial, header, two pumps, arbitration.
///
/// The matching increment of the live-connection count happened in the
/// accept loop, before this task was spawned.
pub(crate) async fn serve(shared: Arc<Shared>, front: TcpStream, dst: String) {
    let _open = OpenGuard(Arc::clone(&shared));

    let mut back = match shared.dial(&dst).await {
        Ok(conn) => conn,
        Err(err) => {
            error!(proxy = %shared.name, error = %err, "dial error");
            return;
        }
    };

    let (src_addr, front_local, back_peer) =
        match (front.peer_addr(), front.local_addr(), back.peer_addr()) {
            (Ok(peer), Ok(local), Ok(back_peer)) => (peer, local, back_peer),
            (Err(err), ..) | (_, Err(err), _) | (.., Err(err)) => {
                error!(proxy = %shared.name, error = %err, "address error");
                return;
            }
        };

    info!(
        proxy = %shared.name,
        count = shared.counters.open.load(Ordering::SeqCst),
        src = %src_addr.ip(),
        dst = %back_peer,
        "proxying",
    );

    // The header must be flushed before any front→back byte; the inbound
    // pump is not started until this write has completed.
    if shared.opts.proxy_proto {
        if let Err(err) = header::send_v1_header(&mut back, src_addr, front_local).await {
            error!(proxy = %shared.name, error = %err, "output error");
            return;
        }
    }

    // Both idle budgets are anchored on the front-side socket: the client
    // read budget bounds the inbound pump's reads, the server write budget
    // bounds the outbound pump's writes.
    let client_budget = IdleBudget::new(shared.opts.client_idle_timeout);
    let server_budget = IdleBudget::new(shared.opts.server_idle_timeout);

    let (err_in_tx, err_in_rx) = oneshot::channel();
    let (err_out_tx, err_out_rx) = oneshot::channel();

    let (front_rd, front_wr) = front.into_split();
    let (back_rd, back_wr) = back.into_split();

    let inbound = tokio::spawn(pump(
        front_rd,
        back_wr,
        client_budget,
        Direction::Inbound,
        Arc::clone(&shared),
        err_in_tx,
    ));
    let outbound = tokio::spawn(pump(
        back_rd,
        front_wr,
        server_budget,
        Direction::Outbound,
        Arc::clone(&shared),
        err_out_tx,
    ));

    tokio::select! {
        res = err_in_rx => {
            if let Ok(err) = res {
                error!(proxy = %shared.name, error = %err, "input error");
            }
        }
        res = err_out_rx => {
            if let Ok(err) = res {
                error!(proxy = %shared.name, error = %err, "output error");
            }
        }
        _ = shared.cancel.cancelled() => {
            // Dropping the pump futures drops all four halves, which closes
            // both sockets and unblocks anything mid-copy. abort() only
            // schedules that; both handles must be awaited so the sockets
            // are gone before this session releases its barrier ticket.
            inbound.abort();
            outbound.abort();
            let _ = inbound.await;
            let _ = outbound.await;
        }
    }
}

/// One-directional copy: run the loop, half-close the destination, then
/// report. Dropping the sender closes the completion slot, which the driver
/// reads as a clean exit.
async fn pump(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    budget: IdleBudget,
    dir: Direction,
    shared: Arc<Shared>,
    done: oneshot::Sender<io::Error>,
) {
    let result = copy_loop(&mut src, &mut dst, budget, dir, &shared.counters).await;
    let _ = dst.shutdown().await;
    if let Err(err) = result {
        let _ = done.send(err);
    }
}

/// The splice-style copy loop. The idle budget is re-armed for every
/// watched operation; a window in which at least one byte moved never
/// counts as idle, and bytes that did move are always counted.
///
/// Returns `Ok(())` on EOF, benign peer close, or genuine idle expiry, and
/// `Err` for anything the session driver should log.
async fn copy_loop<R, W>(
    src: &mut R,
    dst: &mut W,
    budget: IdleBudget,
    dir: Direction,
    counters: &Counters,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let read = match dir {
            Direction::Inbound => match budget.watch(src.read(&mut buf)).await {
                Some(res) => res,
                // No bytes arrived inside the window: terminally idle.
                None => return Ok(()),
            },
            Direction::Outbound => src.read(&mut buf).await,
        };

        let n = match read {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if is_benign_close(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        // Flush the chunk one write at a time so the budget sees partial
        // progress: a write that moved bytes re-arms it, only a window with
        // zero bytes flushed is idle. Early exits count what was flushed.
        let mut written = 0;
        while written < n {
            let wrote = match dir {
                Direction::Inbound => Some(dst.write(&buf[written..n]).await),
                Direction::Outbound => budget.watch(dst.write(&buf[written..n])).await,
            };
            match wrote {
                // Nothing flushed for the whole window: the client stopped
                // draining, treat as idle expiry.
                None | Some(Ok(0)) => {
                    counters.add_bytes(dir, written as u64);
                    return Ok(());
                }
                Some(Ok(m)) => written += m,
                Some(Err(err)) if is_benign_close(&err) => {
                    counters.add_bytes(dir, written as u64);
                    return Ok(());
                }
                Some(Err(err)) => {
                    counters.add_bytes(dir, written as u64);
                    return Err(err);
                }
            }
        }
        counters.add_bytes(dir, n as u64);
    }
}

/// Errors that mean "the other side went away" rather than a fault worth
/// surfacing.
fn is_benign_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
