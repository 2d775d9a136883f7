//! Bidirectional byte shoveling between two established connections.
//!
//! Each direction is a half-duplex copy loop: read from one side, write
//! the bytes to the other, then read again.  No read is scheduled while
//! the corresponding write is outstanding, so the reading side's TCP
//! window throttles the sender.  When either direction ends — EOF after
//! its pending bytes are flushed, or an error — the whole tunnel comes
//! down; an idle timeout shared by both directions does the same.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use tor_rtcompat::{Runtime, SleepProvider};

use ferry_peers::Link;

/// Per-direction copy buffer size.
const SHOVEL_BUF: usize = 16 * 1024;

/// Limits how many bytes one server read may want.
///
/// A rate gate must never delay client-to-proxy reads, so only the
/// server-to-client direction consults it.
pub trait RateGate: Send + Sync {
    /// How many bytes the next read may ask for, between `lower` and
    /// `upper`.
    fn bytes_wanted(&self, lower: usize, upper: usize) -> usize;
}

/// A [`RateGate`] that never limits anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRateLimit;

impl RateGate for NoRateLimit {
    fn bytes_wanted(&self, _lower: usize, upper: usize) -> usize {
        upper
    }
}

/// What a finished shovel moved, and why it stopped.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct ShovelOutcome {
    /// Bytes delivered from the client to the server.
    pub client_to_server: u64,
    /// Bytes delivered from the server to the client.
    pub server_to_client: u64,
    /// True if an idle timeout (rather than EOF or an error) ended the
    /// tunnel.
    pub timed_out: bool,
}

/// The shared last-activity clock.
///
/// Any successful read or write on either direction refreshes it, which
/// is what gives both directions a shared idle timeout.
struct ActivityClock {
    /// When the tunnel last moved bytes.
    last: Mutex<Instant>,
}

impl ActivityClock {
    /// A clock that considers `now` the most recent activity.
    fn new(now: Instant) -> Arc<Self> {
        Arc::new(ActivityClock {
            last: Mutex::new(now),
        })
    }

    /// Note activity at `now`.
    fn touch(&self, now: Instant) {
        *self.last.lock().expect("poisoned lock") = now;
    }

    /// The most recent activity.
    fn last(&self) -> Instant {
        *self.last.lock().expect("poisoned lock")
    }
}

/// Shovel bytes between `client` and `server` until the tunnel ends.
///
/// `preread_client` and `preread_server` are bytes that arrived before
/// shoveling started (on the client socket before commit, and on the
/// server socket behind the CONNECT response); they are delivered before
/// the first reads.
pub async fn shovel<R: Runtime>(
    runtime: &R,
    client: Link,
    server: Link,
    preread_client: Vec<u8>,
    preread_server: Vec<u8>,
    idle_timeout: Duration,
    rate: Arc<dyn RateGate>,
) -> ShovelOutcome {
    let clock = ActivityClock::new(runtime.now());
    let from_client = Arc::new(AtomicU64::new(0));
    let from_server = Arc::new(AtomicU64::new(0));

    let (client_profile, client_stream, _) = client.into_parts();
    let (server_profile, server_stream, _) = server.into_parts();
    tracing::debug!("shoveling between {} and {}", client_profile, server_profile);

    let (client_read, client_write) = client_stream.split();
    let (server_read, server_write) = server_stream.split();

    let mut client_to_server = pump(
        runtime.clone(),
        client_read,
        server_write,
        preread_client,
        None,
        Arc::clone(&clock),
        Arc::clone(&from_client),
    )
    .boxed()
    .fuse();
    let mut server_to_client = pump(
        runtime.clone(),
        server_read,
        client_write,
        preread_server,
        Some(rate),
        Arc::clone(&clock),
        Arc::clone(&from_server),
    )
    .boxed()
    .fuse();
    let mut watchdog = idle_watchdog(runtime.clone(), Arc::clone(&clock), idle_timeout)
        .boxed()
        .fuse();

    // The first direction to end (EOF with its bytes flushed, or an
    // error) ends the tunnel; dropping the other direction's halves
    // closes what remains.
    let timed_out = futures::select_biased! {
        result = client_to_server => {
            if let Err(error) = result {
                tracing::debug!("client-to-server transfer failed: {}", error);
            }
            false
        }
        result = server_to_client => {
            if let Err(error) = result {
                tracing::debug!("server-to-client transfer failed: {}", error);
            }
            false
        }
        () = watchdog => {
            tracing::debug!("tunnel idle timeout");
            true
        }
    };

    ShovelOutcome {
        client_to_server: from_client.load(Ordering::Relaxed),
        server_to_client: from_server.load(Ordering::Relaxed),
        timed_out,
    }
}

/// One direction: deliver `preread`, then copy until EOF or error.
///
/// On EOF the destination writer is flushed and closed, propagating the
/// shutdown.  Delivered bytes are tallied in `moved` as they complete, so
/// the total survives this future being dropped.
async fn pump<R, Rd, Wr>(
    runtime: R,
    mut reader: Rd,
    mut writer: Wr,
    preread: Vec<u8>,
    rate: Option<Arc<dyn RateGate>>,
    clock: Arc<ActivityClock>,
    moved: Arc<AtomicU64>,
) -> Result<(), std::io::Error>
where
    R: Runtime,
    Rd: futures::io::AsyncRead + Unpin,
    Wr: futures::io::AsyncWrite + Unpin,
{
    if !preread.is_empty() {
        writer.write_all(&preread).await?;
        moved.fetch_add(preread.len() as u64, Ordering::Relaxed);
        clock.touch(runtime.now());
    }

    let mut buf = vec![0_u8; SHOVEL_BUF];
    loop {
        let want = rate
            .as_ref()
            .map_or(SHOVEL_BUF, |r| r.bytes_wanted(1, SHOVEL_BUF))
            .clamp(1, SHOVEL_BUF);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            // EOF: finish the other side's write stream.
            let _ = writer.flush().await;
            let _ = writer.close().await;
            return Ok(());
        }
        clock.touch(runtime.now());
        writer.write_all(&buf[..n]).await?;
        moved.fetch_add(n as u64, Ordering::Relaxed);
        clock.touch(runtime.now());
    }
}

/// Resolve once the tunnel has been idle for `idle_timeout`.
async fn idle_watchdog<R: Runtime>(runtime: R, clock: Arc<ActivityClock>, idle_timeout: Duration) {
    loop {
        let now = runtime.now();
        let idle = now.saturating_duration_since(clock.last());
        if idle >= idle_timeout {
            return;
        }
        runtime.sleep(idle_timeout.saturating_sub(idle)).await;
    }
}
