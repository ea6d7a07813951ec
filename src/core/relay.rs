//! Bidirectional relay with traffic statistics
//!
//! Both directions are polled concurrently and the exchange ends as soon as
//! either direction finishes (EOF or error), the idle timeout fires, or the
//! caller drops the future. Bytes are recorded into the [`StatsCollector`]
//! chunk by chunk, after they have been written to the far side, so totals
//! stay exact even when the relay is cut short.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;

use super::address::Address;
use super::hooks::StatsCollector;
use crate::error::{ProxyError, Result};

/// Largest datagram the UDP relay moves in one piece
pub const UDP_BUFFER_SIZE: usize = 65536;

/// Relay tuning
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Per-direction copy buffer
    pub buffer_size: usize,
    /// End the relay after this long without traffic; zero disables
    pub idle_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: 32 * 1024,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayResult {
    /// Bytes moved client -> target
    pub upload: u64,
    /// Bytes moved target -> client
    pub download: u64,
    /// false when the relay ended on idle timeout
    pub completed: bool,
}

/// Ledger last-active is refreshed at most once per this many seconds
const ACTIVITY_REPORT_SECS: u64 = 10;

/// Time of the most recent transfer, shared by both directions.
///
/// Kept in milliseconds since `start` so sub-second idle timeouts hold.
struct Activity<'a> {
    start: Instant,
    last_ms: AtomicU64,
    reported: AtomicU64,
    stats: &'a dyn StatsCollector,
}

impl<'a> Activity<'a> {
    fn new(stats: &'a dyn StatsCollector) -> Self {
        stats.record_activity();
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
            reported: AtomicU64::new(0),
            stats,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        let now = self.elapsed_ms();
        self.last_ms.store(now, Ordering::Release);

        let bucket = now / (ACTIVITY_REPORT_SECS * 1000);
        if self.reported.swap(bucket, Ordering::AcqRel) != bucket {
            self.stats.record_activity();
        }
    }

    fn idle_for(&self) -> Duration {
        Duration::from_millis(
            self.elapsed_ms()
                .saturating_sub(self.last_ms.load(Ordering::Acquire)),
        )
    }

    /// Resolves once no transfer happened for `timeout`
    async fn idle(&self, timeout: Duration) {
        if timeout.is_zero() {
            return std::future::pending().await;
        }
        let check = timeout.min(Duration::from_secs(30));
        let mut ticker = tokio::time::interval(check);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.idle_for() >= timeout {
                return;
            }
        }
    }
}

/// Copy `reader` into `writer` until EOF, counting bytes once written
async fn pump<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity<'_>,
    buffer_size: usize,
    record: F,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; buffer_size.max(1024)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        record(n as u64);
        activity.touch();
    }
}

/// Relay a client stream and a target stream until either side finishes
pub async fn relay_tcp<A, B>(
    client: A,
    remote: B,
    stats: &dyn StatsCollector,
    options: RelayOptions,
) -> io::Result<RelayResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut remote_r, mut remote_w) = tokio::io::split(remote);

    let activity = Activity::new(stats);
    let upload = AtomicU64::new(0);
    let download = AtomicU64::new(0);

    let up = pump(
        &mut client_r,
        &mut remote_w,
        &upload,
        &activity,
        options.buffer_size,
        |n| stats.record_upload(n),
    );
    let down = pump(
        &mut remote_r,
        &mut client_w,
        &download,
        &activity,
        options.buffer_size,
        |n| stats.record_download(n),
    );

    let completed = tokio::select! {
        result = up => { result?; true }
        result = down => { result?; true }
        _ = activity.idle(options.idle_timeout) => false,
    };

    stats.record_activity();

    Ok(RelayResult {
        upload: upload.load(Ordering::Relaxed),
        download: download.load(Ordering::Relaxed),
        completed,
    })
}

async fn datagrams_out<R, F>(
    reader: &mut R,
    socket: &UdpSocket,
    counter: &AtomicU64,
    activity: &Activity<'_>,
    record: F,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let sent = socket.send(&buf[..n]).await?;
        counter.fetch_add(sent as u64, Ordering::Relaxed);
        record(sent as u64);
        activity.touch();
    }
}

async fn datagrams_in<W, F>(
    socket: &UdpSocket,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity<'_>,
    record: F,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let n = socket.recv(&mut buf).await?;
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        record(n as u64);
        activity.touch();
    }
}

/// Relay a client stream over a connected datagram socket.
///
/// Each chunk read from the client is sent as one datagram and each datagram
/// received is written back verbatim; no packet boundaries are added.
pub async fn relay_udp<S>(
    client: S,
    socket: &UdpSocket,
    stats: &dyn StatsCollector,
    options: RelayOptions,
) -> io::Result<RelayResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);

    let activity = Activity::new(stats);
    let upload = AtomicU64::new(0);
    let download = AtomicU64::new(0);

    let outbound = datagrams_out(&mut client_r, socket, &upload, &activity, |n| {
        stats.record_upload(n)
    });
    let inbound = datagrams_in(socket, &mut client_w, &download, &activity, |n| {
        stats.record_download(n)
    });

    let completed = tokio::select! {
        result = outbound => { result?; true }
        result = inbound => { result?; true }
        _ = activity.idle(options.idle_timeout) => false,
    };

    stats.record_activity();

    Ok(RelayResult {
        upload: upload.load(Ordering::Relaxed),
        download: download.load(Ordering::Relaxed),
        completed,
    })
}

/// Dial a TCP target with a connect timeout
pub async fn dial_tcp(target: &Address, timeout: Duration, nodelay: bool) -> Result<TcpStream> {
    let addr = target
        .resolve()
        .await
        .map_err(|e| ProxyError::connect(format!("resolve {}: {}", target, e)))?;

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProxyError::connect(format!("dial {}: {}", target, e))),
        Err(_) => return Err(ProxyError::connect(format!("dial {}: timeout", target))),
    };

    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    Ok(stream)
}

/// Open a datagram socket connected to `target`
pub async fn open_udp(target: &Address) -> Result<UdpSocket> {
    let addr = target
        .resolve()
        .await
        .map_err(|e| ProxyError::connect(format!("resolve {}: {}", target, e)))?;
    let socket = UdpSocket::bind(unspecified_for(&addr))
        .await
        .map_err(|e| ProxyError::connect(format!("bind udp: {}", e)))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| ProxyError::connect(format!("connect udp {}: {}", target, e)))?;
    Ok(socket)
}

/// Wildcard bind address of the same family as `addr`
pub fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
