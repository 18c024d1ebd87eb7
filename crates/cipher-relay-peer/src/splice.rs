//! Bidirectional copy between a plain socket and a logical stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::control::CloseReason;
use crate::error::Result;
use crate::stream::StreamHandle;

const COPY_BUFFER: usize = 16 * 1024;

/// Plaintext bytes relayed, from the client's point of view.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrafficCounters {
    /// Bytes read from sockets and sent into streams.
    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    /// Bytes read from streams and written to sockets.
    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    pub fn add_upload(&self, n: usize) {
        self.upload.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_download(&self, n: usize) {
        self.download.fetch_add(n as u64, Ordering::Relaxed);
    }
}

enum Side {
    Upload,
    Download,
}

/// Copy `socket` into `stream` and `stream` into `socket` until both
/// directions finish.
///
/// Each direction ends with a half-close of its sink. Once one direction is
/// done the other gets `grace` to finish before the stream is reset. An error
/// in either direction resets the stream at once.
pub async fn splice<S>(
    socket: S,
    stream: &StreamHandle,
    grace: Duration,
    counters: &TrafficCounters,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(socket);
    let upload = pump_upload(&mut reader, stream, counters);
    let download = pump_download(&mut writer, stream, counters);
    tokio::pin!(upload);
    tokio::pin!(download);

    let (first, side) = tokio::select! {
        result = &mut upload => (result, Side::Upload),
        result = &mut download => (result, Side::Download),
    };
    if let Err(err) = first {
        stream.abort(CloseReason::Reset);
        return Err(err);
    }

    let rest = match side {
        Side::Upload => tokio::time::timeout(grace, &mut download).await,
        Side::Download => tokio::time::timeout(grace, &mut upload).await,
    };
    match rest {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            stream.abort(CloseReason::Reset);
            Err(err)
        }
        Err(_) => {
            debug!(stream_id = stream.id(), ?grace, "half-close grace expired");
            stream.abort(CloseReason::Reset);
            Ok(())
        }
    }
}

async fn pump_upload<R>(
    reader: &mut R,
    stream: &StreamHandle,
    counters: &TrafficCounters,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            stream.close();
            return Ok(());
        }
        stream.write_all(&buf[..n]).await?;
        counters.add_upload(n);
    }
}

async fn pump_download<W>(
    writer: &mut W,
    stream: &StreamHandle,
    counters: &TrafficCounters,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = stream.read().await? {
        writer.write_all(&chunk).await?;
        counters.add_download(chunk.len());
    }
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use tokio::io::duplex;

    use super::*;
    use crate::control::Destination;
    use crate::mux::tests::linked_pair;
    use crate::mux::MuxConfig;

    #[tokio::test]
    async fn splices_both_directions_and_counts() {
        let (initiator, _responder, mut incoming) = linked_pair(MuxConfig::default());
        let echo = tokio::spawn(async move {
            let stream = incoming.next().await.expect("incoming stream");
            stream.accept_open().expect("accept");
            while let Some(chunk) = stream.read().await.expect("read") {
                stream.write_all(&chunk).await.expect("echo");
            }
            stream.close();
        });

        let dest = Destination::Ip(SocketAddr::from(([127, 0, 0, 1], 9)));
        let stream = initiator.open_stream(dest).await.expect("open");
        let (mut app, relay_side) = duplex(64 * 1024);
        let counters = Arc::new(TrafficCounters::default());

        let relay = {
            let counters = counters.clone();
            tokio::spawn(async move {
                splice(relay_side, &stream, Duration::from_secs(1), &counters).await
            })
        };

        app.write_all(b"round trip").await.expect("write");
        app.shutdown().await.expect("shutdown");
        let mut echoed = Vec::new();
        app.read_to_end(&mut echoed).await.expect("read");
        assert_eq!(echoed, b"round trip");

        relay.await.expect("relay task").expect("splice ok");
        echo.await.expect("echo task");
        assert_eq!(counters.upload(), 10);
        assert_eq!(counters.download(), 10);
    }

    #[tokio::test]
    async fn grace_period_bounds_one_sided_close() {
        let (initiator, _responder, mut incoming) = linked_pair(MuxConfig::default());
        let remote = tokio::spawn(async move {
            let stream = incoming.next().await.expect("incoming stream");
            stream.accept_open().expect("accept");
            stream.close();
            // Keep the handle alive but never read.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let dest = Destination::Domain("example.test".to_string(), 80);
        let stream = initiator.open_stream(dest).await.expect("open");
        // The client side never closes its socket.
        let (_app, relay_side) = duplex(1024);

        let started = tokio::time::Instant::now();
        splice(relay_side, &stream, Duration::from_millis(100), &TrafficCounters::default())
            .await
            .expect("grace expiry is not an error");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(stream.is_closed());
        remote.abort();
    }
}
