//! Bidirectional stream swap
//!
//! Splices two duplex streams: bytes read from one side are written to the
//! other until either side ends. The first direction to finish ends the
//! whole swap and both streams are shut down, so the peer of the surviving
//! side observes the close as well.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default idle read timeout (10 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

const BUFFER_SIZE: usize = 16 * 1024;

/// Errors that end a swap abnormally
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("No data received from {side} for {timeout:?}")]
    IdleTimeout { side: &'static str, timeout: Duration },

    #[error("IO error while copying from {side}: {source}")]
    Io {
        side: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Swap tuning
#[derive(Debug, Clone, Copy)]
pub struct SwapConfig {
    /// Maximum time a read may wait for data; `None` disables the timeout
    pub idle_timeout: Option<Duration>,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl SwapConfig {
    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(idle_timeout),
        }
    }
}

/// Byte counts of a finished swap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    /// Bytes copied from the first stream into the second
    pub a_to_b: u64,
    /// Bytes copied from the second stream into the first
    pub b_to_a: u64,
    /// The swap was ended by the cancellation token
    pub cancelled: bool,
}

/// Copy bytes in both directions between `a` and `b`.
///
/// Returns when either direction reaches end-of-stream, fails, idles past
/// the configured timeout, or `cancel` fires. Both streams are shut down and
/// dropped before returning.
pub async fn swap<A, B>(
    a: A,
    b: B,
    config: SwapConfig,
    cancel: &CancellationToken,
) -> Result<SwapStats, SwapError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut stats = SwapStats::default();

    let result = {
        let a_to_b = pump(
            &mut a_read,
            &mut b_write,
            config.idle_timeout,
            &mut stats.a_to_b,
            "a",
        );
        let b_to_a = pump(
            &mut b_read,
            &mut a_write,
            config.idle_timeout,
            &mut stats.b_to_a,
            "b",
        );

        tokio::select! {
            result = a_to_b => result,
            result = b_to_a => result,
            _ = cancel.cancelled() => {
                stats.cancelled = true;
                Ok(())
            }
        }
    };

    // Either side ending ends both
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    debug!(
        a_to_b = stats.a_to_b,
        b_to_a = stats.b_to_a,
        cancelled = stats.cancelled,
        "Swap finished"
    );

    result.map(|_| stats)
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    copied: &mut u64,
    side: &'static str,
) -> Result<(), SwapError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let read = reader.read(&mut buf);
        let n = match idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| SwapError::IdleTimeout { side, timeout })?,
            None => read.await,
        }
        .map_err(|source| SwapError::Io { side, source })?;

        if n == 0 {
            return Ok(());
        }

        writer
            .write_all(&buf[..n])
            .await
            .map_err(|source| SwapError::Io { side, source })?;
        writer
            .flush()
            .await
            .map_err(|source| SwapError::Io { side, source })?;

        *copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (a_outer, a_inner) = duplex(1024);
        let (b_outer, b_inner) = duplex(1024);
        let cancel = CancellationToken::new();

        let handle =
            tokio::spawn(async move { swap(a_inner, b_inner, SwapConfig::default(), &cancel).await });

        let (mut a_read, mut a_write) = tokio::io::split(a_outer);
        let (mut b_read, mut b_write) = tokio::io::split(b_outer);

        a_write.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        b_write.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        a_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        // Closing one side ends the swap
        a_write.shutdown().await.unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 7);
        assert_eq!(stats.b_to_a, 9);
        assert!(!stats.cancelled);
    }

    #[tokio::test]
    async fn test_one_side_closing_closes_the_other() {
        let (mut a_outer, a_inner) = duplex(8192);
        let (mut b_outer, b_inner) = duplex(8192);
        let cancel = CancellationToken::new();

        let handle =
            tokio::spawn(async move { swap(a_inner, b_inner, SwapConfig::default(), &cancel).await });

        let payload = vec![42u8; 4000];
        a_outer.write_all(&payload).await.unwrap();
        a_outer.shutdown().await.unwrap();

        // B sees every byte, then end-of-stream
        let mut received = Vec::new();
        b_outer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        // A sees end-of-stream too
        let mut rest = Vec::new();
        a_outer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 4000);
    }

    #[tokio::test]
    async fn test_cancellation_ends_swap() {
        let (_a_outer, a_inner) = duplex(64);
        let (mut b_outer, b_inner) = duplex(64);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(async move {
            swap(a_inner, b_inner, SwapConfig::default(), &cancel_clone).await
        });

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert!(stats.cancelled);

        let mut rest = Vec::new();
        b_outer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (_a_outer, a_inner) = duplex(64);
        let (_b_outer, b_inner) = duplex(64);
        let cancel = CancellationToken::new();

        let result = swap(
            a_inner,
            b_inner,
            SwapConfig::with_idle_timeout(Duration::from_secs(5)),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(SwapError::IdleTimeout { .. })));
    }
}
