//! Raw byte relay between two established streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction by [`pump`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copy bytes both ways between `client` and `upstream` until either side ends.
///
/// Each direction runs on its own task. The first direction to finish, by
/// end of stream or error, shuts down its writer and cancels the other one.
/// Both tasks are awaited before this returns.
pub async fn pump<C, U>(client: C, upstream: U) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let token = CancellationToken::new();

    let forward = tokio::spawn(copy_half(
        client_read,
        upstream_write,
        token.clone(),
        "client->upstream",
    ));
    let backward = tokio::spawn(copy_half(
        upstream_read,
        client_write,
        token.clone(),
        "upstream->client",
    ));

    let (forward, backward) = tokio::join!(forward, backward);

    let stats = RelayStats {
        client_to_upstream: forward.unwrap_or_default(),
        upstream_to_client: backward.unwrap_or_default(),
    };

    trace!(
        client_to_upstream = stats.client_to_upstream,
        upstream_to_client = stats.upstream_to_client,
        "Relay finished"
    );

    stats
}

async fn copy_half<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    token: CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(direction, error = %e, "Relay read failed");
                    break;
                }
            },
            _ = token.cancelled() => break,
        };

        let written = tokio::select! {
            written = write_chunk(&mut writer, &buf[..n]) => written,
            _ = token.cancelled() => break,
        };
        if let Err(e) = written {
            debug!(direction, error = %e, "Relay write failed");
            break;
        }

        copied += n as u64;
    }

    let _ = writer.shutdown().await;
    token.cancel();

    copied
}

async fn write_chunk<W: AsyncWrite>(writer: &mut WriteHalf<W>, chunk: &[u8]) -> std::io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}
