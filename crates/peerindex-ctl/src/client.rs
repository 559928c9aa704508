//! Client side of both planes, shared by the CLI and the integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use peerindex_core::wire::{read_frame, write_frame, MAX_REPLY_LEN};
use peerindex_core::{BulkHandshake, BulkOp, BulkStatus, Reply, Request};

pub const DEFAULT_SERVER: &str = "127.0.0.1:8080";

const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Read-only requests are resent this many times before giving up.
const QUERY_ATTEMPTS: usize = 3;

/// An `ERROR` reply or a `rejected` bulk frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

/// Resolve `host:port`.
pub async fn resolve(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("failed to resolve {}", server))?
        .next()
        .with_context(|| format!("no address for {}", server))
}

// ── Control plane ─────────────────────────────────────────────────────────────

/// Send one control request and wait for its reply. `ERROR` replies are
/// returned as `Reply::Error`, not as `Err`.
pub async fn request(server: SocketAddr, req: &Request) -> Result<Reply> {
    let bind: SocketAddr = if server.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind)
        .await
        .context("failed to bind client socket")?;
    request_on(&socket, server, req).await
}

/// Like `request`, from an already-bound socket. The index records the
/// register sender's address, so callers that care which address is
/// published pass their own socket.
pub async fn request_on(socket: &UdpSocket, server: SocketAddr, req: &Request) -> Result<Reply> {
    let attempts = match req {
        Request::Search { .. } | Request::List { .. } | Request::Download { .. } => QUERY_ATTEMPTS,
        Request::Register { .. } | Request::Deregister { .. } => 1,
    };
    let datagram = req.encode();
    let mut buf = vec![0u8; MAX_REPLY_LEN];

    for _ in 0..attempts {
        socket
            .send_to(datagram.as_bytes(), server)
            .await
            .with_context(|| format!("failed to send to {}", server))?;

        let received = loop {
            match tokio::time::timeout(REPLY_TIMEOUT, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) if from == server => break Some(len),
                // stray datagram from someone else
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e).context("failed to receive reply"),
                Err(_) => break None,
            }
        };
        if let Some(len) = received {
            return Reply::parse(&buf[..len]).context("unparseable reply");
        }
    }
    bail!(
        "no reply from {} after {} attempt(s) — is peerindexd running?",
        server,
        attempts
    )
}

/// Turn an `ERROR` reply into `Err(ServerError)`.
pub fn ok(reply: Reply) -> Result<Reply> {
    match reply {
        Reply::Error { code, message } => Err(ServerError { code, message }.into()),
        other => Ok(other),
    }
}

// ── Bulk plane ────────────────────────────────────────────────────────────────

async fn open_bulk(addr: SocketAddr, handshake: &BulkHandshake) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to bulk port {}", addr))?;
    write_frame(&mut stream, handshake).await?;
    Ok(stream)
}

fn rejected(status: BulkStatus) -> anyhow::Error {
    match status {
        BulkStatus::Rejected { code, message } => ServerError { code, message }.into(),
        other => anyhow::anyhow!("unexpected bulk status {:?}", other),
    }
}

/// Upload leg of a register: stream `size_bytes` bytes of `body` to the
/// bulk port and wait for the commit. Returns the stored size.
pub async fn upload<R>(
    addr: SocketAddr,
    peer_id: &str,
    name: &str,
    body: &mut R,
    size_bytes: u64,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let handshake = BulkHandshake {
        op: BulkOp::Upload,
        peer_id: peer_id.to_string(),
        name: name.to_string(),
        size_bytes: Some(size_bytes),
    };
    let mut stream = open_bulk(addr, &handshake).await?;

    match read_frame(&mut stream).await? {
        BulkStatus::Accepted => {}
        other => return Err(rejected(other)),
    }

    tokio::io::copy(&mut body.take(size_bytes), &mut stream)
        .await
        .context("upload interrupted")?;
    stream.shutdown().await.context("failed to finish upload")?;

    match read_frame(&mut stream).await? {
        BulkStatus::Complete { size_bytes } => Ok(size_bytes),
        other => Err(rejected(other)),
    }
}

/// Download leg: fetch `(owner, name)` into `out`. Returns the byte count.
pub async fn download<W>(addr: SocketAddr, owner: &str, name: &str, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let handshake = BulkHandshake {
        op: BulkOp::Download,
        peer_id: owner.to_string(),
        name: name.to_string(),
        size_bytes: None,
    };
    let mut stream = open_bulk(addr, &handshake).await?;

    let size = match read_frame(&mut stream).await? {
        BulkStatus::Sending { size_bytes } => size_bytes,
        other => return Err(rejected(other)),
    };

    let copied = tokio::io::copy(&mut (&mut stream).take(size), out)
        .await
        .context("download interrupted")?;
    if copied != size {
        bail!("connection closed after {} of {} bytes", copied, size);
    }
    out.flush().await?;
    Ok(size)
}

// ── Whole operations ──────────────────────────────────────────────────────────

/// `R` then upload. The bulk connection goes to the control server's
/// host on the port named in `READY`.
pub async fn register<R>(
    socket: &UdpSocket,
    server: SocketAddr,
    peer_id: &str,
    name: &str,
    body: &mut R,
    size_bytes: u64,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let req = Request::Register {
        peer_id: peer_id.to_string(),
        name: name.to_string(),
    };
    let bulk_port = match ok(request_on(socket, server, &req).await?)? {
        Reply::Ready { bulk_port, .. } => bulk_port,
        other => bail!("unexpected reply {:?}", other),
    };
    upload(
        SocketAddr::new(server.ip(), bulk_port),
        peer_id,
        name,
        body,
        size_bytes,
    )
    .await
}

/// `D` then download from whichever peer the index picked. Returns the
/// owner and the byte count.
pub async fn fetch<W>(server: SocketAddr, name: &str, out: &mut W) -> Result<(String, u64)>
where
    W: AsyncWrite + Unpin,
{
    let req = Request::Download {
        name: name.to_string(),
    };
    let (owner, bulk_port) = match ok(request(server, &req).await?)? {
        Reply::Download {
            owner, bulk_port, ..
        } => (owner, bulk_port),
        other => bail!("unexpected reply {:?}", other),
    };
    let size = download(SocketAddr::new(server.ip(), bulk_port), &owner, name, out).await?;
    Ok((owner, size))
}
