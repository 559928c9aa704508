//! peerindex integration test harness.
//!
//! Every test starts its own in-process daemon bound to ephemeral
//! loopback ports, with a private storage directory under the system temp
//! dir. Peers are plain UDP sockets; the source address of a peer's
//! register is what the index publishes for it.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use peerindex_core::config::IndexConfig;
use peerindex_core::Reply;
use peerindex_ctl::client;
use peerindex_ctl::ServerError;
use peerindex_services::{FsContentStore, TransferCoordinator};
use peerindexd::Daemon;

mod failures;
mod files;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "peerindex-it-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

/// A running daemon. Dropping it stops the listeners and deletes storage.
pub struct TestDaemon {
    pub control: SocketAddr,
    pub bulk: SocketAddr,
    pub storage: PathBuf,
    /// Shares state with the running daemon, for white-box assertions.
    pub coordinator: TransferCoordinator<FsContentStore>,
    shutdown: broadcast::Sender<()>,
}

impl TestDaemon {
    pub async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    /// Start with config adjustments applied over the test defaults.
    pub async fn start_with(tweak: impl FnOnce(&mut IndexConfig)) -> Result<Self> {
        let storage = temp_dir("store");
        let mut config = IndexConfig::default();
        config.network.control_addr = "127.0.0.1:0".parse()?;
        config.network.bulk_addr = "127.0.0.1:0".parse()?;
        config.transfer.storage_path = storage.clone();
        config.transfer.idle_timeout_secs = 5;
        config.control.stats_interval_secs = 3600;
        tweak(&mut config);
        config.validate()?;

        let store = FsContentStore::new(storage.clone())?;
        let daemon = Daemon::bind(config, store).await?;
        let control = daemon.control_addr()?;
        let bulk = daemon.bulk_addr()?;
        let coordinator = daemon.coordinator().clone();

        let (shutdown, _) = broadcast::channel::<()>(1);
        let tx = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = daemon.run(tx).await {
                eprintln!("daemon exited: {:#}", e);
            }
        });

        Ok(Self {
            control,
            bulk,
            storage,
            coordinator,
            shutdown,
        })
    }

    /// Send a raw datagram from `socket` and return the parsed reply.
    pub async fn send(&self, socket: &UdpSocket, datagram: &str) -> Result<Reply> {
        socket.send_to(datagram.as_bytes(), self.control).await?;
        let mut buf = vec![0u8; peerindex_core::wire::MAX_REPLY_LEN];
        let (len, _) = tokio::time::timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
            .await
            .context("no reply within 3s")??;
        Ok(Reply::parse(&buf[..len])?)
    }

    /// Number of blob files (committed or partial) on disk.
    pub fn blob_files(&self) -> usize {
        count_files(&self.storage)
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        let _ = std::fs::remove_dir_all(&self.storage);
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| {
            let path = e.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

/// A peer: one UDP socket on loopback.
pub async fn peer_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

/// Register and upload `data` as `peer`/`name` from `socket`.
pub async fn publish(
    d: &TestDaemon,
    socket: &UdpSocket,
    peer: &str,
    name: &str,
    data: &[u8],
) -> Result<u64> {
    let mut body = data;
    client::register(socket, d.control, peer, name, &mut body, data.len() as u64).await
}

/// Download `name` through the index.
pub async fn fetch(d: &TestDaemon, name: &str) -> Result<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let (owner, _) = client::fetch(d.control, name, &mut out).await?;
    Ok((owner, out))
}

/// Wire code of a failed client operation, if the server refused it.
pub fn server_code(err: &anyhow::Error) -> Option<&str> {
    err.downcast_ref::<ServerError>().map(|e| e.code.as_str())
}

pub fn reply_code(reply: &Reply) -> &str {
    match reply {
        Reply::Error { code, .. } => code,
        other => panic!("expected an error reply, got {:?}", other),
    }
}

/// Poll `check` every 20ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

// ── Smoke ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_daemon_binds_ephemeral_ports() {
    let d = TestDaemon::start().await.unwrap();
    assert_ne!(d.control.port(), 0);
    assert_ne!(d.bulk.port(), 0);

    let peer = peer_socket().await;
    let reply = d.send(&peer, "L nobody").await.unwrap();
    assert_eq!(
        reply,
        Reply::Listing {
            peer_id: "nobody".into(),
            names: vec![]
        }
    );
}
