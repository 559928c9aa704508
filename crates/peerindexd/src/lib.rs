//! peerindexd — peer content index daemon.
//!
//! Owns the two listeners: UDP control requests go through the
//! dispatcher, TCP bulk sessions go to the transfer coordinator. Both
//! stop when the shutdown channel fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;

use peerindex_core::config::IndexConfig;
use peerindex_services::{ContentStore, Dispatcher, Registry, TransferCoordinator, TransferSettings};

pub mod bulk;
pub mod control;

/// A daemon whose sockets are bound but not yet serving.
pub struct Daemon<S: ContentStore> {
    control_socket: Arc<UdpSocket>,
    bulk_listener: TcpListener,
    dispatcher: Arc<Dispatcher<S>>,
    config: IndexConfig,
}

impl<S: ContentStore> Daemon<S> {
    /// Bind both planes. Port 0 in either address picks an ephemeral port.
    pub async fn bind(config: IndexConfig, store: S) -> Result<Self> {
        let control_socket = UdpSocket::bind(config.network.control_addr)
            .await
            .with_context(|| format!("failed to bind control socket {}", config.network.control_addr))?;
        let bulk_listener = TcpListener::bind(config.network.bulk_addr)
            .await
            .with_context(|| format!("failed to bind bulk listener {}", config.network.bulk_addr))?;

        let bulk_port = bulk_listener.local_addr()?.port();
        let registry = Registry::new(config.registry.max_contents_per_peer);
        let coordinator = TransferCoordinator::new(
            registry,
            Arc::new(store),
            TransferSettings::from(&config.transfer),
        );

        tracing::info!(addr = %control_socket.local_addr()?, "control listener bound");
        tracing::info!(addr = %bulk_listener.local_addr()?, "bulk listener bound");

        Ok(Self {
            control_socket: Arc::new(control_socket),
            bulk_listener,
            dispatcher: Arc::new(Dispatcher::new(coordinator, bulk_port)),
            config,
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        self.control_socket
            .local_addr()
            .context("control socket has no local address")
    }

    pub fn bulk_addr(&self) -> Result<SocketAddr> {
        self.bulk_listener
            .local_addr()
            .context("bulk listener has no local address")
    }

    pub fn coordinator(&self) -> &TransferCoordinator<S> {
        self.dispatcher.coordinator()
    }

    /// Serve until `shutdown` fires or a listener task exits.
    pub async fn run(self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let mut shutdown_rx = shutdown.subscribe();
        let coordinator = self.dispatcher.coordinator().clone();

        let control_task = tokio::spawn(
            control::ControlListener::new(
                self.control_socket,
                self.dispatcher.clone(),
                self.config.control.max_inflight_requests,
                shutdown.subscribe(),
            )
            .run(),
        );

        let bulk_task = tokio::spawn(
            bulk::BulkListener::new(
                self.bulk_listener,
                coordinator.clone(),
                self.config.transfer.max_concurrent_transfers,
                shutdown.subscribe(),
            )
            .run(),
        );

        let stats_task = tokio::spawn(stats_loop(
            coordinator,
            Duration::from_secs(self.config.control.stats_interval_secs),
            shutdown.subscribe(),
        ));

        // shutdown first: listeners that stopped because of it are not failures
        let exited = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                tracing::info!("shutting down");
                return Ok(());
            }
            r = control_task => format!("control listener exited: {:?}", r),
            r = bulk_task    => format!("bulk listener exited: {:?}", r),
            r = stats_task   => format!("stats task exited: {:?}", r),
        };

        tracing::error!("{}", exited);
        let _ = shutdown.send(());
        anyhow::bail!(exited)
    }
}

/// Log a registry snapshot every `every`.
async fn stats_loop<S: ContentStore>(
    coordinator: TransferCoordinator<S>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                let stats = coordinator.registry().stats();
                tracing::info!(
                    peers = stats.peers,
                    available = stats.available,
                    pending = stats.pending,
                    uploads_in_flight = coordinator.uploads_in_flight(),
                    "registry snapshot"
                );
            }
        }
    }
}
