use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ServerArgs,
    connection::handle_connection,
    hub::{self, HubConfig, HubHandle},
};

/// Outbound queue depth per session before it counts as unresponsive.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Smallest queue that still leaves room for a relayed chunk and its notices.
pub const MIN_QUEUE_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub queue_capacity: usize,
    pub default_room: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8080).into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_room: HubConfig::default().default_room,
        }
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            listen: args.listen,
            queue_capacity: args.queue_capacity.max(MIN_QUEUE_CAPACITY),
            default_room: args.default_room.clone(),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self { listener, config }
    }

    /// Binds `config.listen`. A bind failure is a fatal startup error.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then stops the hub.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, config } = self;
        let (hub, hub_task) = hub::spawn(HubConfig {
            default_room: config.default_room.clone(),
        });
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    hub.shutdown().await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &hub, config.queue_capacity);
                }
            }
        }

        hub_task.await.context("hub task panicked")?;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    hub: &HubHandle,
    queue_capacity: usize,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, hub, queue_capacity),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, hub: &HubHandle, queue_capacity: usize) {
    let hub = hub.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, hub, queue_capacity).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}
