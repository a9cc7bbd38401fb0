use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Error, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::{self, Outbound},
    frame::FrameError,
    registry::Registry,
};

/// Default bound on how long a requester waits for the target's answer.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    pub reply_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

pub struct Broker {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_config(listener, BrokerConfig::default())
    }

    pub fn with_config(listener: TcpListener, config: BrokerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared view of the registry, mainly for inspection in tests.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker {
            listener,
            registry,
            config,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&registry);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, config);
                }
            }
        }

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

fn handle_shutdown(registry: &Registry) {
    let handles = registry.handles();
    info!(clients = handles.len(), "broker shutting down");
    for handle in handles {
        handle.send(Outbound::Shutdown);
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    config: BrokerConfig,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, registry, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    config: BrokerConfig,
) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(err) = dispatcher::serve(stream, registry, config).await {
            log_connection_error(peer, &err);
        }
    });
}

fn log_connection_error(peer: SocketAddr, err: &Error) {
    if is_transport_reset(err) {
        debug!(peer = %peer, error = ?err, "client connection reset");
    } else {
        warn!(peer = %peer, error = ?err, "client connection closed with error");
    }
}

/// True when the connection died underneath us rather than misbehaving.
fn is_transport_reset(err: &Error) -> bool {
    err.downcast_ref::<FrameError>()
        .is_some_and(|frame_err| !frame_err.is_malformed())
        || err.downcast_ref::<std::io::Error>().is_some()
}
