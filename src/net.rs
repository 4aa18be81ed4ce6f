//! TCP plumbing: the delivery transport and the accept loops for node
//! and router servers.
//!
//! Envelopes are framed by the connection itself: the sender writes the
//! whole envelope and shuts the stream down, the receiver reads to EOF.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error_span, info, warn, Instrument};

use crate::{
    actor::StoreHandle,
    directory::NodeAddr,
    proto::Meeting,
    router::{Router, Transport},
};

/// Delivers envelopes over plain TCP, one connection per envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    async fn deliver(&self, addr: &NodeAddr, envelope: &str) -> Result<()> {
        let mut stream = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.write_all(envelope.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Accept loop for one participant node.
///
/// Each inbound connection carries exactly one envelope and is handled
/// on its own task; all merges funnel through the node's single-writer
/// [`StoreHandle`].
#[derive(Debug)]
pub struct NodeServer {
    listener: TcpListener,
    store: StoreHandle,
}

impl NodeServer {
    /// Binds the node server on `port` (0 picks a free port).
    pub async fn bind(store: StoreHandle, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind node server on port {port}"))?;
        info!(owner = %store.owner(), addr = %listener.local_addr()?, "node server listening");
        Ok(Self { listener, store })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until ctrl-c, then shuts the store actor
    /// down so the last merge is fully persisted before returning.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    async fn run_until(self, shutdown: impl Future<Output = io::Result<()>>) -> Result<()> {
        let store = self.store.clone();
        tokio::select! {
            res = self.run() => res,
            res = shutdown => {
                res.context("shutdown signal failed")?;
                info!("node server shutting down");
                store.shutdown().await?;
                Ok(())
            }
        }
    }

    /// Runs the accept loop forever.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("accept failed: {err:#}");
                    continue;
                }
            };
            let store = self.store.clone();
            let span = error_span!("conn", %peer);
            tokio::spawn(
                async move {
                    if let Err(err) = handle_envelope(stream, store).await {
                        warn!("connection failed: {err:#}");
                    }
                }
                .instrument(span),
            );
        }
    }
}

async fn handle_envelope(mut stream: TcpStream, store: StoreHandle) -> Result<()> {
    let mut payload = String::new();
    stream
        .read_to_string(&mut payload)
        .await
        .context("failed to read envelope")?;
    let meeting = match Meeting::decode(&payload) {
        Ok(meeting) => meeting,
        Err(err) => {
            // Dropped, never partially applied, never retried.
            warn!("dropping undecodable envelope: {err}");
            return Ok(());
        }
    };
    let id = meeting.id;
    let outcome = store.merge(meeting).await?;
    debug!(id = %id.fmt_short(), %outcome, "handled envelope");
    Ok(())
}

/// Accept loop for the central router: takes submissions from
/// originating clients and fans them out.
#[derive(Debug)]
pub struct RouterServer<T> {
    listener: TcpListener,
    router: Arc<Router<T>>,
}

impl<T: Transport> RouterServer<T> {
    /// Binds the router server on `port` (0 picks a free port).
    pub async fn bind(router: Router<T>, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind router server on port {port}"))?;
        info!(addr = %listener.local_addr()?, "router server listening");
        Ok(Self {
            listener,
            router: Arc::new(router),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until ctrl-c.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    async fn run_until(self, shutdown: impl Future<Output = io::Result<()>>) -> Result<()> {
        tokio::select! {
            res = self.run() => res,
            res = shutdown => {
                res.context("shutdown signal failed")?;
                info!("router server shutting down");
                Ok(())
            }
        }
    }

    /// Runs the accept loop forever.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("accept failed: {err:#}");
                    continue;
                }
            };
            let router = self.router.clone();
            let span = error_span!("submission", %peer);
            tokio::spawn(
                async move {
                    if let Err(err) = handle_submission(stream, router).await {
                        warn!("submission failed: {err:#}");
                    }
                }
                .instrument(span),
            );
        }
    }
}

async fn handle_submission<T: Transport>(
    mut stream: TcpStream,
    router: Arc<Router<T>>,
) -> Result<()> {
    let mut payload = String::new();
    stream
        .read_to_string(&mut payload)
        .await
        .context("failed to read submission")?;
    let delivery = router.submit(&payload).await?;
    debug!(
        sent = delivery.sent.len(),
        failed = delivery.failed.len(),
        "fanned out envelope"
    );
    Ok(())
}
