use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::connector::Connector;
use crate::errors::Result;
use crate::handler::ProxyRequestHandler;
use crate::modifier::ModifierChain;

/// An intercepting proxy for plain HTTP clients.
///
/// Each accepted connection carries a single request: the proxy answers it
/// and closes. The [`Modifier`](crate::Modifier)s registered on the chain
/// decide which exchanges get rewritten or served locally; everything else is
/// relayed untouched.
#[derive(Clone, Debug)]
pub struct ProxyServer {
  handler: ProxyRequestHandler,
}

impl ProxyServer {
  /// Create a server over the given modifier chain with default connector
  /// settings.
  pub fn new(chain: ModifierChain) -> Self {
    Self::with_connector(chain, Connector::default())
  }

  /// Create a server that dials upstreams with an explicitly configured
  /// connector.
  pub fn with_connector(chain: ModifierChain, connector: Connector) -> Self {
    Self {
      handler: ProxyRequestHandler::new(Arc::new(chain), connector),
    }
  }

  /// Bind the address and serve until the task is dropped.
  pub async fn run<A: ToSocketAddrs>(self, addr: A) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    self.serve(listener).await
  }

  /// Serve connections from an already-bound listener.
  pub async fn serve(self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let handler = self.handler.clone();
          tokio::spawn(async move {
            if let Err(e) = Self::handle_connection(stream, peer_addr, handler).await {
              tracing::error!("error handling connection from {}: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
        }
      }
    }
  }

  async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: ProxyRequestHandler,
  ) -> Result<()> {
    tracing::debug!("connection from {}", peer_addr);
    let outcome = handler.handle(&mut stream).await;
    if let Err(e) = &outcome {
      if let Some(reply) = e.canned_reply() {
        let _ = stream.write_all(reply).await;
      }
    }
    let _ = stream.shutdown().await;
    outcome
  }
}
