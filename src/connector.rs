use crate::errors::{Error, Result};
use crate::socket::Socket;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket};

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: false,
    }
  }
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `false`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Enables a read timeout.
  ///
  /// The timeout applies to each read operation, and resets after a
  /// successful read. This is more appropriate for detecting stalled
  /// connections when the size isn't known beforehand.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout.
  ///
  /// The timeout applies to each write operation, and resets after a
  /// successful write.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase of an upstream session.
  ///
  /// Default is 10 seconds.
  ///
  /// # Note
  ///
  /// This **requires** the futures be executed in a tokio runtime with
  /// a tokio timer enabled.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Combine the configuration of this builder into a `Connector`.
  pub fn build(&self) -> Connector {
    Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
    }
  }
}

/// Connector
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl Connector {
  pub(crate) fn read_timeout(&self) -> Option<Duration> {
    self.read_timeout
  }
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| crate::errors::new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(s, self.write_timeout))
  }
  /// Resolve `host:port` and connect to the first address that accepts.
  ///
  /// Every failure on this leg comes back as a gateway error carrying the
  /// target, resolution included.
  pub async fn connect_with_host(&self, host: &str, port: u16) -> Result<Socket> {
    let target = format!("{}:{}", host, port);
    let addrs = lookup_host(target.as_str())
      .await
      .map_err(|e| Error::Connect(target.clone(), e))?;
    let mut last_err = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(Error::IO(e)) => last_err = Some(e),
        Err(e) => return Err(e),
      }
    }
    let e = last_err
      .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"));
    Err(Error::Connect(target, e))
  }
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default().build()
  }
}
