use std::sync::Arc;

use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::body::Body;
use crate::connector::Connector;
use crate::errors::{upstream_error, Error, Result};
use crate::modifier::{Modifier, ModifierChain};
use crate::request::{ProxyRequest, RequestState};
use crate::response;

/// Replace an existing `Content-Length` with a freshly computed one.
///
/// A message that never declared a length does not gain one here, so an
/// unframed body stays delimited the way it already was.
pub fn rewrite_content_length(headers: &mut HeaderMap, length: usize) {
  if headers.contains_key(CONTENT_LENGTH) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
  }
}

/// Drives a single proxied exchange, from parsing the client's request to the
/// last byte written back.
///
/// The handler only buffers what the [`ModifierChain`] claims: an unclaimed
/// response is pumped to the client as the upstream produces it.
#[derive(Clone)]
pub struct ProxyRequestHandler {
  chain: Arc<ModifierChain>,
  connector: Connector,
}

impl ProxyRequestHandler {
  /// Create a handler over a modifier chain, dialing upstreams with the given
  /// connector.
  pub fn new(chain: Arc<ModifierChain>, connector: Connector) -> Self {
    Self { chain, connector }
  }

  /// Read one request from the stream and answer it.
  ///
  /// On error the stream is left as-is; the caller decides whether a canned
  /// reply can still be written.
  pub async fn handle<S>(&self, stream: &mut S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut request = {
      let mut reader = BufReader::new(&mut *stream);
      ProxyRequest::read_from(&mut reader).await?
    };
    tracing::info!("{} {}", request.method(), request.target());
    match self.process(stream, &mut request).await {
      Ok(()) => {
        request.set_state(RequestState::Done);
        Ok(())
      }
      Err(e) => {
        request.set_state(RequestState::Failed);
        Err(e)
      }
    }
  }

  async fn process<S>(&self, client: &mut S, request: &mut ProxyRequest) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    // Host is defaulted from the parsed target before anything consults the
    // headers; a Host the client did send is left alone.
    if !request.headers().contains_key(HOST) {
      let host = HeaderValue::from_str(request.authority())?;
      request.headers_mut().insert(HOST, host);
    }
    if self.chain.will_modify_request(request) {
      request.set_state(RequestState::RequestModifying);
      let framed = request.headers().contains_key(CONTENT_LENGTH);
      self.chain.run_request_modifiers(request)?;
      if framed {
        let length = request.body().map(|b| b.len()).unwrap_or(0);
        rewrite_content_length(request.headers_mut(), length);
      } else if request.body().is_some() {
        // a body no length header frames would never be read by the peer
        *request.body_mut() = None;
      }
    }
    if let Some(server) = self.chain.server_for(request) {
      request.set_state(RequestState::SyntheticServe);
      return self.serve_response(client, request, server.as_ref()).await;
    }
    self.exchange(client, request).await
  }

  /// Answer the request straight from a modifier, with no upstream leg.
  async fn serve_response<S>(
    &self,
    client: &mut S,
    request: &mut ProxyRequest,
    server: &dyn Modifier,
  ) -> Result<()>
  where
    S: AsyncWrite + Unpin,
  {
    let body = server.get_response(request)?;
    if body.is_empty() {
      return Err(Error::Serving(request.target().clone()));
    }
    let mut headers = request.response_headers().clone();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    request.set_state(RequestState::Writing);
    let raw = response::to_raw(
      request.version(),
      request.response_status(),
      &headers,
      Some(&body),
    );
    client.write_all(&raw).await?;
    client.flush().await?;
    tracing::debug!("served {} bytes for {}", body.len(), request.uri());
    Ok(())
  }

  /// Relay the request upstream and bring the response back, buffering it
  /// only when a modifier claimed the response side.
  async fn exchange<S>(&self, client: &mut S, request: &mut ProxyRequest) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let buffering = self.chain.will_modify_response(request);
    request.set_state(RequestState::Dialing);
    let mut socket = self
      .connector
      .connect_with_host(request.host(), request.port())
      .await?;
    let raw = request.to_raw();
    socket
      .write_all(&raw)
      .await
      .map_err(|e| upstream_error(request.authority(), Error::IO(e)))?;
    socket
      .flush()
      .await
      .map_err(|e| upstream_error(request.authority(), Error::IO(e)))?;
    let mut reader = BufReader::new(socket);
    let head = response::read_head(&mut reader)
      .await
      .map_err(|e| upstream_error(request.authority(), e))?;
    let framing = head.body_framing(request.method());
    if !buffering {
      request.set_state(RequestState::ResponseStreaming);
      client.write_all(head.raw()).await?;
      response::relay_body(&mut reader, client, &framing, self.connector.read_timeout()).await?;
      // the upstream session ends with its response, there is no reuse
      let _ = reader.into_inner().shutdown().await;
      request.set_state(RequestState::Writing);
      client.flush().await?;
      return Ok(());
    }
    request.set_state(RequestState::ResponseBuffering);
    let bytes = response::read_body(&mut reader, &framing, self.connector.read_timeout())
      .await
      .map_err(|e| upstream_error(request.authority(), e))?;
    let _ = reader.into_inner().shutdown().await;
    let framed = head.headers().contains_key(CONTENT_LENGTH);
    *request.response_status_mut() = head.status_code();
    *request.response_headers_mut() = head.headers().clone();
    *request.response_body_mut() = if bytes.is_empty() {
      None
    } else {
      Some(Body::from(bytes))
    };
    request.set_state(RequestState::ResponseModifying);
    self.chain.run_response_modifiers(request)?;
    if framed {
      let length = request.response_body().map(|b| b.len()).unwrap_or(0);
      rewrite_content_length(request.response_headers_mut(), length);
    }
    request.set_state(RequestState::Writing);
    let raw = response::to_raw(
      head.version(),
      request.response_status(),
      request.response_headers(),
      request.response_body(),
    );
    client.write_all(&raw).await?;
    client.flush().await?;
    Ok(())
  }
}

impl std::fmt::Debug for ProxyRequestHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyRequestHandler")
      .field("chain", &self.chain)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  struct Canned;

  impl Modifier for Canned {
    fn will_serve_response(&self, request: &ProxyRequest) -> bool {
      request.uri().path() == "/canned"
    }
    fn get_response(&self, request: &mut ProxyRequest) -> Result<Body> {
      request.response_headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
      );
      Ok(Body::from("hello"))
    }
  }

  struct Hollow;

  impl Modifier for Hollow {
    fn will_serve_response(&self, _request: &ProxyRequest) -> bool {
      true
    }
  }

  fn handler_with(modifier: Arc<dyn Modifier>) -> ProxyRequestHandler {
    ProxyRequestHandler::new(
      Arc::new(ModifierChain::new(vec![modifier])),
      Connector::default(),
    )
  }

  #[tokio::test]
  async fn serves_without_an_upstream() {
    let handler = handler_with(Arc::new(Canned));
    let (mut client, mut proxy) = tokio::io::duplex(4096);
    client
      .write_all(b"GET http://example.com/canned HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    handler.handle(&mut proxy).await.unwrap();
    drop(proxy);
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8(reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(reply.contains("content-length: 5\r\n"));
    assert!(reply.contains("content-type: text/plain\r\n"));
    assert!(reply.ends_with("\r\n\r\nhello"));
  }

  #[tokio::test]
  async fn an_empty_served_body_is_an_error() {
    let handler = handler_with(Arc::new(Hollow));
    let (mut client, mut proxy) = tokio::io::duplex(4096);
    client
      .write_all(b"GET http://example.com/anything HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    let error = handler.handle(&mut proxy).await.unwrap_err();
    assert!(matches!(error, Error::Serving(_)));
    assert_eq!(
      error.canned_reply(),
      Some(&b"HTTP/1.1 500 Internal Server Error\r\n\r\n"[..])
    );
  }

  #[test]
  fn length_is_replaced_but_never_introduced() {
    let mut headers = HeaderMap::new();
    rewrite_content_length(&mut headers, 12);
    assert!(!headers.contains_key(CONTENT_LENGTH));
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4"));
    rewrite_content_length(&mut headers, 12);
    assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "12");
  }
}
