use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::response::parser_headers;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Proxied requests carry no scheme upstream, so a missing port means this.
const DEFAULT_HTTP_PORT: u16 = 80;
// caps on the inbound head, one line and the whole header block
const MAX_LINE: usize = 8192;
const MAX_HEADER_BLOCK: usize = 64 * 1024;
// cap on the body a request may declare, larger claims are refused
const MAX_BODY: usize = 64 * 1024 * 1024;

/// Where a request currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
  /// Request line, headers and any length-framed body are parsed
  Received,
  /// The request-side modifier pipeline is running
  RequestModifying,
  /// A modifier is fabricating the response, no upstream involved
  SyntheticServe,
  /// Connecting to the origin server
  Dialing,
  /// Relaying the upstream response verbatim
  ResponseStreaming,
  /// Accumulating the upstream body for the modifier pipeline
  ResponseBuffering,
  /// The response-side modifier pipeline is running
  ResponseModifying,
  /// Writing the final bytes to the client
  Writing,
  /// Finished, the connection is closing
  Done,
  /// Aborted, nothing further happens on this request
  Failed,
}

/// One intercepted request/response cycle.
///
/// The request side is parsed off the client connection. The response side
/// starts empty and is filled in either by a serving modifier or from the
/// upstream reply before the response pipeline runs, so modifiers mutate
/// both sides through the same value.
#[derive(Clone)]
pub struct ProxyRequest {
  method: Method,
  version: Version,
  /// absolute-form target as the client sent it
  target: Uri,
  /// origin-form uri forwarded upstream
  uri: Uri,
  host: String,
  port: u16,
  /// verbatim authority, kept for Host defaulting
  authority: String,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
  response_status: StatusCode,
  response_headers: HeaderMap<HeaderValue>,
  response_body: Option<Body>,
  state: RequestState,
}

impl Debug for ProxyRequest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyRequest")
      .field("method", &self.method)
      .field("target", &self.target)
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .field("state", &self.state)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for ProxyRequest
where
  T: Into<Body>,
{
  /// Assemble a request by hand from an absolute-form `http::Request`,
  /// defaulting whatever the uri does not carry.
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    let host = parts.uri.host().unwrap_or_default().to_string();
    let port = parts.uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT);
    let authority = parts
      .uri
      .authority()
      .map(|a| a.as_str().to_string())
      .unwrap_or_default();
    let uri = origin_form(&parts.uri);
    Self {
      method: parts.method,
      version: parts.version,
      target: parts.uri,
      uri,
      host,
      port,
      authority,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
      response_status: StatusCode::OK,
      response_headers: HeaderMap::new(),
      response_body: None,
      state: RequestState::Received,
    }
  }
}

impl ProxyRequest {
  /// Read one request head off the client, plus its body when a
  /// `Content-Length` header frames one. A request without that header keeps
  /// its body unread on the wire, whatever else happens to it.
  pub async fn read_from<T: AsyncRead + Unpin>(reader: &mut BufReader<T>) -> Result<ProxyRequest> {
    let (method, target, version) = read_request_line(reader).await?;
    let headers = read_headers(reader).await?;
    match target.scheme_str() {
      Some("http") => {}
      _ => return Err(Error::MalformedTarget(target.to_string())),
    }
    let authority = match target.authority() {
      Some(a) => a.as_str().to_string(),
      None => return Err(Error::MalformedTarget(target.to_string())),
    };
    let host = target.host().unwrap_or_default().to_string();
    let port = target.port_u16().unwrap_or(DEFAULT_HTTP_PORT);
    let uri = origin_form(&target);
    let body = read_body(reader, &headers).await?;
    Ok(ProxyRequest {
      method,
      version,
      target,
      uri,
      host,
      port,
      authority,
      headers,
      body,
      response_status: StatusCode::OK,
      response_headers: HeaderMap::new(),
      response_body: None,
      state: RequestState::Received,
    })
  }

  /// Serialize the origin-form wire image sent upstream.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    http_requests.extend(self.uri.path().as_bytes());
    if let Some(q) = self.uri.query() {
      http_requests.extend([63]);
      http_requests.extend(q.as_bytes());
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      http_requests.extend(http::header::HOST.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(self.authority.as_bytes());
      http_requests.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    if let Some(b) = self.body() {
      if !b.is_empty() {
        headers
          .entry(http::header::CONTENT_LENGTH)
          .or_insert(HeaderValue::from(b.len()));
      }
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_requests.extend(b.as_ref());
      }
    }
    Bytes::from(http_requests)
  }

  /// Returns the request method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Returns the request version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Returns the absolute-form target as received.
  #[inline]
  pub fn target(&self) -> &Uri {
    &self.target
  }
  /// Returns the origin-form uri forwarded upstream.
  #[inline]
  pub fn uri(&self) -> &Uri {
    &self.uri
  }
  /// Returns the upstream host, without port.
  #[inline]
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Returns the upstream port.
  #[inline]
  pub fn port(&self) -> u16 {
    self.port
  }
  /// Returns the authority exactly as the target carried it.
  #[inline]
  pub fn authority(&self) -> &str {
    &self.authority
  }
  /// Returns the request headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Returns a mutable reference to the request headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Returns the materialized request body, if one was length-framed.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Returns a mutable reference to the request body slot.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Returns the status the reply will carry.
  #[inline]
  pub fn response_status(&self) -> StatusCode {
    self.response_status
  }
  /// Returns a mutable reference to the reply status.
  #[inline]
  pub fn response_status_mut(&mut self) -> &mut StatusCode {
    &mut self.response_status
  }
  /// Returns the staged response headers.
  #[inline]
  pub fn response_headers(&self) -> &HeaderMap {
    &self.response_headers
  }
  /// Returns a mutable reference to the staged response headers.
  #[inline]
  pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.response_headers
  }
  /// Returns the staged response body.
  #[inline]
  pub fn response_body(&self) -> Option<&Body> {
    self.response_body.as_ref()
  }
  /// Returns a mutable reference to the staged response body slot.
  #[inline]
  pub fn response_body_mut(&mut self) -> &mut Option<Body> {
    &mut self.response_body
  }
  /// Returns where the request currently is in its cycle.
  #[inline]
  pub fn state(&self) -> RequestState {
    self.state
  }
  pub(crate) fn set_state(&mut self, state: RequestState) {
    tracing::trace!(from = ?self.state, to = ?state, uri = %self.uri, "request state");
    self.state = state;
  }
}

fn origin_form(target: &Uri) -> Uri {
  let pq = target
    .path_and_query()
    .map(|pq| pq.as_str())
    .filter(|pq| !pq.is_empty())
    .unwrap_or("/");
  Uri::try_from(pq).unwrap_or_else(|_| Uri::from_static("/"))
}

// read_until with a per-line cap, so a hostile client cannot grow the buffer
// without ever sending a newline
async fn read_limited_line<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
  buf: &mut Vec<u8>,
) -> Result<usize> {
  let length = (&mut *reader)
    .take(MAX_LINE as u64)
    .read_until(b'\n', buf)
    .await?;
  if length >= MAX_LINE && !buf.ends_with(b"\n") {
    return Err(new_io_error(ErrorKind::InvalidData, "request line too long"));
  }
  Ok(length)
}

async fn read_request_line<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
) -> Result<(Method, Uri, Version)> {
  let mut line = Vec::new();
  let length = read_limited_line(reader, &mut line).await?;
  if length == 0 {
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "connection closed before the request line",
    ));
  }
  let line = line.strip_suffix(CR_LF).unwrap_or(&line);
  let mut parts = line.splitn(3, |b| b == &b' ');
  let (m, t, v) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => return Err(new_io_error(ErrorKind::InvalidData, "invalid request line")),
  };
  let method = Method::from_bytes(m).map_err(|e| Error::Http(http::Error::from(e)))?;
  let target =
    Uri::try_from(t).map_err(|_| Error::MalformedTarget(String::from_utf8_lossy(t).to_string()))?;
  let version = match v {
    b"HTTP/0.9" => Version::HTTP_09,
    b"HTTP/1.0" => Version::HTTP_10,
    b"HTTP/1.1" => Version::HTTP_11,
    _ => {
      return Err(new_io_error(
        ErrorKind::InvalidData,
        "unsupported http version",
      ));
    }
  };
  Ok((method, target, version))
}

async fn read_headers<T: AsyncRead + Unpin>(reader: &mut BufReader<T>) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = 0;
  loop {
    let length = read_limited_line(reader, &mut header_line).await?;
    if length == 0 || header_line == b"\r\n" {
      break;
    }
    total += length;
    if total > MAX_HEADER_BLOCK {
      return Err(new_io_error(
        ErrorKind::InvalidData,
        "header block too large",
      ));
    }
    if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
      if headers.contains_key(&k) {
        headers.append(k, v);
      } else {
        headers.insert(k, v);
      }
    };
    header_line.clear();
  }
  Ok(headers)
}

async fn read_body<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
  headers: &HeaderMap,
) -> Result<Option<Body>> {
  let content_length = match headers.get(http::header::CONTENT_LENGTH) {
    None => return Ok(None),
    Some(value) => value
      .to_str()
      .map_err(|_| new_io_error(ErrorKind::InvalidData, "invalid content-length header"))?
      .trim()
      .parse::<usize>()?,
  };
  if content_length > MAX_BODY {
    return Err(new_io_error(ErrorKind::InvalidData, "request body too large"));
  }
  // the buffer grows with what actually arrives, not with the declared length
  let mut buf = Vec::new();
  (&mut *reader)
    .take(content_length as u64)
    .read_to_end(&mut buf)
    .await?;
  if buf.len() < content_length {
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "connection closed inside the request body",
    ));
  }
  Ok(Some(Body::from(buf)))
}
