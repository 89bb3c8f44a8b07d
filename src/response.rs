use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// The parsed upstream response head, kept alongside the raw bytes it came
/// from so an unmodified response can be relayed verbatim.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
  version: Version,
  status_code: StatusCode,
  headers: HeaderMap,
  raw: Bytes,
}

/// How the upstream intends to end its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BodyFraming {
  /// No body follows the head
  None,
  /// A `Content-Length` counts the body down
  Length(u64),
  /// The body runs until the upstream closes
  Eof,
}

impl ResponseHead {
  #[inline]
  pub(crate) fn version(&self) -> Version {
    self.version
  }
  #[inline]
  pub(crate) fn status_code(&self) -> StatusCode {
    self.status_code
  }
  #[inline]
  pub(crate) fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// The head exactly as the upstream sent it, blank line included.
  #[inline]
  pub(crate) fn raw(&self) -> &Bytes {
    &self.raw
  }
  pub(crate) fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }
  pub(crate) fn body_framing(&self, method: &Method) -> BodyFraming {
    if matches!(*method, Method::HEAD) {
      return BodyFraming::None;
    }
    match self.content_length() {
      Some(0) => BodyFraming::None,
      Some(n) => BodyFraming::Length(n),
      None => BodyFraming::Eof,
    }
  }
}

/// Read a response head, retaining every byte for verbatim relay.
pub(crate) async fn read_head<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
) -> Result<ResponseHead> {
  let mut raw = Vec::new();
  let mut line = Vec::new();
  let length = reader.read_until(b'\n', &mut line).await?;
  if length == 0 {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "connection closed before the status line",
    ));
  }
  let (version, status_code) = parser_status_line(&line)?;
  raw.extend_from_slice(&line);
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    let length = reader.read_until(b'\n', &mut header_line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside the response head",
      ));
    }
    raw.extend_from_slice(&header_line);
    if header_line == b"\r\n" {
      break;
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
  Ok(ResponseHead {
    version,
    status_code,
    headers,
    raw: Bytes::from(raw),
  })
}

/// Drain the body into memory according to its framing.
///
/// A read timeout ends the body quietly rather than failing the request,
/// whatever has arrived by then is what there is.
pub(crate) async fn read_body<T: AsyncRead + Unpin>(
  reader: &mut BufReader<T>,
  framing: &BodyFraming,
  timeout: Option<Duration>,
) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  let limit = match framing {
    BodyFraming::None => return Ok(body),
    BodyFraming::Length(n) => Some(*n),
    BodyFraming::Eof => None,
  };
  let mut buffer = vec![0; 8192];
  let mut total_bytes_read = 0;
  loop {
    // never read past the declared length, surplus bytes stay on the socket
    let window = match limit {
      Some(limit) => std::cmp::min(limit as usize - total_bytes_read, buffer.len()),
      None => buffer.len(),
    };
    if window == 0 {
      break;
    }
    let size = if let Some(to) = timeout {
      match tokio::time::timeout(to, reader.read(&mut buffer[..window])).await {
        Ok(size) => size,
        Err(_) => break,
      }
    } else {
      reader.read(&mut buffer[..window]).await
    };
    match size {
      Ok(0) => break,
      Ok(n) => {
        body.extend_from_slice(&buffer[..n]);
        total_bytes_read += n;
      }
      Err(_err) => break,
    }
  }
  Ok(body)
}

/// Pump the body from the upstream to the client without holding it.
///
/// Returns the number of bytes relayed. Ends quietly on a read timeout,
/// like [`read_body`].
pub(crate) async fn relay_body<T, W>(
  reader: &mut BufReader<T>,
  writer: &mut W,
  framing: &BodyFraming,
  timeout: Option<Duration>,
) -> Result<u64>
where
  T: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let limit = match framing {
    BodyFraming::None => return Ok(0),
    BodyFraming::Length(n) => Some(*n),
    BodyFraming::Eof => None,
  };
  let mut buffer = vec![0; 8192];
  let mut total_bytes_read = 0u64;
  loop {
    let window = match limit {
      Some(limit) => std::cmp::min(limit - total_bytes_read, buffer.len() as u64) as usize,
      None => buffer.len(),
    };
    if window == 0 {
      break;
    }
    let size = if let Some(to) = timeout {
      match tokio::time::timeout(to, reader.read(&mut buffer[..window])).await {
        Ok(size) => size,
        Err(_) => break,
      }
    } else {
      reader.read(&mut buffer[..window]).await
    };
    match size {
      Ok(0) => break,
      Ok(n) => {
        writer.write_all(&buffer[..n]).await?;
        total_bytes_read += n as u64;
      }
      Err(_err) => break,
    }
  }
  Ok(total_bytes_read)
}

/// Serialize a response head and body for the client.
pub(crate) fn to_raw(
  version: Version,
  status_code: StatusCode,
  headers: &HeaderMap,
  body: Option<&Body>,
) -> Bytes {
  let mut http_response = Vec::new();
  http_response.extend(format!("{:?}", version).as_bytes());
  http_response.extend(SPACE);
  http_response.extend(format!("{}", status_code).as_bytes());
  http_response.extend(CR_LF);
  for (k, v) in headers.iter() {
    http_response.extend(k.as_str().as_bytes());
    http_response.extend(COLON_SPACE);
    http_response.extend(v.as_bytes());
    http_response.extend(CR_LF);
  }
  http_response.extend(CR_LF);
  if let Some(b) = body {
    if !b.is_empty() {
      http_response.extend(b.as_ref());
    }
  }
  Bytes::from(http_response)
}

fn parser_status_line(lines: &[u8]) -> Result<(Version, StatusCode)> {
  let (mut vf, mut sf) = (false, false);
  let lines = lines.strip_suffix(CR_LF).unwrap_or(lines);
  let mut version = Version::default();
  let mut sc = StatusCode::default();
  for (index, vc) in lines.splitn(3, |b| b == &b' ').enumerate() {
    if vc.is_empty() {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "invalid http version and status_code data",
      ));
    }
    match index {
      0 => {
        version = match vc {
          b"HTTP/0.9" => Version::HTTP_09,
          b"HTTP/1.0" => Version::HTTP_10,
          b"HTTP/1.1" => Version::HTTP_11,
          b"HTTP/2.0" => Version::HTTP_2,
          b"HTTP/3.0" => Version::HTTP_3,
          _ => {
            return Err(new_io_error(
              std::io::ErrorKind::InvalidData,
              "invalid http version",
            ));
          }
        };
        vf = true;
      }
      1 => {
        sc = StatusCode::try_from(vc).map_err(|x| Error::Http(http::Error::from(x)))?;
        sf = true;
      }
      _ => {}
    }
  }
  if !(vf && sf) {
    return Err(new_io_error(
      std::io::ErrorKind::InvalidData,
      "invalid http version and status_code data",
    ));
  }
  Ok((version, sc))
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &58).enumerate() {
    let h = h.strip_prefix(SPACE).unwrap_or(h);
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}
