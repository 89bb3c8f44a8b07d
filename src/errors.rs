//! engine error
use std::io::ErrorKind;
use std::num::ParseIntError;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `patchjack::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while intercepting a request.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// Broken startup input, fatal before the listener comes up
  #[error("config: {0}")]
  Config(String),
  /// A modifier claimed the request but produced nothing to serve
  #[error("nothing served a resource for {0}")]
  Serving(http::Uri),
  /// Upstream session failure, from dial to response head
  #[error("upstream {0}: {1}")]
  Connect(String, std::io::Error),
  /// Request target unusable for proxying
  #[error("malformed request target: {0}")]
  MalformedTarget(String),
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl Error {
  /// The bare reply a failed request is answered with, provided nothing has
  /// been written to the client yet. I/O failures get no reply at all, the
  /// connection just closes.
  pub(crate) fn canned_reply(&self) -> Option<&'static [u8]> {
    match self {
      Error::MalformedTarget(_) | Error::Http(_) | Error::IntError(_) => {
        Some(b"HTTP/1.1 400 Bad Request\r\n\r\n")
      }
      Error::Connect(_, _) => Some(b"HTTP/1.1 502 Bad Gateway\r\n\r\n"),
      Error::Serving(_) | Error::Config(_) => Some(b"HTTP/1.1 500 Internal Server Error\r\n\r\n"),
      Error::IO(_) => None,
    }
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

/// Reclassify a failure on the upstream leg as a gateway error.
pub(crate) fn upstream_error(target: &str, error: Error) -> Error {
  match error {
    Error::IO(e) => Error::Connect(target.to_string(), e),
    e => Error::Connect(
      target.to_string(),
      std::io::Error::new(ErrorKind::InvalidData, e.to_string()),
    ),
  }
}
