//! End-to-end tests driving a bound proxy with raw sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use patchjack::{Body, Modifier, ModifierChain, ProxyRequest, ProxyServer, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Upstream {
  addr: SocketAddr,
  dials: Arc<AtomicUsize>,
  requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Upstream {
  fn dials(&self) -> usize {
    self.dials.load(Ordering::SeqCst)
  }
  fn last_request(&self) -> Vec<u8> {
    self.requests.lock().unwrap().last().cloned().unwrap_or_default()
  }
}

/// Accepts connections, records each request and answers with fixed bytes.
async fn spawn_upstream(response: &'static [u8]) -> Upstream {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let dials = Arc::new(AtomicUsize::new(0));
  let requests = Arc::new(Mutex::new(Vec::new()));
  let (dial_count, request_log) = (dials.clone(), requests.clone());
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = listener.accept().await else {
        break;
      };
      dial_count.fetch_add(1, Ordering::SeqCst);
      let request_log = request_log.clone();
      tokio::spawn(async move {
        let request = read_request(&mut stream).await;
        request_log.lock().unwrap().push(request);
        stream.write_all(response).await.ok();
        stream.shutdown().await.ok();
      });
    }
  });
  Upstream {
    addr,
    dials,
    requests,
  }
}

async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
  let mut buf = Vec::new();
  let mut byte = [0u8; 1];
  while !buf.ends_with(b"\r\n\r\n") {
    if stream.read_exact(&mut byte).await.is_err() {
      return buf;
    }
    buf.extend_from_slice(&byte);
  }
  let head = String::from_utf8_lossy(&buf).to_lowercase();
  let length = head
    .lines()
    .find_map(|line| line.strip_prefix("content-length:"))
    .and_then(|v| v.trim().parse::<usize>().ok())
    .unwrap_or(0);
  if length > 0 {
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.ok();
    buf.extend_from_slice(&body);
  }
  buf
}

async fn spawn_proxy(chain: ModifierChain) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(ProxyServer::new(chain).serve(listener));
  addr
}

async fn send_raw(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(request).await.unwrap();
  let mut reply = Vec::new();
  stream.read_to_end(&mut reply).await.unwrap();
  reply
}

struct BodyStamp;

impl Modifier for BodyStamp {
  fn will_modify_response(&self, request: &ProxyRequest) -> bool {
    request.uri().path().starts_with("/api")
  }
  fn modify_response(&self, request: &mut ProxyRequest) -> Result<()> {
    let text = match request.response_body() {
      Some(body) => String::from_utf8_lossy(body).replace("ok", "intercepted"),
      None => return Ok(()),
    };
    *request.response_body_mut() = Some(Body::from(text));
    Ok(())
  }
}

struct Redactor;

impl Modifier for Redactor {
  fn will_modify_request(&self, request: &ProxyRequest) -> bool {
    request.uri().path() == "/submit"
  }
  fn modify_request(&self, request: &mut ProxyRequest) -> Result<()> {
    let text = match request.body() {
      Some(body) => String::from_utf8_lossy(body).replace("secret", "REDACTED"),
      None => return Ok(()),
    };
    *request.body_mut() = Some(Body::from(text));
    Ok(())
  }
}

struct BodyPlanter;

impl Modifier for BodyPlanter {
  fn will_modify_request(&self, request: &ProxyRequest) -> bool {
    request.uri().path() == "/report"
  }
  fn modify_request(&self, request: &mut ProxyRequest) -> Result<()> {
    *request.body_mut() = Some(Body::from("planted"));
    Ok(())
  }
}

struct CountingServer {
  name: &'static str,
  hits: Arc<AtomicUsize>,
}

impl Modifier for CountingServer {
  fn will_serve_response(&self, request: &ProxyRequest) -> bool {
    request.uri().path() == "/res"
  }
  fn get_response(&self, _request: &mut ProxyRequest) -> Result<Body> {
    self.hits.fetch_add(1, Ordering::SeqCst);
    Ok(Body::from(self.name))
  }
}

struct Hollow;

impl Modifier for Hollow {
  fn will_serve_response(&self, _request: &ProxyRequest) -> bool {
    true
  }
}

/// Unclaimed exchanges reach the client byte-for-byte as the upstream sent
/// them, over exactly one upstream connection.
#[tokio::test]
async fn unclaimed_traffic_streams_through_untouched() {
  let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Keep: 1\r\n\r\nhello";
  let upstream = spawn_upstream(response).await;
  let proxy = spawn_proxy(ModifierChain::default()).await;
  let request = format!("GET http://{}/file HTTP/1.1\r\n\r\n", upstream.addr);
  let reply = send_raw(proxy, request.as_bytes()).await;
  assert_eq!(reply, response);
  assert_eq!(upstream.dials(), 1);
  let seen = String::from_utf8(upstream.last_request()).unwrap();
  assert!(seen.starts_with("GET /file HTTP/1.1\r\n"), "{seen:?}");
  assert!(seen.contains(&format!("host: {}\r\n", upstream.addr)));
}

/// A response with no framing header streams until the upstream closes.
#[tokio::test]
async fn unframed_bodies_stream_until_close() {
  let response: &[u8] = b"HTTP/1.1 200 OK\r\nServer: old-box\r\n\r\nstream me to the end";
  let upstream = spawn_upstream(response).await;
  let proxy = spawn_proxy(ModifierChain::default()).await;
  let request = format!("GET http://{}/dump HTTP/1.1\r\n\r\n", upstream.addr);
  let reply = send_raw(proxy, request.as_bytes()).await;
  assert_eq!(reply, response);
}

/// A claimed response is buffered, rewritten and its length recomputed.
#[tokio::test]
async fn claimed_responses_are_rewritten_with_fresh_length() {
  let upstream = spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
  let proxy = spawn_proxy(ModifierChain::new(vec![Arc::new(BodyStamp)])).await;
  let request = format!("GET http://{}/api/thing HTTP/1.1\r\n\r\n", upstream.addr);
  let reply = String::from_utf8(send_raw(proxy, request.as_bytes()).await).unwrap();
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply:?}");
  assert!(reply.contains("content-length: 11\r\n"), "{reply:?}");
  assert!(reply.ends_with("\r\n\r\nintercepted"), "{reply:?}");
  assert_eq!(upstream.dials(), 1);
}

/// A mutated response that never had Content-Length does not gain one.
#[tokio::test]
async fn mutated_unframed_responses_stay_unframed() {
  let upstream = spawn_upstream(b"HTTP/1.1 200 OK\r\n\r\nok").await;
  let proxy = spawn_proxy(ModifierChain::new(vec![Arc::new(BodyStamp)])).await;
  let request = format!("GET http://{}/api/thing HTTP/1.1\r\n\r\n", upstream.addr);
  let reply = String::from_utf8(send_raw(proxy, request.as_bytes()).await).unwrap();
  assert!(!reply.to_lowercase().contains("content-length"), "{reply:?}");
  assert!(reply.ends_with("\r\n\r\nintercepted"), "{reply:?}");
}

/// Request rewrites land upstream with a recomputed Content-Length.
#[tokio::test]
async fn request_rewrites_reach_the_upstream() {
  let upstream = spawn_upstream(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n").await;
  let proxy = spawn_proxy(ModifierChain::new(vec![Arc::new(Redactor)])).await;
  let request = format!(
    "POST http://{}/submit HTTP/1.1\r\nContent-Length: 9\r\n\r\nmy secret",
    upstream.addr
  );
  send_raw(proxy, request.as_bytes()).await;
  let seen = String::from_utf8(upstream.last_request()).unwrap();
  assert!(seen.starts_with("POST /submit HTTP/1.1\r\n"), "{seen:?}");
  assert!(seen.contains("content-length: 11\r\n"), "{seen:?}");
  assert!(seen.ends_with("\r\n\r\nmy REDACTED"), "{seen:?}");
}

/// A body a modifier plants on a request that never declared a length is
/// dropped before the relay, the upstream sees the bare head.
#[tokio::test]
async fn planted_bodies_on_lengthless_requests_are_dropped() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let log = seen.clone();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut request = read_request(&mut stream).await;
    // linger briefly for any stray body bytes before answering
    let mut byte = [0u8; 1];
    while let Ok(Ok(_)) =
      tokio::time::timeout(Duration::from_millis(100), stream.read_exact(&mut byte)).await
    {
      request.extend_from_slice(&byte);
    }
    *log.lock().unwrap() = request;
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
      .await
      .ok();
    stream.shutdown().await.ok();
  });
  let proxy = spawn_proxy(ModifierChain::new(vec![Arc::new(BodyPlanter)])).await;
  let request = format!("GET http://{addr}/report HTTP/1.1\r\n\r\n");
  let reply = send_raw(proxy, request.as_bytes()).await;
  assert!(reply.starts_with(b"HTTP/1.1 200 OK"), "{reply:?}");
  let seen = String::from_utf8(seen.lock().unwrap().clone()).unwrap();
  assert!(seen.starts_with("GET /report HTTP/1.1\r\n"), "{seen:?}");
  assert!(!seen.to_lowercase().contains("content-length"), "{seen:?}");
  assert!(seen.ends_with("\r\n\r\n"), "{seen:?}");
  assert!(!seen.contains("planted"), "{seen:?}");
}

/// A served request never touches the network.
#[tokio::test]
async fn synthetic_responses_never_dial() {
  let upstream = spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
  let hits = Arc::new(AtomicUsize::new(0));
  let server = CountingServer {
    name: "served",
    hits: hits.clone(),
  };
  let proxy = spawn_proxy(ModifierChain::new(vec![Arc::new(server)])).await;
  let request = format!("GET http://{}/res HTTP/1.1\r\n\r\n", upstream.addr);
  let reply = String::from_utf8(send_raw(proxy, request.as_bytes()).await).unwrap();
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply:?}");
  assert!(reply.contains("content-length: 6\r\n"), "{reply:?}");
  assert!(reply.ends_with("\r\n\r\nserved"), "{reply:?}");
  assert_eq!(hits.load(Ordering::SeqCst), 1);
  assert_eq!(upstream.dials(), 0);
}

/// When several modifiers claim the same request, the first one serves it.
#[tokio::test]
async fn the_first_claiming_server_wins() {
  let first_hits = Arc::new(AtomicUsize::new(0));
  let second_hits = Arc::new(AtomicUsize::new(0));
  let chain = ModifierChain::new(vec![
    Arc::new(CountingServer {
      name: "first",
      hits: first_hits.clone(),
    }),
    Arc::new(CountingServer {
      name: "second",
      hits: second_hits.clone(),
    }),
  ]);
  let proxy = spawn_proxy(chain).await;
  let reply = String::from_utf8(
    send_raw(proxy, b"GET http://example.com/res HTTP/1.1\r\n\r\n").await,
  )
  .unwrap();
  assert!(reply.ends_with("first"), "{reply:?}");
  assert_eq!(first_hits.load(Ordering::SeqCst), 1);
  assert_eq!(second_hits.load(Ordering::SeqCst), 0);
}

/// An unreachable upstream turns into a 502 for the client.
#[tokio::test]
async fn dead_upstreams_yield_a_502() {
  let proxy = spawn_proxy(ModifierChain::default()).await;
  let reply = send_raw(proxy, b"GET http://127.0.0.1:1/x HTTP/1.1\r\n\r\n").await;
  assert!(reply.starts_with(b"HTTP/1.1 502 Bad Gateway"));
}

/// Targets the proxy cannot relay are rejected with a 400.
#[tokio::test]
async fn unusable_targets_get_a_400() {
  let proxy = spawn_proxy(ModifierChain::default()).await;
  let reply = send_raw(proxy, b"GET https://example.com/ HTTP/1.1\r\n\r\n").await;
  assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request"));
  let reply = send_raw(proxy, b"GET /relative HTTP/1.1\r\n\r\n").await;
  assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request"));
}

/// A serving modifier with nothing to say is a 500, and the proxy keeps
/// accepting afterwards.
#[tokio::test]
async fn empty_synthetic_results_are_a_500() {
  let proxy = spawn_proxy(ModifierChain::new(vec![Arc::new(Hollow)])).await;
  let reply = send_raw(proxy, b"GET http://example.com/a HTTP/1.1\r\n\r\n").await;
  assert!(reply.starts_with(b"HTTP/1.1 500 Internal Server Error"));
  let reply = send_raw(proxy, b"GET http://example.com/b HTTP/1.1\r\n\r\n").await;
  assert!(reply.starts_with(b"HTTP/1.1 500 Internal Server Error"));
}
