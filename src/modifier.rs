use std::sync::Arc;

use crate::body::Body;
use crate::errors::Result;
use crate::request::ProxyRequest;

/// Trait for rewriting proxied requests and responses, or serving responses
/// without an upstream exchange.
///
/// Every method has a no-op default, so an implementation only overrides the
/// sides it cares about. The `will_*` predicates are consulted before any
/// buffering happens: a request or response body is only held in memory when
/// at least one modifier claims that side, otherwise the bytes are streamed
/// through untouched.
pub trait Modifier: Send + Sync {
  /// Whether this modifier wants to rewrite the given request.
  fn will_modify_request(&self, _request: &ProxyRequest) -> bool {
    false
  }
  /// Rewrite the request in place before it is sent upstream.
  fn modify_request(&self, _request: &mut ProxyRequest) -> Result<()> {
    Ok(())
  }
  /// Whether this modifier wants to rewrite the response to the given request.
  ///
  /// Called before the upstream connection is opened, so the decision can only
  /// look at the request side.
  fn will_modify_response(&self, _request: &ProxyRequest) -> bool {
    false
  }
  /// Rewrite the buffered response in place before it is written back.
  fn modify_response(&self, _request: &mut ProxyRequest) -> Result<()> {
    Ok(())
  }
  /// Whether this modifier wants to answer the request itself, with no
  /// upstream connection at all.
  fn will_serve_response(&self, _request: &ProxyRequest) -> bool {
    false
  }
  /// Produce the body of a served response.
  ///
  /// Only called when [`will_serve_response`](Modifier::will_serve_response)
  /// returned `true`. Status and headers are taken from the request's response
  /// fields, which the implementation may adjust here. An empty body is an
  /// error: a modifier that claims a request must have something to say.
  fn get_response(&self, _request: &mut ProxyRequest) -> Result<Body> {
    Ok(Body::default())
  }
}

/// An ordered pipeline of [`Modifier`]s.
///
/// Modifiers run in registration order, each seeing the edits of the ones
/// before it; when two rewrite the same bytes, the later one wins. For
/// serving, the first modifier that claims the request wins.
#[derive(Clone, Default)]
pub struct ModifierChain {
  modifiers: Vec<Arc<dyn Modifier>>,
}

impl ModifierChain {
  /// Create a chain from modifiers in pipeline order.
  pub fn new(modifiers: Vec<Arc<dyn Modifier>>) -> Self {
    Self { modifiers }
  }
  /// Append a modifier to the end of the pipeline.
  pub fn push(&mut self, modifier: Arc<dyn Modifier>) {
    self.modifiers.push(modifier);
  }
  /// Whether the chain has no modifiers at all.
  pub fn is_empty(&self) -> bool {
    self.modifiers.is_empty()
  }
  /// Number of modifiers in the chain.
  pub fn len(&self) -> usize {
    self.modifiers.len()
  }
  /// Whether any modifier claims the request side.
  pub fn will_modify_request(&self, request: &ProxyRequest) -> bool {
    self.modifiers.iter().any(|m| m.will_modify_request(request))
  }
  /// Whether any modifier claims the response side.
  pub fn will_modify_response(&self, request: &ProxyRequest) -> bool {
    self
      .modifiers
      .iter()
      .any(|m| m.will_modify_response(request))
  }
  /// The first modifier that wants to serve this request, if any.
  pub fn server_for(&self, request: &ProxyRequest) -> Option<&Arc<dyn Modifier>> {
    self.modifiers.iter().find(|m| m.will_serve_response(request))
  }
  /// Run every claiming modifier's request rewrite, in order.
  pub fn run_request_modifiers(&self, request: &mut ProxyRequest) -> Result<()> {
    for (index, modifier) in self.modifiers.iter().enumerate() {
      if modifier.will_modify_request(request) {
        tracing::debug!("modifier {} rewriting request {}", index, request.uri());
        modifier.modify_request(request)?;
      }
    }
    Ok(())
  }
  /// Run every claiming modifier's response rewrite, in order.
  pub fn run_response_modifiers(&self, request: &mut ProxyRequest) -> Result<()> {
    for (index, modifier) in self.modifiers.iter().enumerate() {
      if modifier.will_modify_response(request) {
        tracing::debug!("modifier {} rewriting response for {}", index, request.uri());
        modifier.modify_response(request)?;
      }
    }
    Ok(())
  }
}

impl std::fmt::Debug for ModifierChain {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModifierChain")
      .field("len", &self.modifiers.len())
      .finish()
  }
}
