use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::errors::{Error, Result};

/// One entry from the payload registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSpec {
  payload: String,
  args: String,
  title: String,
  description: String,
}

impl PayloadSpec {
  /// File name of the executable under the payload directory.
  pub fn payload(&self) -> &str {
    &self.payload
  }
  /// Command line handed to the executable when it runs.
  pub fn args(&self) -> &str {
    &self.args
  }
  /// Update title shown in the client's update UI.
  pub fn title(&self) -> &str {
    &self.title
  }
  /// Update description shown in the client's update UI.
  pub fn description(&self) -> &str {
    &self.description
  }
}

/// The ini-style payload registry.
///
/// Sections name payloads; each section must carry exactly the keys
/// `payload`, `args`, `title` and `description`.
#[derive(Debug, Clone, Default)]
pub struct PayloadRegistry {
  sections: HashMap<String, HashMap<String, String>>,
}

impl PayloadRegistry {
  /// Read and parse a registry file.
  pub fn load<P: AsRef<Path>>(path: P) -> Result<PayloadRegistry> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("registry {}: {}", path.display(), e)))?;
    Self::parse(&text).map_err(|e| match e {
      Error::Config(msg) => Error::Config(format!("registry {}: {}", path.display(), msg)),
      e => e,
    })
  }

  /// Parse registry text.
  ///
  /// Blank lines and lines starting with `;` or `#` are skipped. Keys are
  /// case-insensitive; values keep their case and are trimmed.
  pub fn parse(text: &str) -> Result<PayloadRegistry> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;
    for (index, line) in text.lines().enumerate() {
      let line = line.trim();
      if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
        continue;
      }
      if let Some(header) = line.strip_prefix('[') {
        let name = header.strip_suffix(']').ok_or_else(|| {
          Error::Config(format!("line {}: unterminated section header", index + 1))
        })?;
        let name = name.trim().to_string();
        if name.is_empty() {
          return Err(Error::Config(format!("line {}: empty section name", index + 1)));
        }
        sections.entry(name.clone()).or_default();
        current = Some(name);
        continue;
      }
      let at = line
        .find(|c: char| c == '=' || c == ':')
        .ok_or_else(|| Error::Config(format!("line {}: expected key = value", index + 1)))?;
      let key = line[..at].trim().to_ascii_lowercase();
      let value = line[at + 1..].trim().to_string();
      if key.is_empty() {
        return Err(Error::Config(format!("line {}: empty key", index + 1)));
      }
      let section = current.clone().ok_or_else(|| {
        Error::Config(format!("line {}: entry before any [section]", index + 1))
      })?;
      sections.entry(section).or_default().insert(key, value);
    }
    Ok(PayloadRegistry { sections })
  }

  /// Look up a payload by section name.
  ///
  /// Every field is required, and keys outside the known set are rejected so
  /// a typo doesn't silently drop a field.
  pub fn payload(&self, name: &str) -> Result<PayloadSpec> {
    let section = self
      .sections
      .get(name)
      .ok_or_else(|| Error::Config(format!("no payload named {:?} in the registry", name)))?;
    for key in section.keys() {
      if !matches!(key.as_str(), "payload" | "args" | "title" | "description") {
        return Err(Error::Config(format!(
          "payload {:?}: unknown key {:?}",
          name, key
        )));
      }
    }
    let field = |key: &str| {
      section
        .get(key)
        .cloned()
        .ok_or_else(|| Error::Config(format!("payload {:?}: missing key {:?}", name, key)))
    };
    Ok(PayloadSpec {
      payload: field("payload")?,
      args: field("args")?,
      title: field("title")?,
      description: field("description")?,
    })
  }

  /// Names of every payload in the registry, sorted.
  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.sections.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const REGISTRY: &str = r#"
; sample registry
[psexec]
payload = PsExec.exe
args = -accepteula \\target cmd.exe
title = Security Update for Windows
description = Install this update to resolve issues.

[calc]
payload = calc.exe
# inline section comment
args =
title = Calculator Update
description = Totally legitimate.
"#;

  #[test]
  fn a_full_registry_parses() -> Result<()> {
    let registry = PayloadRegistry::parse(REGISTRY)?;
    let spec = registry.payload("psexec")?;
    assert_eq!(spec.payload(), "PsExec.exe");
    assert_eq!(spec.args(), r"-accepteula \\target cmd.exe");
    assert_eq!(spec.title(), "Security Update for Windows");
    assert_eq!(spec.description(), "Install this update to resolve issues.");
    let spec = registry.payload("calc")?;
    assert_eq!(spec.args(), "");
    assert_eq!(registry.names(), vec!["calc", "psexec"]);
    Ok(())
  }

  #[test]
  fn keys_are_case_insensitive() -> Result<()> {
    let registry = PayloadRegistry::parse(
      "[a]\nPayload: a.exe\nARGS: x\nTitle: t\nDescription: d\n",
    )?;
    assert_eq!(registry.payload("a")?.payload(), "a.exe");
    Ok(())
  }

  #[test]
  fn missing_keys_are_rejected() {
    let registry = PayloadRegistry::parse("[a]\npayload = a.exe\n").unwrap();
    let error = registry.payload("a").unwrap_err();
    assert!(error.to_string().contains("missing key"));
  }

  #[test]
  fn unknown_keys_are_rejected() {
    let registry = PayloadRegistry::parse(
      "[a]\npayload = a.exe\nargs =\ntitle = t\ndescription = d\nextra = x\n",
    )
    .unwrap();
    let error = registry.payload("a").unwrap_err();
    assert!(error.to_string().contains("unknown key"));
  }

  #[test]
  fn unknown_payload_is_an_error() {
    let registry = PayloadRegistry::parse(REGISTRY).unwrap();
    assert!(registry.payload("missing").is_err());
  }

  #[test]
  fn bad_lines_carry_their_line_number() {
    let error = PayloadRegistry::parse("[a]\npayload = a.exe\nnonsense\n").unwrap_err();
    assert!(error.to_string().contains("line 3"));
    let error = PayloadRegistry::parse("orphan = 1\n").unwrap_err();
    assert!(error.to_string().contains("before any [section]"));
    let error = PayloadRegistry::parse("[broken\n").unwrap_err();
    assert!(error.to_string().contains("unterminated"));
  }
}
