use std::collections::HashMap;
use std::fs;
use std::iter::Peekable;
use std::path::Path;
use std::str::Chars;

use crate::errors::{Error, Result};

/// Escape a fragment for inclusion in XML text.
///
/// `&` goes first so the entities it introduces survive the other passes.
pub fn xml_escape(text: &str) -> String {
  text
    .replace('&', "&amp;")
    .replace('<', "&lt;")
    .replace('>', "&gt;")
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
  Literal(String),
  Placeholder(String),
}

/// A `$name`-style text template.
///
/// Placeholders are written `$name` or `${name}`, with `$$` for a literal
/// dollar. Parsing rejects a dangling or malformed `$`, so a broken template
/// file fails at startup instead of in the middle of an exchange.
#[derive(Debug, Clone)]
pub struct Template {
  segments: Vec<Segment>,
}

impl Template {
  /// Parse template text into literal and placeholder segments.
  pub fn parse(text: &str) -> Result<Template> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
      if c != '$' {
        literal.push(c);
        continue;
      }
      match chars.peek() {
        Some('$') => {
          chars.next();
          literal.push('$');
        }
        Some('{') => {
          chars.next();
          let mut name = String::new();
          let mut closed = false;
          for c in chars.by_ref() {
            if c == '}' {
              closed = true;
              break;
            }
            name.push(c);
          }
          if !closed {
            return Err(Error::Config(format!("unclosed placeholder ${{{}", name)));
          }
          if !is_placeholder_name(&name) {
            return Err(Error::Config(format!("bad placeholder name {:?}", name)));
          }
          if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
          }
          segments.push(Segment::Placeholder(name));
        }
        _ => {
          let name = scan_name(&mut chars);
          if name.is_empty() {
            return Err(Error::Config("dangling $ in template".to_string()));
          }
          if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
          }
          segments.push(Segment::Placeholder(name));
        }
      }
    }
    if !literal.is_empty() {
      segments.push(Segment::Literal(literal));
    }
    Ok(Template { segments })
  }

  /// Render the template, filling every placeholder from `fields`.
  pub fn substitute(&self, fields: &HashMap<&str, String>) -> Result<String> {
    let mut out = String::new();
    for segment in &self.segments {
      match segment {
        Segment::Literal(text) => out.push_str(text),
        Segment::Placeholder(name) => match fields.get(name.as_str()) {
          Some(value) => out.push_str(value),
          None => return Err(Error::Config(format!("no value for placeholder ${}", name))),
        },
      }
    }
    Ok(out)
  }
}

fn scan_name(chars: &mut Peekable<Chars<'_>>) -> String {
  let mut name = String::new();
  while let Some(&c) = chars.peek() {
    let ok = if name.is_empty() {
      c.is_ascii_alphabetic() || c == '_'
    } else {
      c.is_ascii_alphanumeric() || c == '_'
    };
    if !ok {
      break;
    }
    name.push(c);
    chars.next();
  }
  name
}

fn is_placeholder_name(name: &str) -> bool {
  let mut chars = name.chars();
  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
    _ => return false,
  }
  chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The XML fragment templates the update forger renders.
///
/// One file per fragment, loaded eagerly so a missing or malformed file
/// fails at startup.
#[derive(Debug, Clone)]
pub struct TemplateSet {
  pub(crate) sync_updates_result: Template,
  pub(crate) install: Template,
  pub(crate) bundle: Template,
  pub(crate) bundle_extended_1: Template,
  pub(crate) install_extended_1: Template,
  pub(crate) bundle_extended_2: Template,
  pub(crate) install_extended_2: Template,
}

impl TemplateSet {
  /// Load every fragment template from a directory.
  pub fn load<P: AsRef<Path>>(dir: P) -> Result<TemplateSet> {
    let dir = dir.as_ref();
    Ok(TemplateSet {
      sync_updates_result: load_template(dir, "SyncUpdatesResult.xml")?,
      install: load_template(dir, "install_xml.xml")?,
      bundle: load_template(dir, "bundle_xml.xml")?,
      bundle_extended_1: load_template(dir, "bundle_extended_xml1.xml")?,
      install_extended_1: load_template(dir, "install_extended_xml1.xml")?,
      bundle_extended_2: load_template(dir, "bundle_extended_xml2.xml")?,
      install_extended_2: load_template(dir, "install_extended_xml2.xml")?,
    })
  }
}

fn load_template(dir: &Path, name: &str) -> Result<Template> {
  let path = dir.join(name);
  let text = fs::read_to_string(&path)
    .map_err(|e| Error::Config(format!("template {}: {}", path.display(), e)))?;
  Template::parse(&text).map_err(|e| match e {
    Error::Config(msg) => Error::Config(format!("template {}: {}", path.display(), msg)),
    e => e,
  })
}
