//! Placeholder parsing and substitution for deferred value resolution.
//!
//! Job steps are declared before any run exists, so values such as the image
//! tag are written as placeholders and resolved later. The same step renders
//! to a backend script (placeholders become shell variable references) or is
//! executed locally (placeholders become concrete values).
//!
//! # Placeholder Formats
//!
//! - `$${tag}` - the run's short revision tag
//! - `$${revision}` - the run's full source revision
//! - `$${var:NAME}` - a plain job variable
//! - `$${secret:NAME}` - a secret job variable (only ever an env reference)
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` and `$AWS_REGION` work naturally without any escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use deckhand_lib::placeholder::{parse, Segment, Placeholder};
//!
//! let segments = parse("deploy/$${tag}").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Literal("deploy/".to_string()),
//!     Segment::Placeholder(Placeholder::Tag),
//! ]);
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

/// Environment variable holding the short revision tag in rendered jobs.
pub const TAG_VAR: &str = "IMAGE_TAG";

/// Environment variable holding the full source revision in rendered jobs.
pub const REVISION_VAR: &str = "SOURCE_REVISION";

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  /// `$${tag}`
  Tag,

  /// `$${revision}`
  Revision,

  /// `$${var:NAME}`
  Var(String),

  /// `$${secret:NAME}`
  Secret(String),
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no placeholders)
  Literal(String),

  /// A placeholder to be resolved
  Placeholder(Placeholder),
}

/// Errors that can occur during placeholder parsing or resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("invalid variable name in placeholder: '{0}'")]
  InvalidName(String),

  #[error("unresolved variable: {0}")]
  UnresolvedVar(String),

  #[error("secret '{0}' cannot be inlined; reference it from a shell step instead")]
  SecretNotInlinable(String),
}

/// Trait for resolving placeholder values.
pub trait Resolver {
  fn resolve_tag(&self) -> Result<String, PlaceholderError>;

  fn resolve_revision(&self) -> Result<String, PlaceholderError>;

  fn resolve_var(&self, name: &str) -> Result<String, PlaceholderError>;

  fn resolve_secret(&self, name: &str) -> Result<String, PlaceholderError>;
}

/// Parse a string containing placeholders into segments.
///
/// # Errors
///
/// Returns an error if a placeholder is malformed (unclosed, unknown type, bad name).
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();

        match chars.peek() {
          Some((_, '$')) => {
            chars.next();

            match chars.peek() {
              Some((_, '{')) => {
                // Escaped: $$${ -> $${ (literal)
                literal.push_str("$${");
                chars.next();
              }
              _ => literal.push_str("$$$"),
            }
          }
          Some((_, '{')) => {
            chars.next();

            if !literal.is_empty() {
              segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut content = String::new();
            let mut found_close = false;

            for (_, c) in chars.by_ref() {
              if c == '}' {
                found_close = true;
                break;
              }
              content.push(c);
            }

            if !found_close {
              return Err(PlaceholderError::Unclosed(pos));
            }

            segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
          }
          _ => literal.push_str("$$"),
        }
      }
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  match content {
    "tag" => return Ok(Placeholder::Tag),
    "revision" => return Ok(Placeholder::Revision),
    _ => {}
  }

  let (kind, name) = content
    .split_once(':')
    .ok_or_else(|| PlaceholderError::Malformed(format!("missing colon in '{content}'")))?;

  match kind {
    "var" => Ok(Placeholder::Var(validate_name(name)?)),
    "secret" => Ok(Placeholder::Secret(validate_name(name)?)),
    _ => Err(PlaceholderError::UnknownType(kind.to_string())),
  }
}

fn validate_name(name: &str) -> Result<String, PlaceholderError> {
  if is_env_name(name) {
    Ok(name.to_string())
  } else {
    Err(PlaceholderError::InvalidName(name.to_string()))
  }
}

/// Whether `name` is usable as a shell environment variable name.
pub fn is_env_name(name: &str) -> bool {
  let mut chars = name.chars();
  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
    _ => return false,
  }
  chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// All placeholders referenced by `input`, in order of appearance.
pub fn references(input: &str) -> Result<Vec<Placeholder>, PlaceholderError> {
  Ok(
    parse(input)?
      .into_iter()
      .filter_map(|segment| match segment {
        Segment::Placeholder(p) => Some(p),
        Segment::Literal(_) => None,
      })
      .collect(),
  )
}

/// Substitute all placeholders in a string using the provided resolver.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

/// Substitute placeholders in pre-parsed segments.
pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(p) => {
        let value = match p {
          Placeholder::Tag => resolver.resolve_tag()?,
          Placeholder::Revision => resolver.resolve_revision()?,
          Placeholder::Var(name) => resolver.resolve_var(name)?,
          Placeholder::Secret(name) => resolver.resolve_secret(name)?,
        };
        result.push_str(&value);
      }
    }
  }

  Ok(result)
}

/// Resolves placeholders to shell variable references for rendered scripts.
///
/// Nothing is looked up: `$${tag}` becomes `${IMAGE_TAG}`, `$${var:X}` and
/// `$${secret:X}` become `${X}`. The backend supplies the values through the
/// job environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptResolver;

impl Resolver for ScriptResolver {
  fn resolve_tag(&self) -> Result<String, PlaceholderError> {
    Ok(format!("${{{TAG_VAR}}}"))
  }

  fn resolve_revision(&self) -> Result<String, PlaceholderError> {
    Ok(format!("${{{REVISION_VAR}}}"))
  }

  fn resolve_var(&self, name: &str) -> Result<String, PlaceholderError> {
    Ok(format!("${{{name}}}"))
  }

  fn resolve_secret(&self, name: &str) -> Result<String, PlaceholderError> {
    Ok(format!("${{{name}}}"))
  }
}

/// Resolves placeholders to concrete values for steps executed in-process.
///
/// Secrets are never inlined; they only exist in a child process environment.
pub struct RunResolver<'a> {
  tag: &'a str,
  revision: &'a str,
  vars: &'a BTreeMap<String, String>,
}

impl<'a> RunResolver<'a> {
  pub fn new(tag: &'a str, revision: &'a str, vars: &'a BTreeMap<String, String>) -> Self {
    Self { tag, revision, vars }
  }
}

impl Resolver for RunResolver<'_> {
  fn resolve_tag(&self) -> Result<String, PlaceholderError> {
    Ok(self.tag.to_string())
  }

  fn resolve_revision(&self) -> Result<String, PlaceholderError> {
    Ok(self.revision.to_string())
  }

  fn resolve_var(&self, name: &str) -> Result<String, PlaceholderError> {
    self
      .vars
      .get(name)
      .cloned()
      .ok_or_else(|| PlaceholderError::UnresolvedVar(name.to_string()))
  }

  fn resolve_secret(&self, name: &str) -> Result<String, PlaceholderError> {
    Err(PlaceholderError::SecretNotInlinable(name.to_string()))
  }
}
