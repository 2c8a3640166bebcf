//! Placeholders in recipe commands.
//!
//! A recipe cannot know where the sandbox will put its inputs and outputs,
//! so its builder, arguments and environment values name them indirectly:
//!
//! - `$${out}`: the first declared output
//! - `$${out:<slot>}`: the output slot `<slot>`
//! - `$${input:<alias>}`: the input bound to `<alias>`
//!
//! A single `$` is never special, so shell variables such as `$out` or
//! `$HOME` reach the builder untouched. `$$${` stands for a literal `$${`.
//!
//! ```
//! use kiln_lib::placeholder::{parse, Placeholder, Segment};
//!
//! let segments = parse("$${input:src}/configure --prefix=$HOME").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Input("src".to_string())),
//!     Segment::Literal("/configure --prefix=$HOME".to_string()),
//! ]);
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const OPEN: &str = "$${";
const CLOSE: char = '}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  /// An output slot; `None` is the first declared one.
  Output(Option<String>),
  Input(String),
}

impl fmt::Display for Placeholder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Placeholder::Output(None) => write!(f, "{}out{}", OPEN, CLOSE),
      Placeholder::Output(Some(slot)) => write!(f, "{}out:{}{}", OPEN, slot, CLOSE),
      Placeholder::Input(alias) => write!(f, "{}input:{}{}", OPEN, alias, CLOSE),
    }
  }
}

impl FromStr for Placeholder {
  type Err = PlaceholderError;

  /// Parse the text between the braces.
  fn from_str(body: &str) -> Result<Self, Self::Err> {
    if body == "out" {
      return Ok(Placeholder::Output(None));
    }
    let Some((kind, name)) = body.split_once(':') else {
      return Err(PlaceholderError::Malformed(body.to_string()));
    };
    if name.is_empty() {
      return Err(PlaceholderError::Malformed(body.to_string()));
    }
    match kind {
      "out" => Ok(Placeholder::Output(Some(name.to_string()))),
      "input" => Ok(Placeholder::Input(name.to_string())),
      other => Err(PlaceholderError::UnknownType(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  /// Byte offset of the opening `$${`.
  #[error("placeholder at byte {0} is never closed")]
  Unclosed(usize),

  #[error("unknown placeholder kind '{0}' (expected 'out' or 'input')")]
  UnknownType(String),

  #[error("malformed placeholder '{0}' (expected 'out', 'out:<slot>' or 'input:<alias>')")]
  Malformed(String),

  #[error("recipe has no output slot '{0}'")]
  UnresolvedOutput(String),

  #[error("recipe has no input '{0}'")]
  UnresolvedInput(String),
}

/// Maps placeholders to concrete locations. `None` means the recipe does not
/// declare the slot or alias.
pub trait Resolver {
  fn resolve(&self, placeholder: &Placeholder) -> Option<&str>;
}

/// Split `text` into literal runs and placeholders.
pub fn parse(text: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut rest = text;
  let mut offset = 0;

  while let Some(open) = rest.find(OPEN) {
    let after_open = open + OPEN.len();

    // `$$${`: the extra dollar escapes the placeholder.
    if rest[..open].ends_with('$') {
      literal.push_str(&rest[..open - 1]);
      literal.push_str(OPEN);
      rest = &rest[after_open..];
      offset += after_open;
      continue;
    }

    literal.push_str(&rest[..open]);
    let close = rest[after_open..]
      .find(CLOSE)
      .ok_or(PlaceholderError::Unclosed(offset + open))?;
    let placeholder: Placeholder = rest[after_open..after_open + close].parse()?;

    if !literal.is_empty() {
      segments.push(Segment::Literal(std::mem::take(&mut literal)));
    }
    segments.push(Segment::Placeholder(placeholder));

    let consumed = after_open + close + 1;
    rest = &rest[consumed..];
    offset += consumed;
  }

  literal.push_str(rest);
  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }
  Ok(segments)
}

/// Parse `text` and replace every placeholder through `resolver`.
pub fn substitute(text: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut out = String::with_capacity(text.len());
  for segment in parse(text)? {
    match segment {
      Segment::Literal(s) => out.push_str(&s),
      Segment::Placeholder(p) => match resolver.resolve(&p) {
        Some(value) => out.push_str(value),
        None => return Err(unresolved(p)),
      },
    }
  }
  Ok(out)
}

fn unresolved(placeholder: Placeholder) -> PlaceholderError {
  match placeholder {
    Placeholder::Output(slot) => PlaceholderError::UnresolvedOutput(slot.unwrap_or_else(|| "out".to_string())),
    Placeholder::Input(alias) => PlaceholderError::UnresolvedInput(alias),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Layout {
    outputs: Vec<(&'static str, &'static str)>,
    inputs: Vec<(&'static str, &'static str)>,
  }

  impl Resolver for Layout {
    fn resolve(&self, placeholder: &Placeholder) -> Option<&str> {
      match placeholder {
        Placeholder::Output(None) => self.outputs.first().map(|(_, p)| *p),
        Placeholder::Output(Some(slot)) => self.outputs.iter().find(|(s, _)| *s == slot.as_str()).map(|(_, p)| *p),
        Placeholder::Input(alias) => self.inputs.iter().find(|(a, _)| *a == alias.as_str()).map(|(_, p)| *p),
      }
    }
  }

  fn layout() -> Layout {
    Layout {
      outputs: vec![("out", "/sb/out/out"), ("doc", "/sb/out/doc")],
      inputs: vec![("src", "/sb/inputs/src")],
    }
  }

  #[test]
  fn configure_and_install_into_outputs() {
    let cmd = "$${input:src}/configure --prefix=$${out} --docdir=$${out:doc} && make install";
    assert_eq!(
      substitute(cmd, &layout()).unwrap(),
      "/sb/inputs/src/configure --prefix=/sb/out/out --docdir=/sb/out/doc && make install"
    );
  }

  #[test]
  fn shell_variables_pass_through() {
    assert_eq!(
      substitute("mkdir -p $out/bin && echo $HOME $$ ${x}", &layout()).unwrap(),
      "mkdir -p $out/bin && echo $HOME $$ ${x}"
    );
  }

  #[test]
  fn escaped_placeholder_is_literal() {
    assert_eq!(substitute("echo $$${out}", &layout()).unwrap(), "echo $${out}");
    assert_eq!(
      parse("a$$${out}b$${out}").unwrap(),
      vec![
        Segment::Literal("a$${out}b".to_string()),
        Segment::Placeholder(Placeholder::Output(None)),
      ]
    );
  }

  #[test]
  fn display_renders_the_source_form() {
    for text in ["$${out}", "$${out:doc}", "$${input:src}"] {
      let placeholder: Placeholder = text[3..text.len() - 1].parse().unwrap();
      assert_eq!(placeholder.to_string(), text);
    }
  }

  #[test]
  fn parse_errors() {
    assert_eq!(parse("$${out"), Err(PlaceholderError::Unclosed(0)));
    assert_eq!(parse("ab $${out"), Err(PlaceholderError::Unclosed(3)));
    assert_eq!(parse("$${env:HOME}"), Err(PlaceholderError::UnknownType("env".to_string())));
    assert!(matches!(parse("$${input}"), Err(PlaceholderError::Malformed(_))));
    assert!(matches!(parse("$${input:}"), Err(PlaceholderError::Malformed(_))));
  }

  #[test]
  fn unresolved_names_fail() {
    assert_eq!(
      substitute("$${out:lib}", &layout()),
      Err(PlaceholderError::UnresolvedOutput("lib".to_string()))
    );
    assert_eq!(
      substitute("$${input:zlib}", &layout()),
      Err(PlaceholderError::UnresolvedInput("zlib".to_string()))
    );
    let empty = Layout {
      outputs: Vec::new(),
      inputs: Vec::new(),
    };
    assert_eq!(
      substitute("$${out}", &empty),
      Err(PlaceholderError::UnresolvedOutput("out".to_string()))
    );
  }
}
