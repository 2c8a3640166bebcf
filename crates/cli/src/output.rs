//! Terminal output.
//!
//! Every human-readable line is a symbol followed by a message, colored by
//! its [`Tone`] when the stream is a color terminal. Problems go to stderr so
//! stdout stays parseable. With `-o json` a command prints exactly one JSON
//! document on stdout instead.

use std::fmt::Display;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream, Style};

use kiln_lib::scheduler::BuildStatus;
use kiln_lib::store::StorePath;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const CACHED: &str = "=";
  pub const FETCHED: &str = "↓";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
  Good,
  Fetched,
  Quiet,
  Bad,
  Warn,
  Note,
}

impl Tone {
  fn symbol(self) -> &'static str {
    match self {
      Tone::Good => symbols::SUCCESS,
      Tone::Fetched => symbols::FETCHED,
      Tone::Quiet => symbols::CACHED,
      Tone::Bad => symbols::ERROR,
      Tone::Warn => symbols::WARNING,
      Tone::Note => symbols::INFO,
    }
  }

  fn style(self) -> Style {
    match self {
      Tone::Good => Style::new().green(),
      Tone::Fetched => Style::new().cyan(),
      Tone::Quiet => Style::new().dimmed(),
      Tone::Bad => Style::new().red(),
      Tone::Warn => Style::new().yellow(),
      Tone::Note => Style::new().blue(),
    }
  }

  /// Whether the message itself takes the color, not only the symbol.
  fn colors_message(self) -> bool {
    matches!(self, Tone::Quiet | Tone::Bad | Tone::Warn)
  }

  fn stream(self) -> Stream {
    match self {
      Tone::Bad | Tone::Warn => Stream::Stderr,
      _ => Stream::Stdout,
    }
  }
}

fn emit(tone: Tone, message: &dyn Display) {
  emit_to(tone.stream(), tone, message);
}

fn emit_to(stream: Stream, tone: Tone, message: &dyn Display) {
  let style = tone.style();
  let symbol = tone.symbol();
  let symbol = symbol.if_supports_color(stream, |s| s.style(style));
  let line = if tone.colors_message() {
    format!("{} {}", symbol, message.if_supports_color(stream, |m| m.style(style)))
  } else {
    format!("{} {}", symbol, message)
  };
  match stream {
    Stream::Stderr => eprintln!("{}", line),
    _ => println!("{}", line),
  }
}

fn status_tone(status: &BuildStatus) -> Tone {
  match status {
    BuildStatus::Built => Tone::Good,
    BuildStatus::Substituted => Tone::Fetched,
    BuildStatus::Cached => Tone::Quiet,
    BuildStatus::Failed(_) => Tone::Bad,
  }
}

/// `<recipe> <status>` on stdout, whatever the outcome. The log of a failure
/// is printed separately.
pub fn print_status(recipe: &str, status: &BuildStatus) {
  emit_to(Stream::Stdout, status_tone(status), &format!("{} {}", recipe, status));
}

pub fn print_success(message: &str) {
  emit(Tone::Good, &message);
}

pub fn print_error(message: &str) {
  emit(Tone::Bad, &message);
}

pub fn print_warning(message: &str) {
  emit(Tone::Warn, &message);
}

pub fn print_info(message: &str) {
  emit(Tone::Note, &message);
}

/// An indented `label: value` line under a summary.
pub fn print_stat(label: &str, value: &str) {
  let label = format!("{}:", label);
  println!("  {} {}", label.if_supports_color(Stream::Stdout, |l| l.dimmed()), value);
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to encode output as JSON")?;
  println!("{}", json);
  Ok(())
}

/// A store path with its hash cut to eight characters: `0123abcd…-name`.
pub fn short_path(path: &StorePath) -> String {
  let hash = path.hash_part();
  let keep = hash.char_indices().nth(8).map_or(hash.len(), |(i, _)| i);
  format!("{}…-{}", &hash[..keep], path.name())
}

/// Binary units with one decimal: `512 B`, `1.5 KB`, `3.0 GB`.
pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

  let mut unit = 0;
  let mut scaled = bytes as f64;
  while scaled >= 1024.0 && unit + 1 < UNITS.len() {
    scaled /= 1024.0;
    unit += 1;
  }
  if unit == 0 {
    format!("{} B", bytes)
  } else {
    format!("{:.1} {}", scaled, UNITS[unit])
  }
}

/// `42ms` below a second, `3.25s` below a minute, `2m 5s` above.
pub fn format_duration(duration: Duration) -> String {
  match duration.as_secs() {
    0 => format!("{}ms", duration.subsec_millis()),
    secs @ 1..=59 => format!("{}.{:02}s", secs, duration.subsec_millis() / 10),
    secs => format!("{}m {}s", secs / 60, secs % 60),
  }
}
