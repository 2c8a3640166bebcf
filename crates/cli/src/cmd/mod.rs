mod add;
mod build;
mod gc;
mod info;
mod roots;
mod verify;

pub use add::cmd_add;
pub use build::{BuildArgs, cmd_build};
pub use gc::cmd_gc;
pub use info::cmd_info;
pub use roots::{cmd_roots_add, cmd_roots_list, cmd_roots_remove};
pub use verify::cmd_verify;

use anyhow::{Context, Result};

use kiln_lib::config::Settings;
use kiln_lib::store::{Store, StorePath};

fn open_store(settings: &Settings) -> Result<Store> {
  Store::open(&settings.store).with_context(|| format!("Failed to open store at {}", settings.store.display()))
}

fn parse_store_path(s: &str) -> Result<StorePath> {
  s.parse().with_context(|| format!("'{}' is not a store path", s))
}
