//! Where kiln keeps things when nobody says otherwise.

use std::path::PathBuf;

use crate::consts::APP_NAME;

pub const ENV_STORE: &str = "KILN_STORE";

/// The store location: `$KILN_STORE`, else `<data dir>/store`.
///
/// The data dir is `$XDG_DATA_HOME/kiln`, falling back to
/// `$HOME/.local/share/kiln`. Empty variables count as unset.
pub fn store_dir() -> PathBuf {
  env_path(ENV_STORE).unwrap_or_else(|| data_dir().join("store"))
}

pub fn data_dir() -> PathBuf {
  let base = env_path("XDG_DATA_HOME").unwrap_or_else(|| {
    let home = env_path("HOME").unwrap_or_else(|| PathBuf::from("/"));
    home.join(".local").join("share")
  });
  base.join(APP_NAME)
}

fn env_path(var: &str) -> Option<PathBuf> {
  std::env::var_os(var)
    .filter(|value| !value.is_empty())
    .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn explicit_store_wins() {
    temp_env::with_vars(
      [(ENV_STORE, Some("/srv/kiln")), ("XDG_DATA_HOME", Some("/data"))],
      || assert_eq!(store_dir(), PathBuf::from("/srv/kiln")),
    );
  }

  #[test]
  #[serial]
  fn empty_store_variable_is_ignored() {
    temp_env::with_vars([(ENV_STORE, Some("")), ("XDG_DATA_HOME", Some("/data"))], || {
      assert_eq!(store_dir(), PathBuf::from("/data/kiln/store"))
    });
  }

  #[test]
  #[serial]
  fn data_dir_falls_back_to_home() {
    temp_env::with_vars(
      [("XDG_DATA_HOME", None::<&str>), ("HOME", Some("/home/builder"))],
      || assert_eq!(data_dir(), PathBuf::from("/home/builder/.local/share/kiln")),
    );
  }
}
