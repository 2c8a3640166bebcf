//! Crate-wide constants.

/// Application name, used for platform directories.
pub const APP_NAME: &str = "kiln";

/// Number of hex characters of a fingerprint used in a store path.
pub const OBJ_HASH_PREFIX_LEN: usize = 32;

/// Maximum length of the name part of a store path.
pub const MAX_NAME_LEN: usize = 211;

/// Suffix of the store path used to lock a recipe's realization.
pub const RECIPE_PATH_SUFFIX: &str = ".recipe";
