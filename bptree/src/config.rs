//! Index configuration module.
//!
//! Loads tree orders, the fan-out threshold and file locations from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `BPTREE_META_MOUNT_POINT`: Metadata root (default: `./sieve/meta`). Index
//!   files live in `<meta>/index`.
//! - `BPTREE_ORDER`: Order of top-level index trees (default: `32`)
//! - `BPTREE_SUB_TREE_ORDER`: Order of nested duplicate-key trees (default: `16`)
//! - `BPTREE_FAN_OUT_THRESHOLD`: Primary keys kept inline per index key before
//!   moving them to a nested tree (default: `16`)
//! - `BPTREE_PAGE_CACHE_CAPACITY`: Cached pages per open tree, `0` disables
//!   the cache (default: `0`)
//!
//! # Invariants
//!
//! - `order` and `sub_tree_order` are at least [`MIN_ORDER`]
//! - `fan_out_threshold` is at least 1

use std::path::{Path, PathBuf};

use crate::storage::metadata::MIN_ORDER;

/// Index configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    /// Root directory for metadata files.
    pub meta_directory: PathBuf,
    /// Directory holding `.idx.sieve` files. Always `<meta_directory>/index`.
    pub index_directory: PathBuf,
    pub order: usize,
    pub sub_tree_order: usize,
    pub fan_out_threshold: usize,
    pub page_cache_capacity: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::with_meta_directory(PathBuf::from(Self::DEFAULT_META_DIRECTORY))
    }
}

impl TreeConfig {
    pub const DEFAULT_META_DIRECTORY: &'static str = "./sieve/meta";
    pub const DEFAULT_ORDER: usize = 32;
    pub const DEFAULT_SUB_TREE_ORDER: usize = 16;
    pub const DEFAULT_FAN_OUT_THRESHOLD: usize = 16;
    pub const DEFAULT_PAGE_CACHE_CAPACITY: usize = 0;

    /// Defaults rooted at `meta_directory`.
    #[must_use]
    pub fn with_meta_directory(meta_directory: PathBuf) -> Self {
        Self {
            index_directory: meta_directory.join("index"),
            meta_directory,
            order: Self::DEFAULT_ORDER,
            sub_tree_order: Self::DEFAULT_SUB_TREE_ORDER,
            fan_out_threshold: Self::DEFAULT_FAN_OUT_THRESHOLD,
            page_cache_capacity: Self::DEFAULT_PAGE_CACHE_CAPACITY,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable is set but not a valid number,
    /// or an order or threshold is below its minimum.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value. Unset variables take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let meta_directory = lookup("BPTREE_META_MOUNT_POINT")
            .filter(|value| !value.is_empty())
            .map_or_else(
                || PathBuf::from(Self::DEFAULT_META_DIRECTORY),
                PathBuf::from,
            );

        Ok(Self {
            order: load_number(&lookup, "BPTREE_ORDER", Self::DEFAULT_ORDER, MIN_ORDER)?,
            sub_tree_order: load_number(
                &lookup,
                "BPTREE_SUB_TREE_ORDER",
                Self::DEFAULT_SUB_TREE_ORDER,
                MIN_ORDER,
            )?,
            fan_out_threshold: load_number(
                &lookup,
                "BPTREE_FAN_OUT_THRESHOLD",
                Self::DEFAULT_FAN_OUT_THRESHOLD,
                1,
            )?,
            page_cache_capacity: load_number(
                &lookup,
                "BPTREE_PAGE_CACHE_CAPACITY",
                Self::DEFAULT_PAGE_CACHE_CAPACITY,
                0,
            )?,
            ..Self::with_meta_directory(meta_directory)
        })
    }

    /// `<index>/<collection>-<field>.idx.sieve`
    #[must_use]
    pub fn index_file(&self, collection: &str, field: &str) -> PathBuf {
        self.index_directory
            .join(format!("{collection}-{field}.idx.sieve"))
    }

    /// `<index>/<collection>-<field>-<key>.idx.sieve`, the nested tree holding
    /// the primary keys of one index key.
    #[must_use]
    pub fn sub_index_file(&self, collection: &str, field: &str, key: &str) -> PathBuf {
        self.index_directory
            .join(format!("{collection}-{field}-{key}.idx.sieve"))
    }

    #[must_use]
    pub fn index_directory(&self) -> &Path {
        &self.index_directory
    }
}

/// Parse `name` as a number of at least `min`, or return `default` if unset.
fn load_number<F>(lookup: &F, name: &str, default: usize, min: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    let parsed = value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid number"),
        })?;
    if parsed < min {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("must be at least {min}, got {parsed}"),
        });
    }
    Ok(parsed)
}
