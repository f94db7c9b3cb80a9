//! Store configuration.
//!
//! Values come from code (`StoreConfig { .. }`), from any serde source, or
//! from the environment via [`StoreConfig::from_env`]:
//!
//! | variable | meaning | default |
//! |---|---|---|
//! | `CHRONICLE_PAGE_SIZE` | envelopes fetched per cursor page | `256` |
//! | `CHRONICLE_MISSING_STREAMS` | `empty` or `error` | `empty` |
//! | `DATABASE_URL` | Postgres connection string | unset |

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 10_000;

/// How `read_stream` treats an aggregate that has never been appended to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingStreamPolicy {
    /// Yield an empty stream (indistinguishable from reading past the end).
    #[default]
    Empty,
    /// Fail with `StreamNotFound`.
    Error,
}

impl core::str::FromStr for MissingStreamPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "empty" => Ok(Self::Empty),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown missing-stream policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub page_size: usize,
    pub missing_streams: MissingStreamPolicy,
    pub database_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            missing_streams: MissingStreamPolicy::default(),
            database_url: None,
        }
    }
}

impl StoreConfig {
    /// Read configuration from the process environment.
    ///
    /// Invalid values are logged and replaced by defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, map, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("CHRONICLE_PAGE_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(size) => config.page_size = size,
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid CHRONICLE_PAGE_SIZE"),
            }
        }

        if let Some(raw) = lookup("CHRONICLE_MISSING_STREAMS") {
            match raw.parse() {
                Ok(policy) => config.missing_streams = policy,
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid CHRONICLE_MISSING_STREAMS"),
            }
        }

        config.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        config.normalized()
    }

    /// Clamp values into their supported ranges.
    pub fn normalized(mut self) -> Self {
        let clamped = self.page_size.clamp(1, MAX_PAGE_SIZE);
        if clamped != self.page_size {
            warn!(requested = self.page_size, used = clamped, "page size out of range");
            self.page_size = clamped;
        }
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self.normalized()
    }

    pub fn with_missing_streams(mut self, policy: MissingStreamPolicy) -> Self {
        self.missing_streams = policy;
        self
    }
}
