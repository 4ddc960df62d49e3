//! Engine configuration
//!
//! Configuration is a plain serde structure so it can be embedded in a larger
//! TOML file or built programmatically:
//!
//! ```toml
//! engine = "membuf"
//! cache_path = "/var/cache/artifacts"
//!
//! [membuf]
//! initial_page_size = 104857600
//! grow_page_size = 104857600
//! min_free_block_size = 1024
//! max_page_count = 10
//! fit_policy = "first-fit"
//! persistence = "json"
//! ```

use crate::allocator::FitPolicy;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_INITIAL_PAGE_SIZE: u64 = 100_000_000;
pub const DEFAULT_GROW_PAGE_SIZE: u64 = 100_000_000;
pub const DEFAULT_MIN_FREE_BLOCK_SIZE: u64 = 1024;
pub const DEFAULT_MAX_PAGE_COUNT: u32 = 10;

/// Storage engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Membuf,
    Fs,
}

/// Index persistence adapter selection for the arena engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persistence {
    /// Index lives only in memory; the cache is empty after a restart
    #[default]
    Volatile,
    /// Index, page table and pages are written under `cache_path`
    Json,
}

/// Options recognized by the arena (membuf) engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembufOptions {
    /// Size of the first arena page in bytes
    pub initial_page_size: u64,
    /// Growth unit in bytes; the arena grows by whole multiples of this
    pub grow_page_size: u64,
    /// Remainders smaller than this are absorbed instead of split off
    pub min_free_block_size: u64,
    /// Upper bound on the number of pages (initial page included)
    pub max_page_count: u32,
    pub fit_policy: FitPolicy,
    pub persistence: Persistence,
}

impl Default for MembufOptions {
    fn default() -> Self {
        MembufOptions {
            initial_page_size: DEFAULT_INITIAL_PAGE_SIZE,
            grow_page_size: DEFAULT_GROW_PAGE_SIZE,
            min_free_block_size: DEFAULT_MIN_FREE_BLOCK_SIZE,
            max_page_count: DEFAULT_MAX_PAGE_COUNT,
            fit_policy: FitPolicy::default(),
            persistence: Persistence::default(),
        }
    }
}

/// Top-level cache configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub engine: EngineKind,

    /// Storage root. Required by the filesystem engine and by the arena
    /// engine when persistence is enabled.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    #[serde(default)]
    pub membuf: MembufOptions,
}

impl CacheConfig {
    /// Arena engine with default options and volatile index
    pub fn membuf() -> Self {
        CacheConfig {
            engine: EngineKind::Membuf,
            ..Default::default()
        }
    }

    /// Filesystem engine rooted at `path`
    pub fn fs<P: AsRef<Path>>(path: P) -> Self {
        CacheConfig {
            engine: EngineKind::Fs,
            cache_path: Some(path.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    pub fn with_cache_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cache_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_page_sizes(mut self, initial_page_size: u64, grow_page_size: u64) -> Self {
        self.membuf.initial_page_size = initial_page_size;
        self.membuf.grow_page_size = grow_page_size;
        self
    }

    pub fn with_min_free_block_size(mut self, size: u64) -> Self {
        self.membuf.min_free_block_size = size;
        self
    }

    pub fn with_max_page_count(mut self, count: u32) -> Self {
        self.membuf.max_page_count = count;
        self
    }

    pub fn with_fit_policy(mut self, policy: FitPolicy) -> Self {
        self.membuf.fit_policy = policy;
        self
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.membuf.persistence = persistence;
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: CacheConfig =
            toml::from_str(source).map_err(|e| CacheError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CacheError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    /// Storage root, or ConfigError if none was given
    pub fn require_cache_path(&self) -> Result<&Path> {
        self.cache_path
            .as_deref()
            .ok_or_else(|| CacheError::Config("cache_path is required".to_string()))
    }

    /// Check every option the selected engine depends on
    pub fn validate(&self) -> Result<()> {
        match self.engine {
            EngineKind::Fs => {
                self.require_cache_path()?;
                Ok(())
            }
            EngineKind::Membuf => self.validate_membuf(),
        }
    }

    pub(crate) fn validate_membuf(&self) -> Result<()> {
        let opts = &self.membuf;

        if opts.initial_page_size == 0 {
            return Err(CacheError::Config(
                "initial_page_size must be greater than zero".to_string(),
            ));
        }
        if opts.grow_page_size == 0 {
            return Err(CacheError::Config(
                "grow_page_size must be greater than zero".to_string(),
            ));
        }
        if opts.min_free_block_size == 0 {
            return Err(CacheError::Config(
                "min_free_block_size must be greater than zero".to_string(),
            ));
        }
        if opts.max_page_count == 0 {
            return Err(CacheError::Config(
                "max_page_count must be at least 1".to_string(),
            ));
        }
        if opts.persistence == Persistence::Json && self.cache_path.is_none() {
            return Err(CacheError::Config(
                "cache_path is required when persistence is enabled".to_string(),
            ));
        }

        Ok(())
    }
}
