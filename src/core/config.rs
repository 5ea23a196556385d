//! Reader configuration
//!
//! Cache sizes and chain limits for an open handle. Values can be built in
//! code with [`ReaderConfigBuilder`] or loaded from TOML:
//!
//! ```toml
//! l2_cache_capacity = 32
//! cluster_cache_capacity = 64
//! max_backing_depth = 4
//! ```

use crate::error::{QcowError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound for `max_backing_depth`
pub const MAX_BACKING_DEPTH_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaderConfig {
    /// Number of decoded L2 tables kept per handle (0 disables)
    pub l2_cache_capacity: usize,

    /// Number of decoded data clusters kept per handle (0 disables)
    pub cluster_cache_capacity: usize,

    /// Longest accepted chain of backing images below a handle
    pub max_backing_depth: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            l2_cache_capacity: 16,
            cluster_cache_capacity: 32,
            max_backing_depth: 8,
        }
    }
}

impl ReaderConfig {
    pub fn builder() -> ReaderConfigBuilder {
        ReaderConfigBuilder::new()
    }

    /// Parse and validate a TOML document; missing keys take defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ReaderConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_backing_depth == 0 || self.max_backing_depth > MAX_BACKING_DEPTH_LIMIT {
            return Err(QcowError::InvalidConfig(format!(
                "max_backing_depth must be in 1..={}, got {}",
                MAX_BACKING_DEPTH_LIMIT, self.max_backing_depth
            )));
        }
        Ok(())
    }
}

/// Builder for [`ReaderConfig`]
#[derive(Debug, Clone, Default)]
pub struct ReaderConfigBuilder {
    config: ReaderConfig,
}

impl ReaderConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn l2_cache_capacity(mut self, tables: usize) -> Self {
        self.config.l2_cache_capacity = tables;
        self
    }

    pub fn cluster_cache_capacity(mut self, clusters: usize) -> Self {
        self.config.cluster_cache_capacity = clusters;
        self
    }

    /// Disable both caches
    pub fn without_caches(self) -> Self {
        self.l2_cache_capacity(0).cluster_cache_capacity(0)
    }

    pub fn max_backing_depth(mut self, depth: usize) -> Self {
        self.config.max_backing_depth = depth;
        self
    }

    pub fn build(self) -> Result<ReaderConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
