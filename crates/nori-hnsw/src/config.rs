//! Index configuration.
//!
//! Loaded from YAML or built in code. Missing YAML fields take defaults.
//!
//! Example YAML:
//! ```yaml
//! dimensions: 768
//! distance: cosine
//! m: 32
//! m_max0: 64
//! ef_construction: 256
//! flat_search_cutoff: 20000
//! compression:
//!   type: product
//!   num_subspaces: 96
//!   training_limit: 50000
//! rescore_limit: 100
//! ```

use crate::{HnswError, Result};
use nori_quant::CompressionConfig;
use nori_vector::DistanceFunction;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What re-inserting an existing id does to its edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Replace the vector and re-run neighbor selection on every layer the
    /// node occupies.
    #[default]
    Repair,
    /// Replace the vector only; existing edges are kept as they are.
    ReplaceVectorOnly,
}

/// HNSW configuration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Vector dimensionality, fixed per index.
    pub dimensions: usize,

    /// Distance metric.
    pub distance: DistanceFunction,

    /// Max connections per node on layers above 0 (M parameter).
    /// Default: 16
    pub m: usize,

    /// Max connections on layer 0.
    /// Default: 32
    pub m_max0: usize,

    /// Beam width during construction.
    /// Higher = better quality, slower build.
    /// Default: 128
    pub ef_construction: usize,

    /// Fixed beam width during search. `None` derives it from `k`.
    pub ef_search: Option<usize>,

    /// Lower bound of the dynamic beam width. Default: 100
    pub dynamic_ef_min: usize,

    /// Upper bound of the dynamic beam width. Default: 500
    pub dynamic_ef_max: usize,

    /// Dynamic beam width is `k * dynamic_ef_factor`. Default: 8
    pub dynamic_ef_factor: usize,

    /// Maximum number of layers.
    /// Default: 16 (supports ~10^7 vectors)
    pub max_layers: usize,

    /// Allow-lists smaller than this are searched by linear scan.
    /// Default: 40000
    pub flat_search_cutoff: usize,

    /// Diversity-preferring neighbor selection. `false` keeps the closest.
    pub heuristic: bool,

    pub update_policy: UpdatePolicy,

    pub compression: CompressionConfig,

    /// Over-fetch size for exact re-ranking of compressed results.
    /// 0 disables rescoring. Default: 64
    pub rescore_limit: usize,

    /// Period of the background tombstone cleanup. Default: 300
    pub cleanup_interval_secs: u64,

    /// Seed for layer draws. `None` seeds from entropy.
    pub seed: Option<u64>,

    /// Number of lock stripes for node storage. Default: 512
    pub lock_shards: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimensions: 128,
            distance: DistanceFunction::Euclidean,
            m: 16,
            m_max0: 32,
            ef_construction: 128,
            ef_search: None,
            dynamic_ef_min: 100,
            dynamic_ef_max: 500,
            dynamic_ef_factor: 8,
            max_layers: 16,
            flat_search_cutoff: 40_000,
            heuristic: true,
            update_policy: UpdatePolicy::Repair,
            compression: CompressionConfig::None,
            rescore_limit: 64,
            cleanup_interval_secs: 300,
            seed: None,
            lock_shards: 512,
        }
    }
}

impl HnswConfig {
    /// Defaults for the given dimensionality and metric.
    pub fn new(dimensions: usize, distance: DistanceFunction) -> Self {
        Self {
            dimensions,
            distance,
            ..Default::default()
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: HnswConfig = serde_yaml::from_str(yaml)
            .map_err(|e| HnswError::Config(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HnswError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_yaml_str(&content)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(HnswError::Config("dimensions must be > 0".to_string()));
        }
        if self.m < 2 {
            return Err(HnswError::Config(format!("m must be >= 2, got {}", self.m)));
        }
        if self.m_max0 < self.m {
            return Err(HnswError::Config(format!(
                "m_max0 ({}) must be >= m ({})",
                self.m_max0, self.m
            )));
        }
        if self.ef_construction == 0 {
            return Err(HnswError::Config("ef_construction must be > 0".to_string()));
        }
        if self.ef_search == Some(0) {
            return Err(HnswError::Config("ef_search must be > 0".to_string()));
        }
        if self.dynamic_ef_min > self.dynamic_ef_max {
            return Err(HnswError::Config(format!(
                "dynamic_ef_min ({}) exceeds dynamic_ef_max ({})",
                self.dynamic_ef_min, self.dynamic_ef_max
            )));
        }
        if self.max_layers == 0 {
            return Err(HnswError::Config("max_layers must be > 0".to_string()));
        }
        if self.lock_shards == 0 {
            return Err(HnswError::Config("lock_shards must be > 0".to_string()));
        }

        self.compression.validate(self.dimensions)?;
        Ok(())
    }

    /// Max degree on `layer`.
    #[inline]
    pub fn max_degree(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m_max0
        } else {
            self.m
        }
    }

    /// Beam width for a query asking for `k` results.
    ///
    /// Never below `k`.
    pub fn ef_for(&self, k: usize) -> usize {
        self.tuning().ef_for(k)
    }

    /// The parameters that may change on a live index.
    pub fn tuning(&self) -> SearchTuning {
        SearchTuning {
            ef_search: self.ef_search,
            dynamic_ef_min: self.dynamic_ef_min,
            dynamic_ef_max: self.dynamic_ef_max,
            dynamic_ef_factor: self.dynamic_ef_factor,
            flat_search_cutoff: self.flat_search_cutoff,
            rescore_limit: self.rescore_limit,
            cleanup_interval_secs: self.cleanup_interval_secs,
        }
    }

    pub fn with_tuning(mut self, tuning: SearchTuning) -> Self {
        self.ef_search = tuning.ef_search;
        self.dynamic_ef_min = tuning.dynamic_ef_min;
        self.dynamic_ef_max = tuning.dynamic_ef_max;
        self.dynamic_ef_factor = tuning.dynamic_ef_factor;
        self.flat_search_cutoff = tuning.flat_search_cutoff;
        self.rescore_limit = tuning.rescore_limit;
        self.cleanup_interval_secs = tuning.cleanup_interval_secs;
        self
    }

    /// Fields outside [`SearchTuning`] that differ between `self` and `other`.
    pub(crate) fn fixed_changes(&self, other: &HnswConfig) -> Vec<&'static str> {
        let checks = [
            ("dimensions", self.dimensions != other.dimensions),
            ("distance", self.distance != other.distance),
            ("m", self.m != other.m),
            ("m_max0", self.m_max0 != other.m_max0),
            ("ef_construction", self.ef_construction != other.ef_construction),
            ("max_layers", self.max_layers != other.max_layers),
            ("heuristic", self.heuristic != other.heuristic),
            ("update_policy", self.update_policy != other.update_policy),
            ("compression", self.compression != other.compression),
            ("seed", self.seed != other.seed),
            ("lock_shards", self.lock_shards != other.lock_shards),
        ];
        checks
            .into_iter()
            .filter_map(|(name, changed)| changed.then_some(name))
            .collect()
    }
}

/// Search-time parameters, adjustable through
/// [`HnswIndex::update_config`](crate::HnswIndex::update_config).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchTuning {
    pub ef_search: Option<usize>,
    pub dynamic_ef_min: usize,
    pub dynamic_ef_max: usize,
    pub dynamic_ef_factor: usize,
    pub flat_search_cutoff: usize,
    pub rescore_limit: usize,
    pub cleanup_interval_secs: u64,
}

impl SearchTuning {
    pub fn ef_for(&self, k: usize) -> usize {
        let ef = match self.ef_search {
            Some(ef) => ef,
            None => k
                .saturating_mul(self.dynamic_ef_factor)
                .clamp(self.dynamic_ef_min, self.dynamic_ef_max),
        };
        ef.max(k)
    }
}
