//! The index handle: construction, compression and the `VectorIndex` surface.

use crate::config::{HnswConfig, SearchTuning};
use crate::distancer::{Space, VectorCache};
use crate::graph::{Graph, NodeId};
use crate::layer::LevelGenerator;
use crate::persist::{id_key, Buckets, CODEBOOK_KEY};
use crate::store::{KvStore, MemoryStore};
use crate::{BatchItemError, HnswError, Result};
use nori_observe::{
    obs_count, obs_gauge, obs_timed, Meter, NoopMeter, QuantEvt, QuantKind, VizEvent,
};
use nori_quant::{Compressor, QuantError};
use nori_vector::{
    normalize, validate_vector, AllowList, VectorError, VectorIndex, VectorMatch,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// HNSW index.
///
/// Thread-safe: searches run concurrently with each other and with inserts
/// and deletes. Structural changes (entry point, reset) serialize on a
/// short global lock; neighbor-list edits lock only the shards involved.
pub struct HnswIndex {
    /// Construction-time configuration. Its search parameters are only the
    /// initial values; the live ones are in `tuning`.
    pub(crate) config: HnswConfig,
    pub(crate) tuning: RwLock<SearchTuning>,
    pub(crate) graph: Graph,
    pub(crate) levels: LevelGenerator,
    /// Raw vectors until compression activates.
    pub(crate) cache: VectorCache,
    pub(crate) compressor: RwLock<Option<Arc<Compressor>>>,
    pub(crate) buckets: Buckets,
    pub(crate) meter: Arc<dyn Meter>,
    /// Label carried on emitted events.
    pub(crate) name: &'static str,
    /// Serializes cleanup passes, resets and re-inserts.
    pub(crate) cleanup_lock: Mutex<()>,
    pub(crate) compress_lock: Mutex<()>,
}

impl HnswIndex {
    /// Open an index over `store`.
    ///
    /// The in-memory graph starts empty; call
    /// [`post_startup`](VectorIndex::post_startup) to rebuild it from
    /// whatever the store already holds.
    pub fn new(config: HnswConfig, store: Arc<dyn KvStore>) -> Result<Self> {
        config.validate()?;
        let buckets = Buckets::open(store.as_ref())?;

        tracing::info!(
            dimensions = config.dimensions,
            distance = config.distance.name(),
            m = config.m,
            ef_construction = config.ef_construction,
            compression = config.compression.is_enabled(),
            "opened hnsw index"
        );

        Ok(Self {
            graph: Graph::new(config.lock_shards),
            levels: LevelGenerator::new(config.m, config.max_layers, config.seed),
            cache: VectorCache::new(config.lock_shards),
            compressor: RwLock::new(None),
            buckets,
            meter: Arc::new(NoopMeter),
            name: "hnsw",
            cleanup_lock: Mutex::new(()),
            compress_lock: Mutex::new(()),
            tuning: RwLock::new(config.tuning()),
            config,
        })
    }

    /// Index backed by a private [`MemoryStore`].
    pub fn in_memory(config: HnswConfig) -> Result<Self> {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    /// Report metrics and events to `meter`, labelled `name`.
    pub fn with_meter(mut self, meter: Arc<dyn Meter>, name: &'static str) -> Self {
        self.meter = meter;
        self.name = name;
        self
    }

    /// Current configuration, including search parameters changed since
    /// construction.
    pub fn config(&self) -> HnswConfig {
        self.config.clone().with_tuning(self.tuning())
    }

    pub(crate) fn tuning(&self) -> SearchTuning {
        *self.tuning.read()
    }

    /// Change search parameters on a live index.
    ///
    /// Only `ef_search`, the dynamic ef bounds, `flat_search_cutoff`,
    /// `rescore_limit` and `cleanup_interval_secs` may differ from the
    /// current configuration. Anything else fails with `Config` and leaves
    /// the index untouched.
    pub fn update_config(&self, config: HnswConfig) -> Result<()> {
        config.validate()?;
        let changed = self.config.fixed_changes(&config);
        if !changed.is_empty() {
            return Err(HnswError::Config(format!(
                "cannot change {} on a live index",
                changed.join(", ")
            )));
        }

        let tuning = config.tuning();
        *self.tuning.write() = tuning;
        tracing::info!(
            ef_search = ?tuning.ef_search,
            flat_search_cutoff = tuning.flat_search_cutoff,
            rescore_limit = tuning.rescore_limit,
            cleanup_interval_secs = tuning.cleanup_interval_secs,
            "search parameters updated"
        );
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Number of nodes in the graph, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn contains_node(&self, id: u64) -> bool {
        self.graph.contains(id)
    }

    pub fn is_tombstoned(&self, id: u64) -> bool {
        self.graph.is_tombstoned(id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.graph.tombstones().len()
    }

    pub fn entry_point(&self) -> Option<u64> {
        self.graph.meta().entry_point
    }

    /// Exact distance between two caller-supplied vectors under the index
    /// metric. Cosine operands are normalized first, as on ingestion.
    pub fn distance_between_vectors(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        let metric = self.config.distance;
        if !metric.normalizes() {
            return Ok(metric.try_distance(a, b)?);
        }
        let (mut a, mut b) = (a.to_vec(), b.to_vec());
        normalize(&mut a);
        normalize(&mut b);
        Ok(metric.try_distance(&a, &b)?)
    }

    pub(crate) fn compressor_snapshot(&self) -> Option<Arc<Compressor>> {
        self.compressor.read().clone()
    }

    pub(crate) fn space<'a>(&'a self, compressor: Option<&'a Compressor>) -> Space<'a> {
        match compressor {
            Some(compressor) => Space::Compressed(compressor),
            None => Space::Raw {
                metric: self.config.distance,
                cache: &self.cache,
            },
        }
    }

    /// Run `op` in the current space.
    ///
    /// Activation clears the raw cache, so an operation that started in raw
    /// space and overlapped it may have missed vectors. Its result is thrown
    /// away and `op` runs again against the codes. The compressed flag is set
    /// before the cache is cleared, so any such overlap is visible here.
    pub(crate) fn with_space<R>(&self, mut op: impl FnMut(Space<'_>) -> Result<R>) -> Result<R> {
        let compressor = self.compressor_snapshot();
        let was_compressed = compressor.is_some();
        let result = op(self.space(compressor.as_deref()));
        drop(compressor);

        if was_compressed || !self.compressed() {
            return result;
        }
        match result {
            Ok(_) | Err(HnswError::Invariant(_)) => {
                tracing::debug!("compression activated mid-operation, retrying");
                let compressor = self.compressor_snapshot();
                op(self.space(compressor.as_deref()))
            }
            Err(e) => Err(e),
        }
    }

    /// A node's full-precision vector: cached, or read back from the store.
    pub(crate) fn node_vector(&self, id: NodeId) -> Result<Option<Arc<[f32]>>> {
        if let Some(vector) = self.cache.get(id) {
            return Ok(Some(vector));
        }
        Ok(self.load_vector(id)?.map(Arc::from))
    }

    /// Validate, copy and (for cosine) normalize an incoming vector.
    pub(crate) fn prepare(&self, vector: &[f32]) -> Result<Arc<[f32]>> {
        validate_vector(self.config.dimensions, vector)?;
        let mut owned = vector.to_vec();
        if self.config.distance.normalizes() {
            normalize(&mut owned);
        }
        Ok(Arc::from(owned))
    }

    pub(crate) fn report_gauges(&self) {
        obs_gauge!(self.meter, "hnsw_nodes", &[], self.graph.len());
        obs_gauge!(self.meter, "hnsw_tombstones", &[], self.tombstone_count());
    }

    /// Train the configured quantizer on the cached vectors and switch every
    /// distance computation to codes. Returns false if already compressed.
    ///
    /// The codebook is persisted only after every code is, so a crash part
    /// way leaves the index uncompressed on restart.
    pub fn compress(&self) -> Result<bool> {
        let _guard = self.compress_lock.lock();
        if self.compressor.read().is_some() {
            return Ok(false);
        }
        if !self.config.compression.is_enabled() {
            return Err(HnswError::Config("compression is disabled".to_string()));
        }

        let training: Vec<Vec<f32>> = self
            .cache
            .snapshot()
            .into_iter()
            .map(|(_, v)| v.to_vec())
            .collect();
        if training.is_empty() {
            return Err(QuantError::Training("no vectors to train on".into()).into());
        }

        self.meter.emit(VizEvent::Quant(QuantEvt {
            index: self.name,
            kind: QuantKind::TrainingStart {
                vectors: training.len(),
            },
        }));
        let compressor = Compressor::train(
            &self.config.compression,
            self.config.distance,
            &training,
            self.config.dimensions,
        )?;
        drop(training);

        let code_bytes = {
            let mut slot = self.compressor.write();
            // fresh snapshot: inserts that raced training are in the cache
            for (id, vector) in self.cache.snapshot() {
                let code = compressor.insert(id, &vector)?;
                self.buckets.compressed.put(&id_key(id), &code)?;
            }
            self.buckets
                .meta
                .put(CODEBOOK_KEY, &compressor.codebook().to_bytes())?;

            let code_bytes = compressor.code_len();
            *slot = Some(Arc::new(compressor));
            self.graph.meta_mut().compressed = true;
            self.cache.clear();
            code_bytes
        };

        self.meter.emit(VizEvent::Quant(QuantEvt {
            index: self.name,
            kind: QuantKind::Activated { code_bytes },
        }));
        tracing::info!(
            nodes = self.graph.len(),
            code_bytes,
            "compression activated"
        );
        Ok(true)
    }

    /// Compress once the graph reaches the configured training size.
    pub(crate) fn maybe_compress(&self) -> Result<()> {
        let Some(limit) = self.config.compression.training_limit() else {
            return Ok(());
        };
        if self.graph.meta().compressed || self.graph.len() < limit {
            return Ok(());
        }
        self.compress().map(|_| ())
    }

    /// Drop every vector, code, tombstone and node, in memory and in the
    /// store. The index stays usable and starts over uncompressed.
    pub fn drop_index(&self) -> Result<()> {
        let _cleanup = self.cleanup_lock.lock();
        let _compress = self.compress_lock.lock();
        {
            let mut slot = self.compressor.write();
            *slot = None;
            self.graph.clear();
            self.graph.meta_mut().compressed = false;
            self.cache.clear();
        }
        self.buckets.clear_all()?;

        self.report_gauges();
        tracing::info!("dropped hnsw index");
        Ok(())
    }

    /// Persist the graph snapshot and stop.
    pub fn shutdown(&self) -> Result<()> {
        let _cleanup = self.cleanup_lock.lock();
        self.flush()?;
        tracing::info!(nodes = self.graph.len(), "hnsw index shut down");
        Ok(())
    }
}

impl VectorIndex for HnswIndex {
    type Error = HnswError;

    fn add(&self, id: u64, vector: &[f32]) -> Result<()> {
        let vector = self.prepare(vector)?;
        self.index_vector(id, vector)?;

        obs_count!(self.meter, "hnsw_inserts_total", &[], 1);
        self.report_gauges();
        Ok(())
    }

    fn add_batch(
        &self,
        cancel: &CancellationToken,
        ids: &[u64],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        if ids.len() != vectors.len() {
            return Err(VectorError::InvalidVector(format!(
                "{} ids for {} vectors",
                ids.len(),
                vectors.len()
            ))
            .into());
        }

        // nothing is touched unless every item is valid
        let prepared = ids
            .iter()
            .zip(vectors)
            .map(|(&id, v)| self.prepare(v).map(|v| (id, v)))
            .collect::<Result<Vec<_>>>()?;

        if cancel.is_cancelled() {
            return Err(HnswError::Cancelled);
        }

        let total = prepared.len();
        let mut failures = Vec::new();
        for (position, (id, vector)) in prepared.into_iter().enumerate() {
            if let Err(e) = self.index_vector(id, vector) {
                tracing::warn!(id, position, error = %e, "batch insert failed");
                failures.push(BatchItemError {
                    position,
                    id,
                    source: Box::new(e),
                });
            }
        }

        obs_count!(self.meter, "hnsw_inserts_total", &[], total - failures.len());
        self.report_gauges();
        tracing::debug!(total, failed = failures.len(), "batch insert finished");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HnswError::Batch(failures))
        }
    }

    fn delete(&self, ids: &[u64]) -> Result<()> {
        self.delete_ids(ids)
    }

    fn search_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        allow: Option<&dyn AllowList>,
    ) -> Result<Vec<VectorMatch>> {
        obs_count!(self.meter, "hnsw_searches_total", &[], 1);
        obs_timed!(self.meter, "hnsw_search_ms", &[], {
            let query = self.prepare(vector)?;
            self.knn(&query, k, allow)
        })
    }

    fn search_by_vector_distance(
        &self,
        vector: &[f32],
        max_distance: f32,
        max_limit: Option<usize>,
        allow: Option<&dyn AllowList>,
    ) -> Result<Vec<VectorMatch>> {
        obs_count!(self.meter, "hnsw_searches_total", &[], 1);
        let query = self.prepare(vector)?;
        self.range_search(&query, max_distance, max_limit, allow)
    }

    fn already_indexed(&self) -> u64 {
        self.graph.len() as u64
    }

    fn post_startup(&self) -> Result<()> {
        self.restore()
    }

    fn compressed(&self) -> bool {
        self.graph.meta().compressed
    }

    fn validate_before_insert(&self, vector: &[f32]) -> Result<()> {
        validate_vector(self.config.dimensions, vector)?;
        Ok(())
    }
}
