//! Lifecycle façade tying the grid, pool, and sink together:
//! `load` / `search` / `search_file` / `unload` / `statistics`.

use std::path::Path;
use std::sync::Arc;

use crate::fingerprint::Fingerprint;
use crate::grid::CardinalityGrid;
use crate::loader::{InMemoryRecord, LineLoader, RecordSource};
use crate::pool::WorkerPool;
use crate::sink::{ResultSink, SinkMode};
use crate::{Error, Result};
use tracing::{debug, info};

/// Construction-time engine parameters. Passed explicitly rather than
/// read from process-wide state.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Worker pool size. Chosen by the caller.
    pub threads: usize,
    /// Minimum leaf range size; ranges smaller than this never split.
    pub leaf_limit: usize,
    /// Default field separator for CSV output.
    pub separator: char,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            leaf_limit: 8,
            separator: ',',
        }
    }
}

/// Results of one query: parallel `ids`/`scores` vectors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchResult {
    pub ids: Vec<String>,
    pub scores: Vec<f64>,
}

/// `statistics()` output: labels `"XOR-Hash"`, `"Tanimoto"`, `"Total"`;
/// counts are pre-XOR-hash comparisons, pre-exact comparisons, and the
/// candidate denominator `storedSize x lastSearchSize`; percentages are
/// the first two divided by the third, times 100.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Statistics {
    pub labels: [&'static str; 3],
    pub counts: [u64; 3],
    pub percentages: [f64; 3],
}

/// An explicit engine handle: fingerprint collection, cardinality grid,
/// and worker pool. See [`crate::global::GlobalEngine`] for a thin facade
/// over this type for callers that want singleton semantics.
pub struct Engine {
    config: EngineConfig,
    pool: WorkerPool,
    grid: Option<CardinalityGrid>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let pool = WorkerPool::new(config.threads);
        Self { config, pool, grid: None }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.grid.is_some()
    }

    /// Reads every record from `source` and replaces any prior engine
    /// state. Returns the number of fingerprints loaded; `0` signals
    /// unreadable input.
    pub fn load(&mut self, source: impl RecordSource) -> Result<u64> {
        match source.read_all() {
            Ok(records) => self.load_records(records),
            Err(_) => {
                self.grid = None;
                Ok(0)
            }
        }
    }

    pub fn load_path(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let loader = LineLoader::open(path)?;
        self.load(loader)
    }

    /// Loads already-materialized records directly, bypassing
    /// [`RecordSource`]. Assigns a 12-digit zero-padded sequential id
    /// (1-based, over successfully-ingested records only) to any record
    /// without one.
    pub fn load_records(&mut self, records: Vec<InMemoryRecord>) -> Result<u64> {
        self.grid = None;

        let mut fingerprints = Vec::with_capacity(records.len());
        let mut bit_width = 0usize;
        for (i, record) in records.into_iter().enumerate() {
            let id = record.id.unwrap_or_else(|| format!("{:012}", i + 1).into_boxed_str());
            let fp = Fingerprint::from_bit_str(id, &record.bits);
            bit_width = bit_width.max(fp.bit_len());
            fingerprints.push(fp);
        }

        let n = fingerprints.len() as u64;
        let grid = CardinalityGrid::build(fingerprints, bit_width, self.config.leaf_limit, &self.pool);
        self.grid = Some(grid);
        info!(loaded = n, bit_width, leaf_limit = self.config.leaf_limit, "engine load complete");
        Ok(n)
    }

    /// Idempotent teardown.
    pub fn unload(&mut self) {
        self.grid = None;
    }

    /// `limit` of `0` (or any non-positive value surfaced as `None`)
    /// means no cap; `sort` requests descending score order.
    pub fn search(&self, query_bits: &str, threshold: f64, limit: Option<usize>, sort: bool) -> Result<SearchResult> {
        let grid = self.grid.as_ref().ok_or(Error::NotLoaded)?;
        let query = Fingerprint::from_bit_str("", query_bits);
        debug!(popcount = query.popcount(), threshold, sort, "dispatching search");

        grid.init_statistics();
        let mode = if sort { SinkMode::Sorted } else { SinkMode::Unsorted };
        let sink = Arc::new(ResultSink::new(mode));
        grid.search(&query, threshold, &sink, &self.pool);
        grid.set_last_search_size(1);

        let sink = Arc::try_unwrap(sink)
            .unwrap_or_else(|_| unreachable!("grid.search()'s barrier guarantees every Arc clone has been dropped"));
        let mut matches = sink.drain();
        if let Some(limit) = limit.filter(|&l| l > 0) {
            matches.truncate(limit);
        }

        Ok(SearchResult {
            ids: matches.iter().map(|m| m.match_id.to_string()).collect(),
            scores: matches.iter().map(|m| m.score).collect(),
        })
    }

    /// Runs one query per line of `queries`, dispatching every query as a
    /// single range-search task so queries run concurrently against each
    /// other rather than one at a time. Matches are collected unsorted,
    /// matching the batch-search contract. If `result_path` is given,
    /// streams CSV (`query{sep}fingerprint{sep}tanimoto\n` header, one
    /// row per match) and returns `None`; otherwise returns one
    /// [`SearchResult`] per query line, in unsorted (arrival) order.
    pub fn search_file(
        &self,
        queries: &[String],
        threshold: f64,
        result_path: Option<&Path>,
        separator: char,
    ) -> Result<Option<Vec<SearchResult>>> {
        let grid = self.grid.as_ref().ok_or(Error::NotLoaded)?;
        grid.init_statistics();

        let parsed: Vec<Fingerprint> = queries
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let (id, bits) =
                    crate::loader::parse_line(line).unwrap_or_else(|| (None, line.clone().into_boxed_str()));
                let id = id.unwrap_or_else(|| format!("{:012}", i + 1).into_boxed_str());
                Fingerprint::from_bit_str(id, &bits)
            })
            .collect();

        if let Some(path) = result_path {
            use std::io::Write;
            let mut file = std::fs::File::create(path)?;
            write!(file, "query{separator}fingerprint{separator}tanimoto\n")?;

            let sink = Arc::new(ResultSink::new_streaming(file, separator));
            for query in parsed.iter().cloned() {
                grid.search_async(query, threshold, Arc::clone(&sink), &self.pool);
            }
            self.pool.wait();
            grid.set_last_search_size(queries.len() as u64);

            if let Some(err) = sink.take_error() {
                return Err(Error::StreamWriteFailure(err));
            }
            Ok(None)
        } else {
            // Dispatch every query as a single range-search task (no per-query
            // barrier) and let queries run concurrently against each other;
            // the only barrier is the final `pool.wait()`. Matches land in one
            // shared unsorted sink and are regrouped by query id afterwards.
            let sink = Arc::new(ResultSink::new(SinkMode::Unsorted));
            for query in parsed.iter().cloned() {
                grid.search_async(query, threshold, Arc::clone(&sink), &self.pool);
            }
            self.pool.wait();
            grid.set_last_search_size(queries.len() as u64);

            let matches = Arc::try_unwrap(sink)
                .unwrap_or_else(|_| unreachable!("pool.wait() guarantees every Arc clone has been dropped"))
                .drain();

            let mut index_by_id = std::collections::HashMap::with_capacity(parsed.len());
            for (i, query) in parsed.iter().enumerate() {
                index_by_id.entry(query.id()).or_insert(i);
            }

            let mut results = vec![SearchResult::default(); parsed.len()];
            for m in matches {
                if let Some(&i) = index_by_id.get(&*m.query_id) {
                    results[i].ids.push(m.match_id.to_string());
                    results[i].scores.push(m.score);
                }
            }
            Ok(Some(results))
        }
    }

    pub fn statistics(&self) -> Statistics {
        let Some(grid) = self.grid.as_ref() else {
            return Statistics { labels: ["XOR-Hash", "Tanimoto", "Total"], counts: [0, 0, 0], percentages: [0.0; 3] };
        };

        let (xor_count, tanimoto_count) = grid.statistics();
        let total = grid.size() as u64 * grid.last_search_size();
        let pct = |count: u64| if total == 0 { 0.0 } else { (count as f64 / total as f64) * 100.0 };

        Statistics {
            labels: ["XOR-Hash", "Tanimoto", "Total"],
            counts: [xor_count, tanimoto_count, total],
            percentages: [pct(xor_count), pct(tanimoto_count), 100.0],
        }
    }
}
