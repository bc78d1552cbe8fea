//! `CardinalityGrid` — buckets fingerprints by popcount and restricts a
//! query to the bucket range that can possibly satisfy its threshold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fingerprint::Fingerprint;
use crate::pool::WorkerPool;
use crate::sink::ResultSink;
use crate::tree::MultibitTree;

/// `[start, end)` bucket range: any candidate with a Tanimoto `>= t`
/// against a query of popcount `c_q` must have popcount in this range.
///
/// `t <= 0` degenerates to "every bucket" (return-everything policy);
/// `t > 1` degenerates to "no bucket" (nothing can satisfy it).
fn bucket_range(c_q: u32, t: f64, bit_width: usize) -> (usize, usize) {
    if t <= 0.0 {
        return (0, bit_width + 1);
    }
    if t > 1.0 {
        return (0, 0);
    }
    let min = (t * c_q as f64).ceil() as usize;
    let raw_max = (c_q as f64 / t).floor() as usize;
    let max = raw_max.min(bit_width) + 1;
    (min.min(bit_width + 1), max)
}

pub struct CardinalityGrid {
    buckets: Vec<Option<Arc<MultibitTree>>>,
    bit_width: usize,
    size: usize,
    last_search_size: AtomicU64,
}

impl CardinalityGrid {
    /// Counting-sorts `fingerprints` into per-popcount buckets and
    /// dispatches one build task per non-empty bucket, then barriers.
    pub fn build(fingerprints: Vec<Fingerprint>, bit_width: usize, leaf_limit: usize, pool: &WorkerPool) -> Self {
        let size = fingerprints.len();

        let mut bucket_fps: Vec<Vec<Fingerprint>> = (0..=bit_width).map(|_| Vec::new()).collect();
        for fp in fingerprints {
            let c = (fp.popcount() as usize).min(bit_width);
            bucket_fps[c].push(fp);
        }

        let slots: Arc<Vec<Mutex<Option<Arc<MultibitTree>>>>> =
            Arc::new((0..=bit_width).map(|_| Mutex::new(None)).collect());

        for (c, fps) in bucket_fps.into_iter().enumerate() {
            if fps.is_empty() {
                continue;
            }
            let slots = Arc::clone(&slots);
            pool.dispatch(move || {
                let tree = MultibitTree::build(fps, c as u32, bit_width, leaf_limit);
                *slots[c].lock() = Some(Arc::new(tree));
            });
        }
        pool.wait();

        let slots = Arc::try_unwrap(slots).unwrap_or_else(|_| {
            unreachable!("pool.wait() guarantees every dispatched closure (and its Arc clone) has finished")
        });
        let buckets = slots.into_iter().map(|m| m.into_inner()).collect();

        Self { buckets, bit_width, size, last_search_size: AtomicU64::new(0) }
    }

    pub fn bit_width(&self) -> usize {
        self.bit_width
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_last_search_size(&self, n: u64) {
        self.last_search_size.store(n, Ordering::Relaxed);
    }

    fn bucket_trees_in_range(&self, c_q: u32, threshold: f64) -> Vec<Arc<MultibitTree>> {
        let (start, end) = bucket_range(c_q, threshold, self.bit_width);
        (start..end.min(self.bit_width + 1)).filter_map(|c| self.buckets.get(c).and_then(Clone::clone)).collect()
    }

    /// Per-query parallel: dispatches one search task per non-empty
    /// bucket in range, then barriers before returning.
    pub fn search(&self, query: &Fingerprint, threshold: f64, sink: &Arc<ResultSink>, pool: &WorkerPool) {
        let trees = self.bucket_trees_in_range(query.popcount(), threshold);
        let query = Arc::new(query.clone());
        for tree in trees {
            let query = Arc::clone(&query);
            let sink = Arc::clone(sink);
            pool.dispatch(move || tree.search(&query, threshold, &sink));
        }
        pool.wait();
    }

    /// Per-query serial, batch parallel: dispatches a single task that
    /// walks every in-range bucket for this one query, without barriering
    /// — the caller may submit the next query immediately. Parallelism
    /// comes from multiple queries in flight concurrently.
    pub fn search_async(&self, query: Fingerprint, threshold: f64, sink: Arc<ResultSink>, pool: &WorkerPool) {
        let trees = self.bucket_trees_in_range(query.popcount(), threshold);
        let query = Arc::new(query);
        pool.dispatch(move || {
            for tree in trees {
                tree.search(&query, threshold, &sink);
            }
        });
    }

    pub fn init_statistics(&self) {
        for tree in self.buckets.iter().flatten() {
            tree.init_counters();
        }
    }

    /// `(xor_hash_comparisons, exact_tanimoto_comparisons)` summed across
    /// every bucket's tree.
    pub fn statistics(&self) -> (u64, u64) {
        self.buckets.iter().flatten().map(|t| t.read_counters()).fold((0, 0), |acc, c| (acc.0 + c.0, acc.1 + c.1))
    }

    pub fn last_search_size(&self) -> u64 {
        self.last_search_size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkMode;
    use pretty_assertions::assert_eq;

    fn fp(id: &str, bits: &str) -> Fingerprint {
        Fingerprint::from_bit_str(id, bits)
    }

    #[test]
    fn bucket_range_excludes_nothing_for_non_positive_threshold() {
        assert_eq!(bucket_range(10, 0.0, 128), (0, 129));
        assert_eq!(bucket_range(10, -1.0, 128), (0, 129));
    }

    #[test]
    fn bucket_range_excludes_everything_above_one() {
        assert_eq!(bucket_range(10, 1.5, 128), (0, 0));
    }

    #[test]
    fn bucket_range_matches_the_worked_example() {
        // query popcount 10, t = 0.8 -> buckets [8, 13)
        assert_eq!(bucket_range(10, 0.8, 128), (8, 13));
    }

    #[test]
    fn partition_invariant_holds_after_build() {
        let pool = WorkerPool::new(2);
        let fps: Vec<_> = (0..50)
            .map(|i| {
                let bits = if i % 3 == 0 { "11110000" } else if i % 3 == 1 { "11111000" } else { "11000000" };
                fp(&i.to_string(), bits)
            })
            .collect();
        let expected_total = fps.len();
        let grid = CardinalityGrid::build(fps, 128, 2, &pool);
        assert_eq!(grid.size(), expected_total);

        let mut total = 0usize;
        for (c, bucket) in grid.buckets.iter().enumerate() {
            if let Some(tree) = bucket {
                assert_eq!(tree.cardinality() as usize, c);
                total += tree.len();
            }
        }
        assert_eq!(total, expected_total);
    }

    #[test]
    fn search_recall_matches_brute_force_across_buckets() {
        let pool = WorkerPool::new(4);
        let stored = vec![
            fp("a", "11111111"),
            fp("b", "11110000"),
            fp("c", "00001111"),
            fp("d", "11100000"),
            fp("e", "11111100"),
        ];
        let brute: Vec<_> = stored.clone();
        let grid = CardinalityGrid::build(stored, 128, 1, &pool);

        let query = fp("q", "11111111");
        let sink = Arc::new(ResultSink::new(SinkMode::Unsorted));
        grid.search(&query, 0.6, &sink, &pool);

        let mut got: Vec<String> = Arc::try_unwrap(sink).unwrap().drain().into_iter().map(|m| m.match_id.to_string()).collect();
        let mut expected: Vec<String> =
            brute.iter().filter(|p| query.tanimoto(p) >= 0.6).map(|p| p.id().to_string()).collect();
        got.sort();
        expected.sort();
        assert_eq!(got, expected);
    }
}
