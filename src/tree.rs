//! `MultibitTree` — a binary tree over one cardinality bucket whose inner
//! nodes carry "match bits" (bit positions uniform across the subtree),
//! used to derive a lower bound on the Tanimoto coefficient with any query
//! and prune whole subtrees.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::fingerprint::Fingerprint;
use crate::sink::ResultSink;

/// Inline storage for a node's match-bit list: most nodes resolve only a
/// handful of bits before finding a split, so the common case never
/// touches the heap.
type MatchBits = SmallVec<[u32; 8]>;

/// A node in the flat node pool, addressed by its index: a tagged enum
/// rather than parallel child-index arrays with dual-purposed leaf fields.
#[derive(Debug)]
pub enum Node {
    Inner {
        left: u32,
        right: u32,
        /// Bits that are 0 across every fingerprint in this subtree.
        match_zeros: MatchBits,
        /// Bits that are 1 across every fingerprint in this subtree.
        match_ones: MatchBits,
    },
    Leaf {
        start: u32,
        end: u32,
    },
}

/// Tracks which bit positions have already been claimed as match bits by
/// an ancestor, so a node never recomputes a bit its parent already
/// resolved.
#[derive(Clone)]
struct UsedBits(Vec<u64>);

impl UsedBits {
    fn new(bit_width: usize) -> Self {
        Self(vec![0u64; bit_width.div_ceil(64)])
    }

    #[inline]
    fn contains(&self, i: usize) -> bool {
        (self.0[i / 64] >> (i % 64)) & 1 != 0
    }

    #[inline]
    fn insert(&mut self, i: usize) {
        self.0[i / 64] |= 1u64 << (i % 64);
    }
}

/// One cardinality bucket's tree: a pool of fingerprints, all sharing a
/// common popcount, and the node pool built over them.
pub struct MultibitTree {
    nodes: Vec<Node>,
    fingerprints: Vec<Fingerprint>,
    cardinality: u32,
    cnt_xor: AtomicU64,
    cnt_tanimoto: AtomicU64,
}

impl MultibitTree {
    /// Build a tree over `fingerprints`, all of which must share popcount
    /// `cardinality`. Consumes and permutes the vector in place so leaf
    /// ranges are contiguous.
    pub fn build(
        mut fingerprints: Vec<Fingerprint>,
        cardinality: u32,
        bit_width: usize,
        leaf_limit: usize,
    ) -> Self {
        let len = fingerprints.len();
        let mut nodes = Vec::with_capacity((2 * len).saturating_sub(1).max(1));
        let used = UsedBits::new(bit_width);
        if len > 0 {
            build_node(&mut nodes, &mut fingerprints, 0, len, bit_width, leaf_limit, &used);
        } else {
            nodes.push(Node::Leaf { start: 0, end: 0 });
        }

        Self {
            nodes,
            fingerprints,
            cardinality,
            cnt_xor: AtomicU64::new(0),
            cnt_tanimoto: AtomicU64::new(0),
        }
    }

    pub fn cardinality(&self) -> u32 {
        self.cardinality
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Full recursive descent for one query.
    pub fn search(&self, query: &Fingerprint, threshold: f64, sink: &ResultSink) {
        if self.fingerprints.is_empty() {
            return;
        }
        let c_q = query.popcount();
        let ab = c_q + self.cardinality;
        self.descend(0, query, threshold, ab, c_q, self.cardinality, 0, sink);
    }

    #[allow(clippy::too_many_arguments)]
    fn descend(
        &self,
        node_idx: u32,
        query: &Fingerprint,
        t: f64,
        ab: u32,
        query_unmatched: u32,
        tree_unmatched: u32,
        common_xor: u32,
        sink: &ResultSink,
    ) {
        match &self.nodes[node_idx as usize] {
            Node::Leaf { start, end } => {
                for fp in &self.fingerprints[*start as usize..*end as usize] {
                    self.cnt_xor.fetch_add(1, Ordering::Relaxed);
                    let estimate = query.tanimoto_xor(fp, ab);
                    if estimate < t {
                        continue;
                    }
                    self.cnt_tanimoto.fetch_add(1, Ordering::Relaxed);
                    let exact = query.tanimoto(fp);
                    if exact >= t {
                        sink.add(query.id(), fp.id(), exact);
                    }
                }
            }
            Node::Inner { left, right, match_zeros, match_ones } => {
                let count_ones = match_zeros.iter().filter(|&&b| query.bit(b as usize)).count() as u32;
                let count_zeros = match_ones.iter().filter(|&&b| !query.bit(b as usize)).count() as u32;

                let common_xor = common_xor + count_ones + count_zeros;
                let qu = query_unmatched - count_ones;
                let tu = tree_unmatched - count_zeros;

                let denom = common_xor + qu.max(tu);
                let bound = if denom == 0 { 0.0 } else { qu.min(tu) as f64 / denom as f64 };
                if bound < t {
                    return;
                }

                self.descend(*left, query, t, ab, qu, tu, common_xor, sink);
                self.descend(*right, query, t, ab, qu, tu, common_xor, sink);
            }
        }
    }

    pub fn init_counters(&self) {
        self.cnt_xor.store(0, Ordering::Relaxed);
        self.cnt_tanimoto.store(0, Ordering::Relaxed);
    }

    /// `(xor_hash_comparisons, exact_tanimoto_comparisons)`.
    pub fn read_counters(&self) -> (u64, u64) {
        (self.cnt_xor.load(Ordering::Relaxed), self.cnt_tanimoto.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    fn leaf_ranges(&self) -> Vec<(u32, u32)> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                Node::Leaf { start, end } => Some((*start, *end)),
                Node::Inner { .. } => None,
            })
            .collect()
    }
}

fn build_node(
    nodes: &mut Vec<Node>,
    fps: &mut [Fingerprint],
    s: usize,
    e: usize,
    bit_width: usize,
    leaf_limit: usize,
    used: &UsedBits,
) -> u32 {
    let len = e - s;

    if len < leaf_limit {
        let idx = nodes.len() as u32;
        nodes.push(Node::Leaf { start: s as u32, end: e as u32 });
        return idx;
    }

    let mut zeros = MatchBits::new();
    let mut ones = MatchBits::new();
    let mut new_used = used.clone();
    let mut split_bit: Option<u32> = None;
    let mut split_diff = f64::INFINITY;

    for i in 0..bit_width {
        if used.contains(i) {
            continue;
        }
        let n_i = fps[s..e].iter().filter(|fp| fp.bit(i)).count();
        if n_i == 0 {
            zeros.push(i as u32);
            new_used.insert(i);
        } else if n_i == len {
            ones.push(i as u32);
            new_used.insert(i);
        } else {
            let diff = (n_i as f64 - len as f64 / 2.0).abs();
            if diff < split_diff {
                split_diff = diff;
                split_bit = Some(i as u32);
            }
        }
    }

    let Some(bit) = split_bit else {
        let idx = nodes.len() as u32;
        nodes.push(Node::Leaf { start: s as u32, end: e as u32 });
        return idx;
    };

    let mid = s + partition_by_bit(&mut fps[s..e], bit);

    let my_idx = nodes.len() as u32;
    nodes.push(Node::Leaf { start: 0, end: 0 }); // placeholder, overwritten below

    let left_used = new_used.clone();
    let left = build_node(nodes, fps, s, mid, bit_width, leaf_limit, &left_used);
    let right = build_node(nodes, fps, mid, e, bit_width, leaf_limit, &new_used);

    nodes[my_idx as usize] = Node::Inner {
        left,
        right,
        match_zeros: zeros,
        match_ones: ones,
    };
    my_idx
}

/// Partitions `slice` in place so fingerprints with `bit` clear come
/// first; returns the split index (count of "bit clear" fingerprints).
fn partition_by_bit(slice: &mut [Fingerprint], bit: u32) -> usize {
    let mut i = 0;
    let mut j = slice.len();
    while i < j {
        if !slice[i].bit(bit as usize) {
            i += 1;
        } else {
            j -= 1;
            slice.swap(i, j);
        }
    }
    i
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
    fn leaf_limit_is_strict_less_than() {
        // Two fingerprints, leaf_limit = 2: 2 < 2 is false, so this must split
        // (or fall back to a leaf only if no splitting bit exists).
        let fps = vec![fp("a", "1100"), fp("b", "0011")];
        let tree = MultibitTree::build(fps, 2, 128, 2);
        assert_eq!(tree.leaf_ranges().iter().map(|(s, e)| e - s).sum::<u32>(), 2);
    }

    #[test]
    fn single_fingerprint_below_leaf_limit_is_one_leaf() {
        let fps = vec![fp("a", "1100")];
        let tree = MultibitTree::build(fps, 2, 128, 4);
        let ranges = tree.leaf_ranges();
        assert_eq!(ranges, vec![(0, 1)]);
    }

    #[test]
    fn tree_cover_partitions_exactly_the_input_slice() {
        let fps: Vec<_> = (0..37)
            .map(|i| fp(&i.to_string(), if i % 2 == 0 { "110011000" } else { "110011001" }))
            .collect();
        let n = fps.len();
        let tree = MultibitTree::build(fps, 4, 128, 2);

        let mut ranges = tree.leaf_ranges();
        ranges.sort();
        let mut covered = 0u32;
        for (s, e) in &ranges {
            assert_eq!(*s, covered, "leaf ranges must be contiguous");
            covered = *e;
        }
        assert_eq!(covered as usize, n);
    }

    #[test]
    fn search_recall_matches_brute_force() {
        let stored = vec![
            fp("a", "11111111"),
            fp("b", "11110000"),
            fp("c", "00001111"),
            fp("d", "11100000"),
        ];
        let cardinality = 4;
        let tree = MultibitTree::build(stored.clone(), cardinality, 128, 1);

        let query = fp("q", "11111111");
        let sink = ResultSink::new(SinkMode::Sorted);
        tree.search(&query, 0.5, &sink);

        let expected: Vec<_> = stored
            .iter()
            .filter(|p| query.tanimoto(p) >= 0.5)
            .map(|p| p.id().to_string())
            .collect();

        let got: Vec<_> = sink.drain().into_iter().map(|m| m.match_id).collect();
        let mut got_sorted = got.clone();
        got_sorted.sort();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort();
        assert_eq!(got_sorted, expected_sorted);
    }

    #[test]
    fn counters_start_at_zero_and_are_idempotently_resettable() {
        let fps = vec![fp("a", "1111")];
        let tree = MultibitTree::build(fps, 4, 128, 1);
        assert_eq!(tree.read_counters(), (0, 0));
        tree.init_counters();
        assert_eq!(tree.read_counters(), (0, 0));
    }
}
