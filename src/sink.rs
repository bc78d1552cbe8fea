//! `ResultSink` — thread-safe collection of `(queryId, matchId, score)`
//! triples, in one of three modes: unsorted, sorted by descending score,
//! or streamed directly to a writer as CSV.
//!
//! Both in-memory modes are arena-indexed `Vec`s addressed by index rather
//! than raw pointers.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A single delivered match.
#[derive(Clone, Debug, PartialEq)]
pub struct Match {
    pub query_id: Box<str>,
    pub match_id: Box<str>,
    pub score: f64,
}

/// Selects an in-memory collection mode. Streaming mode is selected via
/// [`ResultSink::new_streaming`] instead, since it additionally needs a
/// writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkMode {
    Unsorted,
    Sorted,
}

struct SortedNode {
    query_id: Box<str>,
    match_id: Box<str>,
    score: f64,
    left: Option<u32>,
    right: Option<u32>,
}

/// Unbalanced BST keyed by score, stored as an arena of nodes addressed
/// by index rather than raw child pointers.
///
/// Deliberately left unbalanced: expected score distributions give
/// near-logarithmic depth in practice, and a worst-case linear chain is
/// acceptable given how rarely it arises.
#[derive(Default)]
struct SortedTree {
    nodes: Vec<SortedNode>,
    root: Option<u32>,
}

impl SortedTree {
    /// Descends right while `stored.score >= new.score`, left otherwise.
    /// This leaves larger scores on the left spine, so a left-root-right
    /// in-order walk yields descending order directly.
    fn insert(&mut self, query_id: Box<str>, match_id: Box<str>, score: f64) {
        let new_idx = self.nodes.len() as u32;
        self.nodes.push(SortedNode { query_id, match_id, score, left: None, right: None });

        let Some(mut cur) = self.root else {
            self.root = Some(new_idx);
            return;
        };

        loop {
            let node = &self.nodes[cur as usize];
            if node.score >= score {
                match node.right {
                    Some(next) => cur = next,
                    None => {
                        self.nodes[cur as usize].right = Some(new_idx);
                        return;
                    }
                }
            } else {
                match node.left {
                    Some(next) => cur = next,
                    None => {
                        self.nodes[cur as usize].left = Some(new_idx);
                        return;
                    }
                }
            }
        }
    }

    fn in_order(&self) -> Vec<Match> {
        let mut out = Vec::with_capacity(self.nodes.len());
        if let Some(root) = self.root {
            self.walk(root, &mut out);
        }
        out
    }

    fn walk(&self, idx: u32, out: &mut Vec<Match>) {
        let node = &self.nodes[idx as usize];
        if let Some(left) = node.left {
            self.walk(left, out);
        }
        out.push(Match { query_id: node.query_id.clone(), match_id: node.match_id.clone(), score: node.score });
        if let Some(right) = node.right {
            self.walk(right, out);
        }
    }
}

enum Inner {
    Unsorted(Vec<Match>),
    Sorted(SortedTree),
    Streaming { writer: Box<dyn Write + Send>, separator: char, failed: bool },
}

/// Thread-safe sink; `add` is the only contention point at query time.
pub struct ResultSink {
    inner: Mutex<Inner>,
    size: AtomicU64,
    error: Mutex<Option<std::io::Error>>,
}

impl ResultSink {
    pub fn new(mode: SinkMode) -> Self {
        let inner = match mode {
            SinkMode::Unsorted => Inner::Unsorted(Vec::new()),
            SinkMode::Sorted => Inner::Sorted(SortedTree::default()),
        };
        Self { inner: Mutex::new(inner), size: AtomicU64::new(0), error: Mutex::new(None) }
    }

    /// Streaming mode: every `add` writes one CSV line directly through
    /// `writer`; no in-memory structure is built.
    pub fn new_streaming(writer: impl Write + Send + 'static, separator: char) -> Self {
        let inner = Inner::Streaming { writer: Box::new(writer), separator, failed: false };
        Self { inner: Mutex::new(inner), size: AtomicU64::new(0), error: Mutex::new(None) }
    }

    /// Atomic with respect to concurrent callers. The sink takes an owned
    /// copy of both ids; no reference to the originating fingerprint is
    /// retained.
    pub fn add(&self, query_id: &str, match_id: &str, score: f64) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Unsorted(v) => {
                v.push(Match { query_id: query_id.into(), match_id: match_id.into(), score });
            }
            Inner::Sorted(tree) => {
                tree.insert(query_id.into(), match_id.into(), score);
            }
            Inner::Streaming { writer, separator, failed } => {
                if *failed {
                    return;
                }
                let sep = *separator;
                if let Err(err) = writeln!(writer, "{query_id}{sep}{match_id}{sep}{score:.7}") {
                    *failed = true;
                    drop(inner);
                    *self.error.lock() = Some(err);
                    return;
                }
            }
        }
        self.size.fetch_add(1, Ordering::Relaxed);
    }

    /// Monotonically increasing; consistent with the number of successful
    /// adds once observed after a pool barrier.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Surfaces (and clears) the first write failure encountered in
    /// streaming mode.
    pub fn take_error(&self) -> Option<std::io::Error> {
        self.error.lock().take()
    }

    /// Consumes the sink, returning its matches in collection order
    /// (insertion order for unsorted, descending score for sorted).
    /// Streaming mode returns an empty vector — its matches were already
    /// written through the supplied writer.
    pub fn drain(self) -> Vec<Match> {
        match self.inner.into_inner() {
            Inner::Unsorted(v) => v,
            Inner::Sorted(tree) => tree.in_order(),
            Inner::Streaming { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unsorted_preserves_all_adds() {
        let sink = ResultSink::new(SinkMode::Unsorted);
        sink.add("q", "a", 0.9);
        sink.add("q", "b", 0.4);
        sink.add("q", "c", 0.7);
        assert_eq!(sink.size(), 3);
        assert_eq!(sink.drain().len(), 3);
    }

    #[test]
    fn sorted_yields_non_increasing_order() {
        let sink = ResultSink::new(SinkMode::Sorted);
        sink.add("q", "a", 0.4);
        sink.add("q", "b", 0.9);
        sink.add("q", "c", 0.7);
        sink.add("q", "d", 0.9);
        let scores: Vec<f64> = sink.drain().into_iter().map(|m| m.score).collect();
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(scores, sorted);
    }

    #[test]
    fn sorted_and_unsorted_collect_the_same_set() {
        let pairs = [("a", 0.4), ("b", 0.9), ("c", 0.7), ("d", 0.9), ("e", 0.1)];

        let unsorted = ResultSink::new(SinkMode::Unsorted);
        let sorted = ResultSink::new(SinkMode::Sorted);
        for (id, score) in pairs {
            unsorted.add("q", id, score);
            sorted.add("q", id, score);
        }

        let mut a: Vec<(String, String)> =
            unsorted.drain().into_iter().map(|m| (m.query_id.to_string(), m.match_id.to_string())).collect();
        let mut b: Vec<(String, String)> =
            sorted.drain().into_iter().map(|m| (m.query_id.to_string(), m.match_id.to_string())).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn streaming_writes_csv_with_seven_fractional_digits() {
        let buf: Vec<u8> = Vec::new();
        let sink = ResultSink::new_streaming(buf, ',');
        sink.add("q1", "p1", 0.5);
        assert_eq!(sink.size(), 1);
        assert!(sink.take_error().is_none());
    }

    #[test]
    fn streaming_surfaces_write_failures() {
        struct FailingWriter;
        impl Write for FailingWriter {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk full"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink = ResultSink::new_streaming(FailingWriter, ',');
        sink.add("q1", "p1", 0.5);
        assert_eq!(sink.size(), 0);
        assert!(sink.take_error().is_some());
    }
}
