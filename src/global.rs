//! `GlobalEngine` — a thin singleton façade over [`Engine`] for callers
//! that want an "at most one loaded dataset" model. [`Engine`] itself
//! carries no hidden global state; this module is the only place that does.

use parking_lot::Mutex;

use crate::engine::{Engine, EngineConfig, SearchResult, Statistics};
use crate::loader::InMemoryRecord;
use crate::{Error, Result};

static ENGINE: Mutex<Option<Engine>> = Mutex::new(None);

pub struct GlobalEngine;

impl GlobalEngine {
    /// Replaces any prior loaded engine: a second load implicitly unloads
    /// the first.
    pub fn load_records(config: EngineConfig, records: Vec<InMemoryRecord>) -> Result<u64> {
        let mut engine = Engine::new(config);
        let n = engine.load_records(records)?;
        *ENGINE.lock() = Some(engine);
        Ok(n)
    }

    pub fn search(query_bits: &str, threshold: f64, limit: Option<usize>, sort: bool) -> Result<SearchResult> {
        let guard = ENGINE.lock();
        let engine = guard.as_ref().ok_or(Error::NotLoaded)?;
        engine.search(query_bits, threshold, limit, sort)
    }

    pub fn unload() {
        ENGINE.lock().take();
    }

    pub fn is_loaded() -> bool {
        ENGINE.lock().is_some()
    }

    pub fn statistics() -> Statistics {
        ENGINE.lock().as_ref().map(Engine::statistics).unwrap_or(Statistics {
            labels: ["XOR-Hash", "Tanimoto", "Total"],
            counts: [0, 0, 0],
            percentages: [0.0; 3],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_load_replaces_the_first() {
        let records_a = vec![InMemoryRecord::new(Some("a".into()), "11110000".into())];
        let records_b = vec![InMemoryRecord::new(Some("b".into()), "00001111".into())];

        GlobalEngine::load_records(EngineConfig::default(), records_a).unwrap();
        assert!(GlobalEngine::is_loaded());

        GlobalEngine::load_records(EngineConfig::default(), records_b).unwrap();
        let result = GlobalEngine::search("00001111", 1.0, None, true).unwrap();
        assert_eq!(result.ids, vec!["b".to_string()]);

        GlobalEngine::unload();
        assert!(!GlobalEngine::is_loaded());
    }
}
