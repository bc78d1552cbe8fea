//! Default tokenizing loader plus the `RecordSource` contract the engine
//! depends on. The engine itself only consumes already-parsed records;
//! this loader exists so the crate can be exercised end-to-end from raw
//! text without a separate ingestion tool.

use std::io::BufRead;

const SEPARATORS: [char; 6] = ['"', '\'', ',', ';', ' ', '\t'];

/// One not-yet-ingested record: an optional caller-supplied identifier
/// and a bit string.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InMemoryRecord {
    pub id: Option<Box<str>>,
    pub bits: Box<str>,
}

impl InMemoryRecord {
    pub fn new(id: Option<String>, bits: String) -> Self {
        Self { id: id.map(String::into_boxed_str), bits: bits.into_boxed_str() }
    }
}

/// An external source of records the engine can load from. `load_records`
/// accepts an already-materialized `Vec<InMemoryRecord>` directly; this
/// trait exists for collaborators that parse records from somewhere else
/// (a file, a socket) before the engine ever sees them.
pub trait RecordSource {
    fn read_all(self) -> crate::Result<Vec<InMemoryRecord>>;
}

/// Splits a line into 0, 1, or 2 fields on any separator in
/// `"`, `'`, `,`, `;`, space, tab, truncating at the first embedded NUL.
///
/// Returns `None` for a line with zero non-empty fields (malformed,
/// skipped by the caller); one field is treated as `(None, bits)`; two
/// fields as `(Some(id), bits)`.
pub(crate) fn parse_line(line: &str) -> Option<(Option<Box<str>>, Box<str>)> {
    let line = match line.find('\0') {
        Some(nul) => &line[..nul],
        None => line,
    };
    let mut fields = line.split(|c| SEPARATORS.contains(&c)).filter(|s| !s.is_empty());
    let first = fields.next()?;
    match fields.next() {
        Some(second) => Some((Some(first.into()), second.into())),
        None => Some((None, first.into())),
    }
}

/// Line-oriented loader over any [`std::io::Read`].
pub struct LineLoader<R> {
    reader: std::io::BufReader<R>,
}

impl LineLoader<std::fs::File> {
    pub fn open(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| crate::Error::InputUnreadable(e.to_string()))?;
        Ok(Self { reader: std::io::BufReader::new(file) })
    }
}

impl<R: std::io::Read> LineLoader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader: std::io::BufReader::new(reader) }
    }
}

impl<R: std::io::Read> RecordSource for LineLoader<R> {
    fn read_all(mut self) -> crate::Result<Vec<InMemoryRecord>> {
        let mut out = Vec::new();
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = self.reader.read_line(&mut buf).map_err(|e| crate::Error::InputUnreadable(e.to_string()))?;
            if n == 0 {
                break;
            }
            let line = buf.trim_end_matches(['\n', '\r']);
            if let Some((id, bits)) = parse_line(line) {
                out.push(InMemoryRecord { id, bits });
            }
        }
        Ok(out)
    }
}
