use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::Error;
use crate::model::{Columns, Row};


/// A recoverable or fatal problem while pulling rows from a table file.
/// Skips carry enough context for the diagnostic sink; fatal errors refuse
/// the whole source.
#[derive(Debug)]
pub enum ReadError {
    Skip { line: u64, message: String },
    Fatal(Error),
}


/// Streams one table file as rows aligned with the unioned column layout.
///
/// The header line is consumed at construction; each subsequent record is
/// scattered into the full-width value vector with absent columns left as
/// the empty string. Rows carry the file path and file-local line number
/// for diagnostics plus a globally increasing sequence number that fixes
/// first-occurrence order for the deduplicator.
pub struct TsvReader<R: Read> {
    reader: csv::Reader<R>,
    /// file column index -> unioned layout index
    mapping: Vec<usize>,
    width: usize,
    sequence: Arc<AtomicU64>,
    rank: u32,
    source: Arc<str>,
    path: Arc<str>,
    line: u64,
    done: bool,
}

impl<R: Read> TsvReader<R> {
    pub fn new(
        reader: R,
        path: &Path,
        columns: &Columns,
        rank: u32,
        source: Arc<str>,
        sequence: Arc<AtomicU64>,
    ) -> Result<TsvReader<R>, Error> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .flexible(true)
            .from_reader(reader);

        // an empty file has no header and yields no rows
        let mapping = match reader.headers() {
            Ok(headers) => headers
                .iter()
                .map(|column| columns.position(column).unwrap_or(usize::MAX))
                .collect(),
            Err(_) => Vec::new(),
        };

        Ok(TsvReader {
            reader,
            done: mapping.is_empty(),
            mapping,
            width: columns.len(),
            sequence,
            rank,
            source,
            path: Arc::from(path.display().to_string()),
            line: 1,
        })
    }
}

impl<R: Read> Iterator for TsvReader<R> {
    type Item = Result<Row, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut record = csv::StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(false) => None,
            Ok(true) => {
                self.line += 1;

                // with quoting disabled an embedded tab always changes the
                // field count, so a mismatch covers that parse error too
                if record.len() != self.mapping.len() {
                    return Some(Err(ReadError::Skip {
                        line: self.line,
                        message: format!(
                            "expected {} fields, found {}",
                            self.mapping.len(),
                            record.len()
                        ),
                    }));
                }

                let mut values = vec![String::new(); self.width];
                for (idx, value) in record.iter().enumerate() {
                    let target = self.mapping[idx];
                    if target != usize::MAX {
                        values[target] = value.to_string();
                    }
                }

                Some(Ok(Row {
                    values,
                    seq: self.sequence.fetch_add(1, Ordering::Relaxed),
                    rank: self.rank,
                    source: self.source.clone(),
                    path: self.path.clone(),
                    line: self.line,
                }))
            }
            Err(err) => {
                // utf8 and field level problems are recoverable, io is not
                match err.kind() {
                    csv::ErrorKind::Io(_) => {
                        self.done = true;
                        Some(Err(ReadError::Fatal(err.into())))
                    }
                    _ => {
                        self.line += 1;
                        Some(Err(ReadError::Skip {
                            line: self.line,
                            message: err.to_string(),
                        }))
                    }
                }
            }
        }
    }
}
