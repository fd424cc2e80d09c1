use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::errors::Error;
use crate::model::Row;


/// Picks how many run files to slice a table into so the largest partition
/// is expected to fit the memory budget.
pub fn partition_count(input_bytes: u64, partition_bytes: u64) -> usize {
    let count = input_bytes.div_ceil(partition_bytes.max(1)).max(1);
    count.min(1024) as usize
}

/// Assigns a dedup key to a partition. The seed changes with recursion
/// depth so an oversized partition redistributes when split again.
pub fn partition_index(key: &str, count: usize, depth: u32) -> usize {
    (xxh3_64_with_seed(key.as_bytes(), depth as u64) % count as u64) as usize
}


/// A set of append-only run files, one per partition. Each file is owned by
/// its mutex so any worker can append while exactly one writer per
/// partition exists at a time.
pub struct PartitionSet {
    writers: Vec<Mutex<RunWriter>>,
}

struct RunWriter {
    writer: csv::Writer<BufWriter<File>>,
    path: PathBuf,
}

impl PartitionSet {
    pub fn create(dir: &Path, label: &str, count: usize) -> Result<PartitionSet, Error> {
        std::fs::create_dir_all(dir)?;

        let mut writers = Vec::with_capacity(count);
        for idx in 0..count {
            let path = dir.join(format!("{label}_p{idx:04}.run"));
            writers.push(Mutex::new(RunWriter {
                writer: run_writer(&path)?,
                path,
            }));
        }

        Ok(PartitionSet { writers })
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn append(&self, partition: usize, row: &Row) -> Result<(), Error> {
        let mut guard = self.writers[partition].lock().unwrap();
        write_row(&mut guard.writer, row)
    }

    /// Flushes every run file and returns their paths.
    pub fn finish(self) -> Result<Vec<PathBuf>, Error> {
        let mut paths = Vec::with_capacity(self.writers.len());
        for writer in self.writers {
            let mut guard = writer.into_inner().unwrap();
            guard.writer.flush()?;
            paths.push(guard.path);
        }
        Ok(paths)
    }
}


pub fn run_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>, Error> {
    let file = File::create(path)?;
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .has_headers(false)
        .from_writer(BufWriter::new(file)))
}

/// Serializes a row for spill: sequence number, source rank and source name
/// ahead of the value columns. Path and line are not carried past the
/// partitioner; diagnostics for a spilled row have already been emitted.
pub fn write_row(writer: &mut csv::Writer<BufWriter<File>>, row: &Row) -> Result<(), Error> {
    let mut record = csv::StringRecord::new();
    record.push_field(&row.seq.to_string());
    record.push_field(&row.rank.to_string());
    record.push_field(&row.source);
    for value in &row.values {
        record.push_field(value);
    }
    writer.write_record(&record)?;
    Ok(())
}


/// Streams rows back out of a run file.
pub struct RunReader {
    reader: csv::Reader<BufReader<File>>,
}

impl RunReader {
    pub fn open(path: &Path) -> Result<RunReader, Error> {
        let file = File::open(path)?;
        Ok(RunReader {
            reader: csv::ReaderBuilder::new()
                .delimiter(b'\t')
                .quoting(false)
                .has_headers(false)
                .flexible(true)
                .from_reader(BufReader::new(file)),
        })
    }
}

impl Iterator for RunReader {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = csv::StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(false) => None,
            Err(err) => Some(Err(err.into())),
            Ok(true) => {
                let seq = record.get(0).and_then(|v| v.parse().ok()).unwrap_or_default();
                let rank = record.get(1).and_then(|v| v.parse().ok()).unwrap_or_default();
                let source: Arc<str> = Arc::from(record.get(2).unwrap_or_default());
                let values = record.iter().skip(3).map(|value| value.to_string()).collect();

                Some(Ok(Row {
                    values,
                    seq,
                    rank,
                    source,
                    path: Arc::from(""),
                    line: 0,
                }))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_counts_scale_with_input() {
        assert_eq!(partition_count(0, 1024), 1);
        assert_eq!(partition_count(1024, 1024), 1);
        assert_eq!(partition_count(1025, 1024), 2);
        assert_eq!(partition_count(u64::MAX, 1), 1024);
    }

    #[test]
    fn partition_index_is_stable_and_depth_sensitive() {
        let a = partition_index("NCBITaxon:562", 16, 0);
        assert_eq!(partition_index("NCBITaxon:562", 16, 0), a);
        assert!(a < 16);

        // at least one key must move when the seed changes
        let moved = (0..100)
            .map(|n| format!("CHEBI:{n}"))
            .any(|key| partition_index(&key, 16, 0) != partition_index(&key, 16, 1));
        assert!(moved);
    }

    #[test]
    fn rows_round_trip_through_run_files() {
        let dir = tempfile::tempdir().unwrap();
        let set = PartitionSet::create(dir.path(), "nodes", 2).unwrap();

        let row = Row {
            values: vec!["CHEBI:1".to_string(), "biolink:ChemicalEntity".to_string(), String::new()],
            seq: 42,
            rank: 3,
            source: Arc::from("ontologies"),
            path: Arc::from("nodes.tsv"),
            line: 7,
        };
        set.append(1, &row).unwrap();
        let paths = set.finish().unwrap();

        let rows: Vec<Row> = RunReader::open(&paths[1])
            .unwrap()
            .map(|row| row.unwrap())
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].seq, 42);
        assert_eq!(rows[0].rank, 3);
        assert_eq!(rows[0].source.as_ref(), "ontologies");
        assert_eq!(rows[0].values, row.values);

        assert_eq!(RunReader::open(&paths[0]).unwrap().count(), 0);
    }
}
