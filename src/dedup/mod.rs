pub mod partition;
pub mod priority;

use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::errors::Error;
use crate::model::{split_values, Columns, Row, TableKind, SET_VALUED_COLUMNS};
use crate::utils::CancelToken;
use partition::{partition_index, RunReader};
use priority::{DedupRules, Priority};


/// How many ways an oversized partition is split when it has to be
/// re-partitioned, and how deep that recursion may go before the engine
/// accepts the partition as-is.
const SUBSPLIT: usize = 8;
const MAX_DEPTH: u32 = 6;


/// Totals produced while emitting the merged table.
#[derive(Debug, Default)]
pub struct TableTotals {
    pub rows: u64,
    /// Dedup winners per source name.
    pub contributions: HashMap<String, u64>,
}


/// Merges a table's run files into the final deduplicated output.
///
/// Each partition resolves independently: rows are accumulated per key,
/// keeping the priority winner and unioning set-valued fields, and the
/// partition's winners are written back to disk ordered by first
/// occurrence. A final k-way merge interleaves the partition winner
/// streams so the output is stable with respect to the first occurrence
/// of each key in the input. Rows from refused sources are excluded even
/// when the refusal happened after their table was already partitioned.
#[allow(clippy::too_many_arguments)]
pub fn merge_table(
    kind: TableKind,
    columns: &Columns,
    rules: &DedupRules,
    run_files: Vec<PathBuf>,
    budget: u64,
    out_path: &Path,
    refused: &HashSet<String>,
    cancel: &CancelToken,
) -> Result<TableTotals, Error> {
    let winner_files: Vec<Vec<PathBuf>> = run_files
        .par_iter()
        .map(|path| merge_run(kind, columns, rules, path, budget, 0, refused, cancel))
        .collect::<Result<_, Error>>()?;
    let winner_files: Vec<PathBuf> = winner_files.into_iter().flatten().collect();

    cancel.check()?;
    let totals = emit_winners(columns, &winner_files, out_path)?;

    for path in winner_files {
        std::fs::remove_file(path)?;
    }

    info!(table = kind.label(), rows = totals.rows, "Merged table written");
    Ok(totals)
}


/// Resolves one run file into winner files sorted by first occurrence.
/// A run over the memory budget is hash-split with a depth-specific seed
/// and each child resolved recursively.
#[allow(clippy::too_many_arguments)]
fn merge_run(
    kind: TableKind,
    columns: &Columns,
    rules: &DedupRules,
    path: &Path,
    budget: u64,
    depth: u32,
    refused: &HashSet<String>,
    cancel: &CancelToken,
) -> Result<Vec<PathBuf>, Error> {
    cancel.check()?;

    let size = std::fs::metadata(path)?.len();
    if size > budget && depth < MAX_DEPTH {
        return split_run(kind, columns, rules, path, budget, depth + 1, refused, cancel);
    }
    if size > budget {
        warn!(path = %path.display(), size, budget, "Partition still over budget, accumulating anyway");
    }

    let mut table: HashMap<String, Tentative> = HashMap::new();
    let set_columns = set_value_positions(kind, columns);

    for row in RunReader::open(path)? {
        let row = row?;
        if refused.contains(row.source.as_ref()) {
            continue;
        }
        let Some(key) = rules.key(kind, &row, columns) else {
            continue;
        };
        let priority = rules.priority(kind, &row, columns);

        match table.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(Tentative::new(row, priority, &set_columns));
            }
            Entry::Occupied(mut entry) => entry.get_mut().observe(row, priority, &set_columns),
        }
    }

    let mut winners: Vec<Row> = table
        .into_values()
        .map(|tentative| tentative.finish(&set_columns, rules.preserve_value_order))
        .collect();
    winners.sort_by_key(|row| row.seq);

    let winners_path = path.with_extension("winners");
    let mut writer = partition::run_writer(&winners_path)?;
    for row in &winners {
        partition::write_row(&mut writer, row)?;
    }
    writer.flush()?;

    std::fs::remove_file(path)?;
    Ok(vec![winners_path])
}

#[allow(clippy::too_many_arguments)]
fn split_run(
    kind: TableKind,
    columns: &Columns,
    rules: &DedupRules,
    path: &Path,
    budget: u64,
    depth: u32,
    refused: &HashSet<String>,
    cancel: &CancelToken,
) -> Result<Vec<PathBuf>, Error> {
    info!(path = %path.display(), depth, "Re-partitioning oversized run file");

    let mut children = Vec::with_capacity(SUBSPLIT);
    for idx in 0..SUBSPLIT {
        let child = path.with_extension(format!("d{depth}s{idx}.run"));
        children.push((partition::run_writer(&child)?, child));
    }

    for row in RunReader::open(path)? {
        let row = row?;
        let Some(key) = rules.key(kind, &row, columns) else {
            continue;
        };
        let idx = partition_index(&key, SUBSPLIT, depth);
        partition::write_row(&mut children[idx].0, &row)?;
    }

    let mut paths = Vec::with_capacity(SUBSPLIT);
    for (mut writer, child) in children {
        writer.flush()?;
        paths.push(child);
    }
    std::fs::remove_file(path)?;

    let mut winners = Vec::new();
    for child in paths {
        winners.extend(merge_run(kind, columns, rules, &child, budget, depth, refused, cancel)?);
    }
    Ok(winners)
}


/// Positions of the set-valued columns for this table kind.
fn set_value_positions(kind: TableKind, columns: &Columns) -> Vec<usize> {
    match kind {
        TableKind::Edges => Vec::new(),
        TableKind::Nodes => SET_VALUED_COLUMNS
            .iter()
            .filter_map(|name| columns.position(name))
            .collect(),
    }
}


/// The per-key accumulator: the current priority winner plus the unioned
/// set-valued fields of every row observed under the key.
struct Tentative {
    winner: Row,
    priority: Priority,
    first_seq: u64,
    sets: Vec<SetUnion>,
}

impl Tentative {
    fn new(row: Row, priority: Priority, set_columns: &[usize]) -> Tentative {
        let mut sets: Vec<SetUnion> = set_columns.iter().map(|_| SetUnion::default()).collect();
        for (set, idx) in sets.iter_mut().zip(set_columns) {
            set.extend(&row.values[*idx]);
        }

        Tentative {
            first_seq: row.seq,
            winner: row,
            priority,
            sets,
        }
    }

    fn observe(&mut self, row: Row, priority: Priority, set_columns: &[usize]) {
        for (set, idx) in self.sets.iter_mut().zip(set_columns) {
            set.extend(&row.values[*idx]);
        }

        self.first_seq = self.first_seq.min(row.seq);
        if (&priority, row.seq) < (&self.priority, self.winner.seq) {
            self.winner = row;
            self.priority = priority;
        }
    }

    fn finish(mut self, set_columns: &[usize], preserve_order: bool) -> Row {
        for (set, idx) in self.sets.into_iter().zip(set_columns) {
            self.winner.values[*idx] = set.join(preserve_order);
        }
        // the emitted sequence is the key's first occurrence so downstream
        // ordering is independent of which row won
        self.winner.seq = self.first_seq;
        self.winner
    }
}


/// Set-union of one multi-valued field, remembering first-seen order.
#[derive(Default)]
struct SetUnion {
    seen: std::collections::HashSet<String>,
    order: Vec<String>,
}

impl SetUnion {
    fn extend(&mut self, field: &str) {
        for value in split_values(field) {
            if self.seen.insert(value.to_string()) {
                self.order.push(value.to_string());
            }
        }
    }

    fn join(self, preserve_order: bool) -> String {
        let mut values = self.order;
        if !preserve_order {
            values.sort();
        }
        values.join("|")
    }
}


/// Interleaves the partition winner streams by first-occurrence sequence
/// and writes the final table, header first.
fn emit_winners(columns: &Columns, winner_files: &[PathBuf], out_path: &Path) -> Result<TableTotals, Error> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(out_path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .from_writer(BufWriter::new(file));
    writer.write_record(columns.names())?;

    let mut streams = Vec::with_capacity(winner_files.len());
    let mut heap = BinaryHeap::new();
    for (idx, path) in winner_files.iter().enumerate() {
        let mut reader = RunReader::open(path)?;
        if let Some(row) = reader.next() {
            let row = row?;
            heap.push(std::cmp::Reverse((row.seq, idx)));
            streams.push((reader, Some(row)));
        }
        else {
            streams.push((reader, None));
        }
    }

    let mut totals = TableTotals::default();
    while let Some(std::cmp::Reverse((_, idx))) = heap.pop() {
        let (reader, head) = &mut streams[idx];
        let row = head.take().expect("winner stream out of sync with heap");

        writer.write_record(&row.values)?;
        totals.rows += 1;
        *totals.contributions.entry(row.source.to_string()).or_default() += 1;

        if let Some(next) = reader.next() {
            let next = next?;
            heap.push(std::cmp::Reverse((next.seq, idx)));
            *head = Some(next);
        }
    }

    writer.flush()?;
    Ok(totals)
}
