use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::prelude::*;
use tracing::info;

use crate::canon::{CanonOutcome, Canonicalizer};
use crate::chains;
use crate::config::{Config, SourceConfig};
use crate::dedup;
use crate::dedup::partition::{partition_count, partition_index, PartitionSet};
use crate::dedup::priority::DedupRules;
use crate::diagnostics::{DiagnosticBatch, DiagnosticSink};
use crate::errors::Error;
use crate::model::{Columns, Row, TableKind};
use crate::readers;
use crate::readers::tsv::{ReadError, TsvReader};
use crate::stats::{self, SourceContribution, StatsDocument};
use crate::utils::{CancelToken, MergeBars};


/// Bound on every inter-stage queue. A full queue blocks the producer so
/// peak memory stays independent of input size.
const QUEUE_DEPTH: usize = 4096;


/// Restricts a run to re-emitting part of an existing merge.
#[derive(Debug, Clone)]
pub enum Only {
    Stats,
    Chain(String),
}

#[derive(Debug, Default)]
pub struct MergeOptions {
    pub only: Option<Only>,
    pub resume: bool,
    pub force_resume: bool,
    pub strict: bool,
}


pub fn run(config: &Config, options: &MergeOptions, cancel: &CancelToken) -> Result<(), Error> {
    match &options.only {
        Some(Only::Stats) => reemit_stats(config),
        Some(Only::Chain(name)) => rerun_chain(config, name, cancel),
        None => full_merge(config, options, cancel),
    }
}


fn full_merge(config: &Config, options: &MergeOptions, cancel: &CancelToken) -> Result<(), Error> {
    let spill = &config.memory.spill_dir;
    prepare_spill(spill, options)?;

    let sink = DiagnosticSink::new();
    let canonicalizer = Canonicalizer::new(&config.canon);
    let rules = DedupRules::new(&config.dedup);
    let refused: Mutex<HashSet<String>> = Mutex::new(HashSet::new());

    // both tables are staged before either is merged so a source refused
    // while reading its edges is excluded from the node merge as well
    let node_bars = MergeBars::new("nodes");
    let nodes = stage_table(TableKind::Nodes, config, &canonicalizer, &rules, &sink, &refused, options.resume, cancel, &node_bars)?;
    let edge_bars = MergeBars::new("edges");
    let edges = stage_table(TableKind::Edges, config, &canonicalizer, &rules, &sink, &refused, options.resume, cancel, &edge_bars)?;

    let refused = refused.into_inner().unwrap();

    let node_totals = dedup::merge_table(
        TableKind::Nodes,
        &nodes.columns,
        &rules,
        nodes.run_files,
        config.memory.partition_bytes,
        &config.output.node_path(),
        &refused,
        cancel,
    )?;
    node_bars.winners.inc(node_totals.rows);
    node_bars.finish();

    let edge_totals = dedup::merge_table(
        TableKind::Edges,
        &edges.columns,
        &rules,
        edges.run_files,
        config.memory.partition_bytes,
        &config.output.edge_path(),
        &refused,
        cancel,
    )?;
    edge_bars.winners.inc(edge_totals.rows);
    edge_bars.finish();

    // derived chain tables are independent of one another
    config
        .chains
        .par_iter()
        .map(|chain| {
            chains::run_chain(
                chain,
                &config.output.edge_path(),
                spill,
                config.memory.partition_bytes,
                &config.output.dir,
                &config.output.chain_file_prefix,
                cancel,
            )
            .map(|_| ())
        })
        .collect::<Result<Vec<()>, Error>>()?;

    let dangling = stats::count_dangling(&config.output.node_path(), &config.output.edge_path())?;
    sink.add_dangling_refs(dangling);

    let document = StatsDocument {
        generated_at: chrono::Utc::now().to_rfc3339(),
        nodes: stats::collect_table(&config.output.node_path(), &config.stats.node_facets)?,
        edges: stats::collect_table(&config.output.edge_path(), &config.stats.edge_facets)?,
        sources: contributions(config, &node_totals, &edge_totals),
        diagnostics: sink.snapshot(),
    };
    stats::write_stats(&config.output.stats_path(), &document)?;

    cleanup_spill(spill)?;

    if options.strict && dangling > 0 {
        return Err(Error::DanglingReferences { count: dangling });
    }
    let refused = document.diagnostics.refused_sources.len();
    if refused > 0 {
        return Err(Error::PartialFailure {
            refused,
            total: config.sources.len(),
        });
    }

    info!("Merge complete");
    Ok(())
}


/// Recomputes the statistics document from the merged tables on disk. The
/// per-source contribution section is only observable during dedup, so the
/// previous run's section is carried over when a stats file exists.
fn reemit_stats(config: &Config) -> Result<(), Error> {
    let (sources, mut diagnostics) = match stats::load_document(&config.output.stats_path()) {
        Some(previous) => (previous.sources, previous.diagnostics),
        None => Default::default(),
    };
    diagnostics.dangling_refs =
        stats::count_dangling(&config.output.node_path(), &config.output.edge_path())?;

    let document = StatsDocument {
        generated_at: chrono::Utc::now().to_rfc3339(),
        nodes: stats::collect_table(&config.output.node_path(), &config.stats.node_facets)?,
        edges: stats::collect_table(&config.output.edge_path(), &config.stats.edge_facets)?,
        sources,
        diagnostics,
    };
    stats::write_stats(&config.output.stats_path(), &document)
}

fn rerun_chain(config: &Config, name: &str, cancel: &CancelToken) -> Result<(), Error> {
    let chain = config.chain(name)?;
    chains::run_chain(
        chain,
        &config.output.edge_path(),
        &config.memory.spill_dir,
        config.memory.partition_bytes,
        &config.output.dir,
        &config.output.chain_file_prefix,
        cancel,
    )?;
    std::fs::remove_dir_all(config.memory.spill_dir.join("chains")).ok();
    Ok(())
}


/// Refuses to run over a stale spill directory unless the caller opted in.
fn prepare_spill(spill: &Path, options: &MergeOptions) -> Result<(), Error> {
    if spill.exists() && spill.read_dir()?.next().is_some() {
        if options.force_resume {
            info!(spill = %spill.display(), "Discarding stale spill directory");
            std::fs::remove_dir_all(spill)?;
        }
        else if !options.resume {
            return Err(Error::StaleSpill(spill.to_path_buf()));
        }
    }
    std::fs::create_dir_all(spill)?;
    Ok(())
}

fn cleanup_spill(spill: &Path) -> Result<(), Error> {
    match std::fs::remove_dir_all(spill) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}


fn contributions(
    config: &Config,
    node_totals: &dedup::TableTotals,
    edge_totals: &dedup::TableTotals,
) -> Vec<SourceContribution> {
    let mut sources: Vec<SourceContribution> = config
        .sources
        .iter()
        .map(|source| SourceContribution {
            name: source.name.clone(),
            rank: source.rank,
            nodes: node_totals.contributions.get(&source.name).copied().unwrap_or_default(),
            edges: edge_totals.contributions.get(&source.name).copied().unwrap_or_default(),
        })
        .collect();
    sources.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.name.cmp(&b.name)));
    sources
}


/// One ingested table: the unioned column layout and the partition run
/// files holding every canonicalized row.
struct StagedTable {
    columns: Columns,
    run_files: Vec<PathBuf>,
}

struct ResolvedSource {
    name: Arc<str>,
    rank: u32,
    files: Vec<PathBuf>,
}

/// Streams one table kind from every source through the canonicalizer pool
/// into hash-partitioned run files.
///
/// Readers run one thread per source so row order within a source is
/// preserved; the canonicalizer and partitioner pools are free to
/// interleave because every row carries its arrival sequence number.
#[allow(clippy::too_many_arguments)]
fn stage_table(
    kind: TableKind,
    config: &Config,
    canonicalizer: &Canonicalizer,
    rules: &DedupRules,
    sink: &DiagnosticSink,
    refused: &Mutex<HashSet<String>>,
    resume: bool,
    cancel: &CancelToken,
    bars: &MergeBars,
) -> Result<StagedTable, Error> {
    let spill = &config.memory.spill_dir;
    let label = kind.label();
    let manifest = spill.join(format!("{label}.manifest"));

    if resume {
        if let Some(staged) = load_manifest(&manifest, kind)? {
            info!(table = label, runs = staged.run_files.len(), "Resuming from intact run files");
            return Ok(staged);
        }
    }
    clear_label_files(spill, label)?;

    // sources are visited in rank order so unknown columns land in a
    // deterministic position in the output header
    let mut ordered: Vec<&SourceConfig> = config.sources.iter().collect();
    ordered.sort_by_key(|source| source.rank);

    let mut columns = Columns::new(kind);
    let mut resolved = Vec::new();
    for source in ordered {
        if refused.lock().unwrap().contains(&source.name) {
            continue;
        }

        let paths = match kind {
            TableKind::Nodes => &source.nodes_path,
            TableKind::Edges => &source.edges_path,
        };
        let files = match readers::resolve_files(paths, spill) {
            Ok(files) => files,
            Err(err) => {
                refuse(sink, refused, &source.name, err.to_string());
                continue;
            }
        };

        let mut accepted = true;
        for file in &files {
            let outcome = readers::read_header(file)
                .and_then(|header| Ok(readers::union_header(file, &header, kind, &mut columns)?));
            if let Err(err) = outcome {
                refuse(sink, refused, &source.name, err.to_string());
                accepted = false;
                break;
            }
        }
        if accepted {
            resolved.push(ResolvedSource {
                name: Arc::from(source.name.as_str()),
                rank: source.rank,
                files,
            });
        }
    }

    let input_bytes: u64 = resolved
        .iter()
        .flat_map(|source| source.files.iter())
        .filter_map(|file| std::fs::metadata(file).ok())
        .map(|meta| meta.len())
        .sum();
    let partitions = partition_count(input_bytes, config.memory.partition_bytes);
    info!(table = label, sources = resolved.len(), partitions, "Partitioning table");

    let set = PartitionSet::create(spill, label, partitions)?;
    let sequence = Arc::new(AtomicU64::new(0));
    let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    let columns_ref = &columns;
    let sequence_ref = &sequence;
    let set_ref = &set;

    std::thread::scope(|scope| {
        let (row_tx, row_rx) = bounded::<Row>(QUEUE_DEPTH);
        let (canon_tx, canon_rx) = bounded::<Row>(QUEUE_DEPTH);

        for source in &resolved {
            let row_tx = row_tx.clone();
            scope.spawn(move || read_source(source, columns_ref, sequence_ref, row_tx, sink, refused, cancel, bars));
        }
        drop(row_tx);

        for _ in 0..workers {
            let row_rx = row_rx.clone();
            let canon_tx = canon_tx.clone();
            scope.spawn(move || canon_worker(kind, canonicalizer, columns_ref, row_rx, canon_tx, sink, cancel, bars));
        }
        drop(row_rx);
        drop(canon_tx);

        let mut partitioners = Vec::with_capacity(workers);
        for _ in 0..workers {
            let canon_rx = canon_rx.clone();
            partitioners.push(scope.spawn(move || partition_worker(kind, rules, columns_ref, canon_rx, set_ref, cancel)));
        }
        drop(canon_rx);

        let mut result = Ok(());
        for handle in partitioners {
            if let Err(err) = handle.join().expect("partition worker panicked") {
                result = Err(err);
            }
        }
        result
    })?;

    cancel.check()?;

    let run_files = set.finish()?;
    write_manifest(&manifest, &columns, &run_files)?;
    Ok(StagedTable { columns, run_files })
}

fn refuse(sink: &DiagnosticSink, refused: &Mutex<HashSet<String>>, name: &str, reason: String) {
    if refused.lock().unwrap().insert(name.to_string()) {
        sink.refuse_source(name, reason);
    }
}


/// Reads a source's files in their configured order on a single thread,
/// pushing rows onto the bounded queue.
#[allow(clippy::too_many_arguments)]
fn read_source(
    source: &ResolvedSource,
    columns: &Columns,
    sequence: &Arc<AtomicU64>,
    tx: Sender<Row>,
    sink: &DiagnosticSink,
    refused: &Mutex<HashSet<String>>,
    cancel: &CancelToken,
    bars: &MergeBars,
) {
    let mut batch = DiagnosticBatch::new();

    'files: for path in &source.files {
        let display = path.display().to_string();

        let reader = match readers::open_reader(path) {
            Ok(reader) => reader,
            Err(err) => {
                refuse(sink, refused, &source.name, err.to_string());
                break;
            }
        };
        let rows = match TsvReader::new(reader, path, columns, source.rank, source.name.clone(), sequence.clone()) {
            Ok(rows) => rows,
            Err(err) => {
                refuse(sink, refused, &source.name, err.to_string());
                break;
            }
        };

        for item in rows {
            if cancel.is_cancelled() {
                break 'files;
            }
            match item {
                Ok(row) => {
                    bars.rows.inc(1);
                    if tx.send(row).is_err() {
                        break 'files;
                    }
                }
                Err(ReadError::Skip { line, message }) => batch.parse_error(&display, line, &message),
                Err(ReadError::Fatal(err)) => {
                    refuse(sink, refused, &source.name, err.to_string());
                    break 'files;
                }
            }
        }
    }

    sink.flush(&mut batch);
}

/// Drains the reader queue through the pure canonicalization function.
#[allow(clippy::too_many_arguments)]
fn canon_worker(
    kind: TableKind,
    canonicalizer: &Canonicalizer,
    columns: &Columns,
    rx: Receiver<Row>,
    tx: Sender<Row>,
    sink: &DiagnosticSink,
    cancel: &CancelToken,
    bars: &MergeBars,
) {
    let mut batch = DiagnosticBatch::new();

    while let Ok(mut row) = rx.recv() {
        if cancel.is_cancelled() {
            break;
        }

        let outcome = match kind {
            TableKind::Nodes => canonicalizer.canon_node(&mut row, columns),
            TableKind::Edges => canonicalizer.canon_edge(&mut row, columns),
        };
        match outcome {
            CanonOutcome::Kept => {
                if tx.send(row).is_err() {
                    break;
                }
            }
            CanonOutcome::Dropped(field) => {
                bars.dropped.inc(1);
                batch.dropped_invalid(&row.path, row.line, field);
            }
        }
    }

    sink.flush(&mut batch);
}

/// Appends canonicalized rows to their hash partition. Pruning happens in
/// the dedup key function so pruned edges never reach a run file.
fn partition_worker(
    kind: TableKind,
    rules: &DedupRules,
    columns: &Columns,
    rx: Receiver<Row>,
    set: &PartitionSet,
    cancel: &CancelToken,
) -> Result<(), Error> {
    while let Ok(row) = rx.recv() {
        if cancel.is_cancelled() {
            break;
        }
        let Some(key) = rules.key(kind, &row, columns) else {
            continue;
        };
        let idx = partition_index(&key, set.len(), 0);
        set.append(idx, &row)?;
    }
    Ok(())
}


fn write_manifest(path: &Path, columns: &Columns, run_files: &[PathBuf]) -> Result<(), Error> {
    let mut file = File::create(path)?;
    writeln!(file, "{}", columns.names().join("\t"))?;
    for run in run_files {
        writeln!(file, "{}", run.display())?;
    }
    Ok(())
}

/// Loads a table manifest left by a previous run. Returns `None` when the
/// manifest or any of its run files is missing, which sends the table back
/// through a full ingest.
fn load_manifest(path: &Path, kind: TableKind) -> Result<Option<StagedTable>, Error> {
    if !path.exists() {
        return Ok(None);
    }

    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let Some(header) = lines.next().transpose()? else {
        return Ok(None);
    };
    let mut columns = Columns::new(kind);
    for name in header.split('\t') {
        columns.upsert(name);
    }

    let mut run_files = Vec::new();
    for line in lines {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let run = PathBuf::from(line);
        if !run.exists() {
            return Ok(None);
        }
        run_files.push(run);
    }

    if run_files.is_empty() {
        return Ok(None);
    }
    Ok(Some(StagedTable { columns, run_files }))
}

fn clear_label_files(spill: &Path, label: &str) -> Result<(), Error> {
    if !spill.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(spill)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(label) && entry.path().is_file() {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
