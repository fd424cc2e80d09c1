use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{ChainConfig, ChainStep, JoinSide};
use crate::errors::Error;
use crate::model::curie_prefix;
use crate::utils::CancelToken;


/// Where a finished chain landed on disk. Multiple shards are a set-union;
/// the engine bounds peak temporary size by emitting hash-partitioned
/// shards instead of concatenating them.
#[derive(Debug)]
pub struct ChainOutput {
    pub name: String,
    pub shards: Vec<PathBuf>,
    pub rows: u64,
}


/// Evaluates one chain specification against the merged edge table as a
/// left-deep sequence of hash joins, spilling the running relation when it
/// grows past the memory budget.
pub fn run_chain(
    chain: &ChainConfig,
    edges_path: &Path,
    spill_dir: &Path,
    budget: u64,
    out_dir: &Path,
    out_prefix: &str,
    cancel: &CancelToken,
) -> Result<ChainOutput, Error> {
    let chain_spill = spill_dir.join("chains");
    std::fs::create_dir_all(&chain_spill)?;

    let first = &chain.steps[0];
    let mut relation = base_relation(edges_path, first, chain.start, budget, &chain_spill, &chain.name)?;

    for (hop, step) in chain.steps.iter().enumerate().skip(1) {
        cancel.check()?;
        relation = join_step(
            relation,
            edges_path,
            step,
            budget,
            &chain_spill,
            &format!("{}_{hop}", chain.name),
        )?;
    }

    cancel.check()?;
    let output = write_chain(chain, relation, out_dir, out_prefix)?;
    if output.rows == 0 {
        warn!(chain = chain.name, "Chain produced no rows");
    }
    else {
        info!(chain = chain.name, rows = output.rows, shards = output.shards.len(), "Chain written");
    }
    Ok(output)
}


/// The running relation: distinct `(origin, frontier)` pairs, either held
/// in memory or hash-partitioned by frontier across spill shards.
enum Relation {
    Memory(Vec<(String, String)>),
    Spilled(Vec<PathBuf>),
}

fn pair_bytes(origin: &str, frontier: &str) -> u64 {
    // string contents plus a rough allowance for the vec and map overhead
    (origin.len() + frontier.len() + 48) as u64
}


/// Streams the merged edge file, yielding `(subject, predicate, object)`.
struct EdgeScan {
    reader: csv::Reader<BufReader<File>>,
    subject: usize,
    predicate: usize,
    object: usize,
}

impl EdgeScan {
    fn open(path: &Path) -> Result<EdgeScan, Error> {
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let mut subject = 0;
        let mut predicate = 1;
        let mut object = 2;
        for (idx, column) in reader.headers()?.iter().enumerate() {
            match column {
                "subject" => subject = idx,
                "predicate" => predicate = idx,
                "object" => object = idx,
                _ => {}
            }
        }

        Ok(EdgeScan {
            reader,
            subject,
            predicate,
            object,
        })
    }
}

impl Iterator for EdgeScan {
    type Item = Result<(String, String, String), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = csv::StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(false) => None,
            Err(err) => Some(Err(err.into())),
            Ok(true) => Some(Ok((
                record.get(self.subject).unwrap_or_default().to_string(),
                record.get(self.predicate).unwrap_or_default().to_string(),
                record.get(self.object).unwrap_or_default().to_string(),
            ))),
        }
    }
}

fn step_matches(step: &ChainStep, subject: &str, predicate: &str, object: &str) -> bool {
    if let Some(prefix) = &step.subject {
        if curie_prefix(subject) != prefix {
            return false;
        }
    }
    if let Some(prefix) = &step.object {
        if curie_prefix(object) != prefix {
            return false;
        }
    }
    if let Some(filter) = &step.predicate {
        if predicate != filter {
            return false;
        }
    }
    true
}

fn side<'a>(side: JoinSide, subject: &'a str, object: &'a str) -> &'a str {
    match side {
        JoinSide::Subject => subject,
        JoinSide::Object => object,
    }
}


/// Builds the base relation from the first hop's edges. `start` names the
/// side kept as the origin column; the other side is the join frontier.
fn base_relation(
    edges_path: &Path,
    step: &ChainStep,
    start: JoinSide,
    budget: u64,
    spill_dir: &Path,
    label: &str,
) -> Result<Relation, Error> {
    let mut builder = RelationBuilder::new(budget, spill_dir, &format!("{label}_base"));

    for edge in EdgeScan::open(edges_path)? {
        let (subject, predicate, object) = edge?;
        if !step_matches(step, &subject, &predicate, &object) {
            continue;
        }

        let origin = side(start, &subject, &object);
        let frontier = side(start.other(), &subject, &object);
        if origin.is_empty() || frontier.is_empty() {
            continue;
        }
        builder.push(origin.to_string(), frontier.to_string())?;
    }

    builder.finish()
}


/// Joins the relation's frontier against one side of the step's edges and
/// advances the frontier to the opposite side.
fn join_step(
    relation: Relation,
    edges_path: &Path,
    step: &ChainStep,
    budget: u64,
    spill_dir: &Path,
    label: &str,
) -> Result<Relation, Error> {
    let shards = match relation {
        Relation::Memory(pairs) => {
            return join_shard(&pairs, edges_path, step, budget, spill_dir, label);
        }
        Relation::Spilled(shards) => shards,
    };

    // each spilled shard fits the budget by construction; join them one at
    // a time and let the builder re-partition the combined output
    let mut builder = RelationBuilder::new(budget, spill_dir, label);
    for shard in &shards {
        let pairs = read_shard(shard)?;
        let joined = join_shard(&pairs, edges_path, step, u64::MAX, spill_dir, &format!("{label}_tmp"))?;
        let Relation::Memory(pairs) = joined else {
            unreachable!("unbounded budget never spills");
        };
        for (origin, frontier) in pairs {
            builder.push(origin, frontier)?;
        }
    }
    for shard in shards {
        std::fs::remove_file(shard)?;
    }

    builder.finish()
}

fn join_shard(
    pairs: &[(String, String)],
    edges_path: &Path,
    step: &ChainStep,
    budget: u64,
    spill_dir: &Path,
    label: &str,
) -> Result<Relation, Error> {
    let mut lookup: HashMap<&str, Vec<&str>> = HashMap::new();
    for (origin, frontier) in pairs {
        // empty identifiers never participate in a join
        if !frontier.is_empty() {
            lookup.entry(frontier.as_str()).or_default().push(origin.as_str());
        }
    }

    let mut builder = RelationBuilder::new(budget, spill_dir, label);
    for edge in EdgeScan::open(edges_path)? {
        let (subject, predicate, object) = edge?;
        if !step_matches(step, &subject, &predicate, &object) {
            continue;
        }

        let matched = side(step.join, &subject, &object);
        let next = side(step.join.other(), &subject, &object);
        if next.is_empty() {
            continue;
        }
        if let Some(origins) = lookup.get(matched) {
            for origin in origins {
                builder.push(origin.to_string(), next.to_string())?;
            }
        }
    }

    builder.finish()
}


/// Accumulates distinct pairs in memory, hash-partitioning everything to
/// disk by frontier once the estimated size crosses the budget.
struct RelationBuilder {
    budget: u64,
    spill_dir: PathBuf,
    label: String,
    seen: HashSet<(String, String)>,
    bytes: u64,
    writers: Option<Vec<csv::Writer<BufWriter<File>>>>,
    shard_paths: Vec<PathBuf>,
}

/// How many shards a spilled relation splits into.
const RELATION_SHARDS: usize = 16;

impl RelationBuilder {
    fn new(budget: u64, spill_dir: &Path, label: &str) -> RelationBuilder {
        RelationBuilder {
            budget,
            spill_dir: spill_dir.to_path_buf(),
            label: label.to_string(),
            seen: HashSet::new(),
            bytes: 0,
            writers: None,
            shard_paths: Vec::new(),
        }
    }

    fn push(&mut self, origin: String, frontier: String) -> Result<(), Error> {
        if let Some(writers) = &mut self.writers {
            let idx = (xxh3_64(frontier.as_bytes()) % RELATION_SHARDS as u64) as usize;
            writers[idx].write_record([origin.as_str(), frontier.as_str()])?;
            return Ok(());
        }

        let bytes = pair_bytes(&origin, &frontier);
        if self.seen.insert((origin, frontier)) {
            self.bytes += bytes;
            if self.bytes > self.budget {
                self.spill()?;
            }
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<(), Error> {
        info!(label = self.label, pairs = self.seen.len(), "Spilling chain relation");

        let mut writers = Vec::with_capacity(RELATION_SHARDS);
        for idx in 0..RELATION_SHARDS {
            let path = self.spill_dir.join(format!("{}_s{idx:02}.tmp", self.label));
            let file = File::create(&path)?;
            writers.push(
                csv::WriterBuilder::new()
                    .delimiter(b'\t')
                    .quote_style(csv::QuoteStyle::Never)
                    .has_headers(false)
                    .from_writer(BufWriter::new(file)),
            );
            self.shard_paths.push(path);
        }

        for (origin, frontier) in self.seen.drain() {
            let idx = (xxh3_64(frontier.as_bytes()) % RELATION_SHARDS as u64) as usize;
            writers[idx].write_record([origin.as_str(), frontier.as_str()])?;
        }

        self.writers = Some(writers);
        Ok(())
    }

    fn finish(mut self) -> Result<Relation, Error> {
        match self.writers.take() {
            None => Ok(Relation::Memory(self.seen.into_iter().collect())),
            Some(writers) => {
                for mut writer in writers {
                    writer.flush()?;
                }
                Ok(Relation::Spilled(self.shard_paths))
            }
        }
    }
}

/// Loads one spilled shard back into memory, deduplicating pairs that were
/// appended from different upstream shards.
fn read_shard(path: &Path) -> Result<Vec<(String, String)>, Error> {
    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .has_headers(false)
        .from_reader(BufReader::new(file));

    let mut seen = HashSet::new();
    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record)? {
        seen.insert((
            record.get(0).unwrap_or_default().to_string(),
            record.get(1).unwrap_or_default().to_string(),
        ));
    }
    Ok(seen.into_iter().collect())
}


/// Derives the two output column names when the configuration doesn't
/// spell them out.
fn output_columns(chain: &ChainConfig) -> (String, String) {
    if let Some(columns) = &chain.columns {
        return (columns[0].clone(), columns[1].clone());
    }

    let first = &chain.steps[0];
    let last = chain.steps.last().unwrap_or(first);
    let origin = match chain.start {
        JoinSide::Subject => first.subject.as_deref(),
        JoinSide::Object => first.object.as_deref(),
    };
    let end = match chain.steps.len() {
        1 => match chain.start.other() {
            JoinSide::Subject => first.subject.as_deref(),
            JoinSide::Object => first.object.as_deref(),
        },
        _ => match last.join.other() {
            JoinSide::Subject => last.subject.as_deref(),
            JoinSide::Object => last.object.as_deref(),
        },
    };

    (
        format!("{}_id", origin.unwrap_or("start").to_lowercase()),
        format!("{}_id", end.unwrap_or("end").to_lowercase()),
    )
}

fn write_chain(
    chain: &ChainConfig,
    relation: Relation,
    out_dir: &Path,
    out_prefix: &str,
) -> Result<ChainOutput, Error> {
    std::fs::create_dir_all(out_dir)?;
    let (origin_column, end_column) = output_columns(chain);

    let mut output = ChainOutput {
        name: chain.name.clone(),
        shards: Vec::new(),
        rows: 0,
    };

    match relation {
        Relation::Memory(mut pairs) => {
            pairs.sort();
            let path = out_dir.join(format!("{out_prefix}_{}.tsv", chain.name));
            output.rows += write_pairs(&path, &origin_column, &end_column, &pairs)?;
            output.shards.push(path);
        }
        Relation::Spilled(shards) => {
            for (idx, shard) in shards.iter().enumerate() {
                let mut pairs = read_shard(shard)?;
                pairs.sort();
                let path = out_dir.join(format!("{out_prefix}_{}.part{idx}.tsv", chain.name));
                output.rows += write_pairs(&path, &origin_column, &end_column, &pairs)?;
                output.shards.push(path);
            }
            for shard in shards {
                std::fs::remove_file(shard)?;
            }
        }
    }

    Ok(output)
}

fn write_pairs(
    path: &Path,
    origin_column: &str,
    end_column: &str,
    pairs: &[(String, String)],
) -> Result<u64, Error> {
    let file = File::create(path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .from_writer(BufWriter::new(file));
    writer.write_record([origin_column, end_column])?;
    for (origin, end) in pairs {
        writer.write_record([origin.as_str(), end.as_str()])?;
    }
    writer.flush()?;
    Ok(pairs.len() as u64)
}


#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_edges(dir: &Path, rows: &[(&str, &str, &str)]) -> PathBuf {
        let path = dir.join("merged_edges.tsv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "subject\tpredicate\tobject").unwrap();
        for (subject, predicate, object) in rows {
            writeln!(file, "{subject}\t{predicate}\t{object}").unwrap();
        }
        path
    }

    fn taxon_chain() -> ChainConfig {
        let raw = r#"
            name = "taxon_to_chebi"
            start = "object"
            columns = ["taxon_id", "chebi_id"]

            [[steps]]
            subject = "Proteomes"
            object = "NCBITaxon"

            [[steps]]
            subject = "UniprotKB"
            object = "Proteomes"
            join = "object"

            [[steps]]
            subject = "UniprotKB"
            object = "RHEA"
            join = "subject"

            [[steps]]
            subject = "RHEA"
            object = "CHEBI"
            join = "subject"
            predicate = "biolink:has_output"
        "#;
        toml::from_str(raw).unwrap()
    }

    fn run(chain: &ChainConfig, edges: &[(&str, &str, &str)], budget: u64) -> Vec<(String, String)> {
        let dir = tempfile::tempdir().unwrap();
        let edges_path = write_edges(dir.path(), edges);
        let spill = dir.path().join("spill");
        let out = dir.path().join("out");

        let output = run_chain(chain, &edges_path, &spill, budget, &out, "chain", &CancelToken::new()).unwrap();

        let mut pairs = Vec::new();
        for shard in output.shards {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(b'\t')
                .from_path(shard)
                .unwrap();
            for record in reader.records() {
                let record = record.unwrap();
                pairs.push((record[0].to_string(), record[1].to_string()));
            }
        }
        pairs.sort();
        pairs
    }

    #[test]
    fn taxon_chain_reconstructs_the_path() {
        let edges = [
            ("Proteomes:UP1", "biolink:derives_from", "NCBITaxon:562"),
            ("UniprotKB:X", "biolink:derives_from", "Proteomes:UP1"),
            ("UniprotKB:X", "biolink:participates_in", "RHEA:R1"),
            ("RHEA:R1", "biolink:has_output", "CHEBI:C1"),
            // wrong predicate on the last hop never matches
            ("RHEA:R1", "biolink:has_input", "CHEBI:C2"),
        ];
        let pairs = run(&taxon_chain(), &edges, 1 << 20);
        assert_eq!(pairs, vec![("NCBITaxon:562".to_string(), "CHEBI:C1".to_string())]);
    }

    #[test]
    fn missing_hops_omit_the_tuple() {
        // no UniprotKB -> RHEA hop for Y, so only X reaches a chemical
        let edges = [
            ("Proteomes:UP1", "biolink:derives_from", "NCBITaxon:562"),
            ("Proteomes:UP2", "biolink:derives_from", "NCBITaxon:300"),
            ("UniprotKB:X", "biolink:derives_from", "Proteomes:UP1"),
            ("UniprotKB:Y", "biolink:derives_from", "Proteomes:UP2"),
            ("UniprotKB:X", "biolink:participates_in", "RHEA:R1"),
            ("RHEA:R1", "biolink:has_output", "CHEBI:C1"),
        ];
        let pairs = run(&taxon_chain(), &edges, 1 << 20);
        assert_eq!(pairs, vec![("NCBITaxon:562".to_string(), "CHEBI:C1".to_string())]);
    }

    #[test]
    fn spilled_relations_agree_with_in_memory_ones() {
        let mut edges = Vec::new();
        for n in 0..40 {
            edges.push((format!("Proteomes:UP{n}"), "biolink:derives_from".to_string(), format!("NCBITaxon:{n}")));
            edges.push((format!("UniprotKB:X{n}"), "biolink:derives_from".to_string(), format!("Proteomes:UP{n}")));
            edges.push((format!("UniprotKB:X{n}"), "biolink:participates_in".to_string(), format!("RHEA:R{n}")));
            edges.push((format!("RHEA:R{n}"), "biolink:has_output".to_string(), format!("CHEBI:C{n}")));
        }
        let edges: Vec<(&str, &str, &str)> = edges
            .iter()
            .map(|(s, p, o)| (s.as_str(), p.as_str(), o.as_str()))
            .collect();

        let roomy = run(&taxon_chain(), &edges, 1 << 20);
        let tight = run(&taxon_chain(), &edges, 256);
        assert_eq!(roomy.len(), 40);
        assert_eq!(roomy, tight);
    }

    #[test]
    fn duplicate_paths_emit_one_pair() {
        let edges = [
            ("Proteomes:UP1", "biolink:derives_from", "NCBITaxon:562"),
            ("UniprotKB:X", "biolink:derives_from", "Proteomes:UP1"),
            ("UniprotKB:Y", "biolink:derives_from", "Proteomes:UP1"),
            ("UniprotKB:X", "biolink:participates_in", "RHEA:R1"),
            ("UniprotKB:Y", "biolink:participates_in", "RHEA:R1"),
            ("RHEA:R1", "biolink:has_output", "CHEBI:C1"),
        ];
        let pairs = run(&taxon_chain(), &edges, 1 << 20);
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn self_loops_are_preserved() {
        let raw = r#"
            name = "go_loop"
            start = "subject"

            [[steps]]
            subject = "GO"
            object = "GO"
        "#;
        let chain: ChainConfig = toml::from_str(raw).unwrap();
        let edges = [("GO:1", "biolink:subclass_of", "GO:1")];
        let pairs = run(&chain, &edges, 1 << 20);
        assert_eq!(pairs, vec![("GO:1".to_string(), "GO:1".to_string())]);
    }
}
