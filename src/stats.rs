use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::diagnostics::Diagnostics;
use crate::errors::Error;


/// The YAML summary written next to the merged tables. Everything in here
/// is derived from the post-merge state so re-running the emitter against
/// the same tables reproduces the same counts.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsDocument {
    pub generated_at: String,
    pub nodes: TableStats,
    pub edges: TableStats,
    /// Dedup winners contributed by each configured source.
    pub sources: Vec<SourceContribution>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TableStats {
    pub total: u64,
    /// Facet column name to per-value counts, descending by count.
    pub facets: BTreeMap<String, Vec<FacetCount>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FacetCount {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceContribution {
    pub name: String,
    pub rank: u32,
    pub nodes: u64,
    pub edges: u64,
}


/// Single pass over one merged table, counting totals and the configured
/// facet columns. A facet column missing from the table counts nothing.
pub fn collect_table(path: &Path, facets: &[String]) -> Result<TableStats, Error> {
    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let mut positions: Vec<(String, usize)> = Vec::new();
    for (idx, column) in reader.headers()?.iter().enumerate() {
        if facets.iter().any(|facet| facet == column) {
            positions.push((column.to_string(), idx));
        }
    }

    let mut counts: Vec<HashMap<String, u64>> = vec![HashMap::new(); positions.len()];
    let mut stats = TableStats::default();

    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record)? {
        stats.total += 1;
        for (slot, (_, idx)) in positions.iter().enumerate() {
            let value = record.get(*idx).unwrap_or_default();
            *counts[slot].entry(value.to_string()).or_default() += 1;
        }
    }

    for ((facet, _), values) in positions.into_iter().zip(counts) {
        let mut values: Vec<FacetCount> = values
            .into_iter()
            .map(|(value, count)| FacetCount { value, count })
            .collect();
        values.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        stats.facets.insert(facet, values);
    }

    Ok(stats)
}


/// Counts edges referencing an id that never materialized as a node. The
/// node id set is held as xxh3 hashes so the pass stays within memory even
/// for very large graphs.
pub fn count_dangling(nodes_path: &Path, edges_path: &Path) -> Result<u64, Error> {
    let file = File::open(nodes_path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let id_idx = header_position(&mut reader, "id")?.unwrap_or(0);
    let mut ids: HashSet<u64> = HashSet::new();
    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record)? {
        if let Some(id) = record.get(id_idx) {
            ids.insert(xxh3_64(id.as_bytes()));
        }
    }

    let file = File::open(edges_path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let subject_idx = header_position(&mut reader, "subject")?.unwrap_or(0);
    let object_idx = header_position(&mut reader, "object")?.unwrap_or(2);

    let mut dangling = 0;
    while reader.read_record(&mut record)? {
        let subject = record.get(subject_idx).unwrap_or_default();
        let object = record.get(object_idx).unwrap_or_default();
        if !ids.contains(&xxh3_64(subject.as_bytes())) || !ids.contains(&xxh3_64(object.as_bytes())) {
            dangling += 1;
        }
    }

    Ok(dangling)
}

fn header_position(
    reader: &mut csv::Reader<BufReader<File>>,
    column: &str,
) -> Result<Option<usize>, Error> {
    Ok(reader.headers()?.iter().position(|name| name == column))
}


pub fn write_stats(path: &Path, document: &StatsDocument) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    serde_yaml::to_writer(BufWriter::new(file), document)?;
    info!(path = %path.display(), "Statistics written");
    Ok(())
}

/// Reads an earlier stats document back. The per-source contributions and
/// row-level diagnostic counts are only observable during dedup, so a
/// stats-only re-run carries the previous run's sections rather than
/// inventing them.
pub fn load_document(path: &Path) -> Option<StatsDocument> {
    let file = File::open(path).ok()?;
    serde_yaml::from_reader(BufReader::new(file)).ok()
}


#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_table(path: &Path, content: &str) {
        let mut file = File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn facets_count_distinct_values_in_stable_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tsv");
        write_table(
            &path,
            "id\tcategory\tprovided_by\n\
             CHEBI:1\tbiolink:ChemicalEntity\tchebi\n\
             CHEBI:2\tbiolink:ChemicalEntity\tchebi\n\
             NCBITaxon:1\tbiolink:OrganismTaxon\tncbi\n\
             GO:1\tbiolink:MolecularActivity\tgo\n",
        );

        let stats = collect_table(&path, &["category".to_string(), "provided_by".to_string()]).unwrap();
        assert_eq!(stats.total, 4);

        let categories = &stats.facets["category"];
        assert_eq!(categories[0].value, "biolink:ChemicalEntity");
        assert_eq!(categories[0].count, 2);
        // equal counts fall back to lexicographic order
        assert_eq!(categories[1].value, "biolink:MolecularActivity");
        assert_eq!(categories[2].value, "biolink:OrganismTaxon");
    }

    #[test]
    fn dangling_references_are_counted_per_edge() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = dir.path().join("nodes.tsv");
        let edges = dir.path().join("edges.tsv");
        write_table(&nodes, "id\tcategory\nA:1\tx\nB:1\tx\n");
        write_table(
            &edges,
            "subject\tpredicate\tobject\n\
             A:1\tp\tB:1\n\
             A:1\tp\tC:1\n\
             C:1\tp\tD:1\n",
        );

        assert_eq!(count_dangling(&nodes, &edges).unwrap(), 2);
    }

    #[test]
    fn stats_documents_round_trip_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.yaml");

        let document = StatsDocument {
            generated_at: "2024-01-01T00:00:00Z".to_string(),
            nodes: TableStats {
                total: 2,
                facets: BTreeMap::new(),
            },
            edges: TableStats::default(),
            sources: vec![SourceContribution {
                name: "ontologies".to_string(),
                rank: 0,
                nodes: 2,
                edges: 0,
            }],
            diagnostics: Diagnostics::default(),
        };

        write_stats(&path, &document).unwrap();
        let loaded = load_document(&path).unwrap();
        assert_eq!(loaded.sources.len(), 1);
        assert_eq!(loaded.sources[0].name, "ontologies");
        assert_eq!(loaded.sources[0].nodes, 2);
        assert_eq!(loaded.nodes.total, 2);
    }
}
