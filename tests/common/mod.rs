#![allow(dead_code)]

use std::path::Path;

use kgmerge::config::{CanonConfig, Config, DedupConfig, MemoryConfig, OutputConfig, SourceConfig, StatsConfig};
use kgmerge::errors::Error;
use kgmerge::merge::{self, MergeOptions};
use kgmerge::utils::CancelToken;
use tempfile::TempDir;


/// A self-contained merge setup: input tables on disk, spill and output
/// directories inside one temporary directory, and the config tying them
/// together.
pub struct Fixture {
    pub dir: TempDir,
    pub config: Config,
}

/// Builds a fixture from `(source_name, rank, nodes_tsv, edges_tsv)` tuples.
pub fn fixture(sources: &[(&str, u32, &str, &str)]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    std::fs::create_dir_all(&input).unwrap();

    let mut source_configs = Vec::new();
    for (name, rank, nodes, edges) in sources {
        let nodes_path = input.join(format!("{name}_nodes.tsv"));
        let edges_path = input.join(format!("{name}_edges.tsv"));
        std::fs::write(&nodes_path, nodes).unwrap();
        std::fs::write(&edges_path, edges).unwrap();

        source_configs.push(SourceConfig {
            name: name.to_string(),
            rank: *rank,
            nodes_path: vec![nodes_path],
            edges_path: vec![edges_path],
        });
    }

    let config = Config {
        sources: source_configs,
        dedup: DedupConfig::default(),
        canon: CanonConfig::default(),
        memory: MemoryConfig {
            partition_bytes: 1 << 20,
            spill_dir: dir.path().join("spill"),
        },
        chains: Vec::new(),
        stats: StatsConfig::default(),
        output: OutputConfig {
            dir: dir.path().join("merged"),
            ..OutputConfig::default()
        },
    };

    Fixture { dir, config }
}

impl Fixture {
    pub fn run(&self) -> Result<(), Error> {
        self.run_opts(&MergeOptions::default())
    }

    pub fn run_opts(&self, options: &MergeOptions) -> Result<(), Error> {
        merge::run(&self.config, options, &CancelToken::new())
    }

    pub fn nodes(&self) -> Table {
        read_table(&self.config.output.node_path())
    }

    pub fn edges(&self) -> Table {
        read_table(&self.config.output.edge_path())
    }
}


/// A merged table pulled back into memory for assertions.
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column(&self, name: &str) -> usize {
        self.header
            .iter()
            .position(|column| column == name)
            .unwrap_or_else(|| panic!("no column {name} in {:?}", self.header))
    }

    pub fn get<'a>(&'a self, row: usize, column: &str) -> &'a str {
        &self.rows[row][self.column(column)]
    }

    /// All values of one column, in row order.
    pub fn values(&self, column: &str) -> Vec<String> {
        let idx = self.column(column);
        self.rows.iter().map(|row| row[idx].clone()).collect()
    }
}

pub fn read_table(path: &Path) -> Table {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .from_path(path)
        .unwrap();

    let header = reader.headers().unwrap().iter().map(|c| c.to_string()).collect();
    let rows = reader
        .records()
        .map(|record| record.unwrap().iter().map(|v| v.to_string()).collect())
        .collect();

    Table { header, rows }
}
