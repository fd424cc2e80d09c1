use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{ConfigError, Error};


/// The declarative run configuration. Everything the engine needs is carried
/// here as an immutable object constructed at startup so tests can
/// instantiate the engine with alternate maps and budgets.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub canon: CanonConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub chains: Vec<ChainConfig>,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Error> {
        let mut file = File::open(path)?;
        let mut raw = String::new();
        file.read_to_string(&mut raw)?;
        let config: Config = toml::from_str(&raw).map_err(ConfigError::Toml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::new();
        for source in &self.sources {
            if seen.contains(&&source.name) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            seen.push(&source.name);
        }

        for chain in &self.chains {
            if chain.steps.is_empty() {
                return Err(ConfigError::EmptyChain(chain.name.clone()));
            }
            if let Some(columns) = &chain.columns {
                if columns.len() != 2 {
                    return Err(ConfigError::ChainColumns(chain.name.clone()));
                }
            }
        }

        Ok(())
    }

    pub fn chain(&self, name: &str) -> Result<&ChainConfig, ConfigError> {
        self.chains
            .iter()
            .find(|chain| chain.name == name)
            .ok_or_else(|| ConfigError::UnknownChain(name.to_string()))
    }
}


/// A logical source: one or more node files and one or more edge files
/// produced by a single upstream transform, plus its dedup rank.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Priority of this source during dedup. Lower rank wins.
    pub rank: u32,
    pub nodes_path: Vec<PathBuf>,
    pub edges_path: Vec<PathBuf>,
}


#[derive(Debug, Clone, Default, Deserialize)]
pub struct DedupConfig {
    /// Replaces the built-in predicate rank table when present.
    pub predicate_priority: Option<HashMap<String, u32>>,

    /// Extensions to the built-in fan-out exempt prefix pairs.
    #[serde(default)]
    pub fanout_exempt_pairs: Vec<(String, String)>,

    /// Extensions to the built-in pruned prefix pairs.
    #[serde(default)]
    pub pruned_pairs: Vec<(String, String)>,

    /// Emit set-valued fields in first-seen order instead of sorted.
    #[serde(default)]
    pub preserve_value_order: bool,
}


#[derive(Debug, Clone, Default, Deserialize)]
pub struct CanonConfig {
    /// Additions to the built-in prefix rewrite table.
    #[serde(default)]
    pub prefix_map: HashMap<String, String>,

    /// Additions to the built-in category canonicalization table.
    #[serde(default)]
    pub category_map: HashMap<String, String>,
}


#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Target maximum size of an in-memory dedup partition.
    #[serde(default = "default_partition_bytes")]
    pub partition_bytes: u64,

    /// Directory holding partition run files and chain temporaries.
    #[serde(default = "default_spill_dir")]
    pub spill_dir: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            partition_bytes: default_partition_bytes(),
            spill_dir: default_spill_dir(),
        }
    }
}

fn default_partition_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_spill_dir() -> PathBuf {
    PathBuf::from("spill")
}


/// A derived relation over the merged edge table, evaluated as a left-deep
/// sequence of hash joins. The first step selects the base edges; `start`
/// names the side of those edges kept as the output origin column. Every
/// later step joins its `join` side against the running frontier and moves
/// the frontier to the opposite side.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,

    #[serde(default = "default_chain_start")]
    pub start: JoinSide,

    /// Header names for the two output columns. Derived from the first and
    /// last hop prefixes when absent.
    pub columns: Option<Vec<String>>,

    pub steps: Vec<ChainStep>,
}

fn default_chain_start() -> JoinSide {
    JoinSide::Subject
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainStep {
    /// Subject prefix filter for this hop's edges.
    pub subject: Option<String>,
    /// Object prefix filter for this hop's edges.
    pub object: Option<String>,
    /// Predicate filter for this hop's edges.
    pub predicate: Option<String>,

    /// The side of this hop's edges matched against the frontier.
    /// Ignored on the first step.
    #[serde(default = "default_chain_start")]
    pub join: JoinSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSide {
    Subject,
    Object,
}

impl JoinSide {
    pub fn other(&self) -> JoinSide {
        match self {
            JoinSide::Subject => JoinSide::Object,
            JoinSide::Object => JoinSide::Subject,
        }
    }
}


#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_node_facets")]
    pub node_facets: Vec<String>,

    #[serde(default = "default_edge_facets")]
    pub edge_facets: Vec<String>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            node_facets: default_node_facets(),
            edge_facets: default_edge_facets(),
        }
    }
}

fn default_node_facets() -> Vec<String> {
    vec!["category".to_string(), "provided_by".to_string()]
}

fn default_edge_facets() -> Vec<String> {
    vec!["predicate".to_string(), "primary_knowledge_source".to_string()]
}


#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_node_file")]
    pub node_file: String,

    #[serde(default = "default_edge_file")]
    pub edge_file: String,

    #[serde(default = "default_stats_file")]
    pub stats_file: String,

    #[serde(default = "default_chain_prefix")]
    pub chain_file_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: default_output_dir(),
            node_file: default_node_file(),
            edge_file: default_edge_file(),
            stats_file: default_stats_file(),
            chain_file_prefix: default_chain_prefix(),
        }
    }
}

impl OutputConfig {
    pub fn node_path(&self) -> PathBuf {
        self.dir.join(&self.node_file)
    }

    pub fn edge_path(&self) -> PathBuf {
        self.dir.join(&self.edge_file)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.dir.join(&self.stats_file)
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("merged")
}

fn default_node_file() -> String {
    "merged_nodes.tsv".to_string()
}

fn default_edge_file() -> String {
    "merged_edges.tsv".to_string()
}

fn default_stats_file() -> String {
    "merged_stats.yaml".to_string()
}

fn default_chain_prefix() -> String {
    "chain".to_string()
}
