use std::collections::HashMap;
use std::sync::Arc;

/// The node columns the engine interprets, in canonical output order.
/// Columns outside this set are preserved verbatim but never inspected.
pub static NODE_COLUMNS: &[&str] = &[
    "id",
    "category",
    "name",
    "description",
    "xref",
    "provided_by",
    "synonym",
    "iri",
    "deprecated",
    "subsets",
];

/// The edge columns the engine interprets, in canonical output order.
pub static EDGE_COLUMNS: &[&str] = &[
    "subject",
    "predicate",
    "object",
    "relation",
    "primary_knowledge_source",
    "knowledge_source",
];

/// Multi-valued node columns that are set-unioned during dedup rather
/// than taken from the priority winner.
pub static SET_VALUED_COLUMNS: &[&str] = &["xref", "synonym", "subsets"];

/// Separator used to encode list values inside a single TSV field.
pub const VALUE_SEPARATOR: char = '|';


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Nodes,
    Edges,
}

impl TableKind {
    pub fn known_columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Nodes => NODE_COLUMNS,
            TableKind::Edges => EDGE_COLUMNS,
        }
    }

    pub fn required_columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Nodes => &["id", "category"],
            TableKind::Edges => &["subject", "predicate", "object"],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TableKind::Nodes => "nodes",
            TableKind::Edges => "edges",
        }
    }
}


/// The column layout shared by every row of a table once the headers of all
/// source files have been unioned. Canonical columns come first in their
/// fixed order, unknown columns follow in first-seen order.
#[derive(Debug, Clone)]
pub struct Columns {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Columns {
    pub fn new(kind: TableKind) -> Columns {
        let mut columns = Columns {
            names: Vec::new(),
            index: HashMap::new(),
        };
        for name in kind.known_columns() {
            columns.upsert(name);
        }
        columns
    }

    /// Adds the column if it isn't part of the layout yet and returns its index.
    pub fn upsert(&mut self, name: &str) -> usize {
        match self.index.get(name) {
            Some(idx) => *idx,
            None => {
                let idx = self.names.len();
                self.names.push(name.to_string());
                self.index.insert(name.to_string(), idx);
                idx
            }
        }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}


/// A single table row carried through the pipeline. Values are aligned with
/// the unioned [`Columns`] layout, absent columns hold the empty string.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub values: Vec<String>,
    /// Global arrival order. Assigned once at read time and used for every
    /// first-occurrence and insertion-order tie-break downstream.
    pub seq: u64,
    /// The rank of the source this row came from. Lower wins dedup.
    pub rank: u32,
    /// The configured name of the source this row came from.
    pub source: Arc<str>,
    /// File path and file-local line number for diagnostics.
    pub path: Arc<str>,
    pub line: u64,
}

impl Row {
    pub fn get<'a>(&'a self, columns: &Columns, name: &str) -> &'a str {
        columns
            .position(name)
            .and_then(|idx| self.values.get(idx))
            .map(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn set(&mut self, columns: &Columns, name: &str, value: String) {
        if let Some(idx) = columns.position(name) {
            self.values[idx] = value;
        }
    }
}


/// The prefix of a compact URI, the part before the first colon.
/// Identifiers without a colon have an empty prefix.
pub fn curie_prefix(id: &str) -> &str {
    id.split_once(':').map(|(prefix, _)| prefix).unwrap_or_default()
}

/// The local part of a compact URI, the part after the first colon.
pub fn curie_local(id: &str) -> &str {
    id.split_once(':').map(|(_, local)| local).unwrap_or(id)
}

/// Splits a pipe-separated field into its member values, dropping empties.
pub fn split_values(field: &str) -> impl Iterator<Item = &str> {
    field.split(VALUE_SEPARATOR).filter(|v| !v.is_empty())
}
