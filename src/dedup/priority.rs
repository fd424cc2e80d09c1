use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::DedupConfig;
use crate::model::{curie_prefix, Columns, Row, TableKind};


/// The fixed predicate rank table. Smaller wins when two edges share a
/// `(subject, object)` key.
static PREDICATE_RANKS: &[(&str, u32)] = &[
    ("biolink:has_chemical_role", 1),
    ("biolink:subclass_of", 2),
    ("biolink:capable_of", 3),
    ("METPO:2000103", 3),
    ("biolink:can_be_carried_out_by", 4),
    ("biolink:superclass_of", 5),
];

/// Predicates outside the rank table sort here and fall back to row order.
const UNRANKED_PREDICATE: u32 = 6;

/// Prefix pairs for which multiple edges with distinct predicates are
/// legitimate modeling rather than duplication.
static FANOUT_EXEMPT_PAIRS: &[(&str, &str)] = &[("NCBITaxon", "CHEBI"), ("RHEA", "CHEBI")];

/// Prefix pairs whose edges are unconditionally dropped. The taxonomic
/// attachment of a protein is reached via Proteomes instead.
static PRUNED_PAIRS: &[(&str, &str)] = &[("UniprotKB", "NCBITaxon")];

/// Separates key components; cannot occur inside a field because embedded
/// tabs and newlines never survive the reader.
const KEY_SEPARATOR: char = '\t';


/// The totally ordered priority of a row among rows sharing a key.
/// Smaller is better; ties fall back to the arrival sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Node {
        rank: u32,
        missing_name: bool,
        missing_description: bool,
        xref_length: Reverse<usize>,
        source: Arc<str>,
    },
    Edge {
        predicate_rank: u32,
    },
}


/// The dedup rule tables, resolved from the built-in defaults and the
/// configuration overrides at engine startup.
#[derive(Debug, Clone)]
pub struct DedupRules {
    predicate_ranks: HashMap<String, u32>,
    fanout_exempt: HashSet<(String, String)>,
    pruned: HashSet<(String, String)>,
    pub preserve_value_order: bool,
}

impl DedupRules {
    pub fn new(config: &DedupConfig) -> DedupRules {
        let predicate_ranks = match &config.predicate_priority {
            Some(overrides) => overrides.clone(),
            None => PREDICATE_RANKS
                .iter()
                .map(|(predicate, rank)| (predicate.to_string(), *rank))
                .collect(),
        };

        let mut fanout_exempt: HashSet<(String, String)> = FANOUT_EXEMPT_PAIRS
            .iter()
            .map(|(s, o)| (s.to_string(), o.to_string()))
            .collect();
        fanout_exempt.extend(config.fanout_exempt_pairs.iter().cloned());

        let mut pruned: HashSet<(String, String)> = PRUNED_PAIRS
            .iter()
            .map(|(s, o)| (s.to_string(), o.to_string()))
            .collect();
        pruned.extend(config.pruned_pairs.iter().cloned());

        DedupRules {
            predicate_ranks,
            fanout_exempt,
            pruned,
            preserve_value_order: config.preserve_value_order,
        }
    }

    pub fn predicate_rank(&self, predicate: &str) -> u32 {
        self.predicate_ranks.get(predicate).copied().unwrap_or(UNRANKED_PREDICATE)
    }

    pub fn is_fanout_exempt(&self, subject: &str, object: &str) -> bool {
        let pair = (curie_prefix(subject).to_string(), curie_prefix(object).to_string());
        self.fanout_exempt.contains(&pair)
    }

    pub fn is_pruned(&self, subject: &str, object: &str) -> bool {
        let pair = (curie_prefix(subject).to_string(), curie_prefix(object).to_string());
        self.pruned.contains(&pair)
    }

    /// The dedup key of a row, or `None` when the row is pruned outright.
    ///
    /// Node keys are the id. Edge keys are `(subject, object)`, widened with
    /// the predicate for fan-out exempt prefix pairs so each distinct
    /// predicate survives while identical triples still collapse.
    pub fn key(&self, kind: TableKind, row: &Row, columns: &Columns) -> Option<String> {
        match kind {
            TableKind::Nodes => Some(row.get(columns, "id").to_string()),
            TableKind::Edges => {
                let subject = row.get(columns, "subject");
                let object = row.get(columns, "object");

                if self.is_pruned(subject, object) {
                    return None;
                }

                let mut key = format!("{subject}{KEY_SEPARATOR}{object}");
                if self.is_fanout_exempt(subject, object) {
                    key.push(KEY_SEPARATOR);
                    key.push_str(row.get(columns, "predicate"));
                }
                Some(key)
            }
        }
    }

    pub fn priority(&self, kind: TableKind, row: &Row, columns: &Columns) -> Priority {
        match kind {
            TableKind::Nodes => Priority::Node {
                rank: row.rank,
                missing_name: row.get(columns, "name").is_empty(),
                missing_description: row.get(columns, "description").is_empty(),
                xref_length: Reverse(row.get(columns, "xref").len()),
                source: row.source.clone(),
            },
            TableKind::Edges => Priority::Edge {
                predicate_rank: self.predicate_rank(row.get(columns, "predicate")),
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> DedupRules {
        DedupRules::new(&DedupConfig::default())
    }

    fn edge_row(columns: &Columns, subject: &str, predicate: &str, object: &str) -> Row {
        let mut row = Row {
            values: vec![String::new(); columns.len()],
            ..Row::default()
        };
        row.set(columns, "subject", subject.to_string());
        row.set(columns, "predicate", predicate.to_string());
        row.set(columns, "object", object.to_string());
        row
    }

    #[test]
    fn predicate_ranks_follow_the_table() {
        let rules = rules();
        assert_eq!(rules.predicate_rank("biolink:has_chemical_role"), 1);
        assert_eq!(rules.predicate_rank("biolink:subclass_of"), 2);
        assert_eq!(rules.predicate_rank("biolink:capable_of"), 3);
        assert_eq!(rules.predicate_rank("METPO:2000103"), 3);
        assert_eq!(rules.predicate_rank("biolink:can_be_carried_out_by"), 4);
        assert_eq!(rules.predicate_rank("biolink:superclass_of"), 5);
        assert_eq!(rules.predicate_rank("biolink:related_to"), 6);
    }

    #[test]
    fn uniprot_taxon_edges_are_pruned() {
        let rules = rules();
        let columns = Columns::new(TableKind::Edges);
        let row = edge_row(&columns, "UniprotKB:P0A6F5", "biolink:derives_from", "NCBITaxon:562");
        assert!(rules.key(TableKind::Edges, &row, &columns).is_none());

        // the reverse direction is not pruned
        let row = edge_row(&columns, "NCBITaxon:562", "biolink:related_to", "UniprotKB:P0A6F5");
        assert!(rules.key(TableKind::Edges, &row, &columns).is_some());
    }

    #[test]
    fn exempt_pairs_key_on_the_predicate_too() {
        let rules = rules();
        let columns = Columns::new(TableKind::Edges);

        let consumes = edge_row(&columns, "NCBITaxon:562", "biolink:consumes", "CHEBI:17234");
        let metpo = edge_row(&columns, "NCBITaxon:562", "METPO:2000006", "CHEBI:17234");
        assert_ne!(
            rules.key(TableKind::Edges, &consumes, &columns),
            rules.key(TableKind::Edges, &metpo, &columns)
        );

        // identical triples still collapse to one key
        let again = edge_row(&columns, "NCBITaxon:562", "biolink:consumes", "CHEBI:17234");
        assert_eq!(
            rules.key(TableKind::Edges, &consumes, &columns),
            rules.key(TableKind::Edges, &again, &columns)
        );

        let plain = edge_row(&columns, "GO:1", "biolink:subclass_of", "GO:2");
        let other = edge_row(&columns, "GO:1", "biolink:superclass_of", "GO:2");
        assert_eq!(
            rules.key(TableKind::Edges, &plain, &columns),
            rules.key(TableKind::Edges, &other, &columns)
        );
    }

    #[test]
    fn node_priority_prefers_rank_then_name() {
        let rules = rules();
        let columns = Columns::new(TableKind::Nodes);

        let mut named = Row {
            values: vec![String::new(); columns.len()],
            rank: 1,
            source: Arc::from("satellite"),
            ..Row::default()
        };
        named.set(&columns, "id", "CHEBI:1".to_string());
        named.set(&columns, "name", "water".to_string());

        let mut unnamed = named.clone();
        unnamed.set(&columns, "name", String::new());
        unnamed.rank = 0;

        // lower source rank beats a present name
        let named_priority = rules.priority(TableKind::Nodes, &named, &columns);
        let unnamed_priority = rules.priority(TableKind::Nodes, &unnamed, &columns);
        assert!(unnamed_priority < named_priority);

        // at the same rank a present name wins
        unnamed.rank = 1;
        let unnamed_priority = rules.priority(TableKind::Nodes, &unnamed, &columns);
        assert!(rules.priority(TableKind::Nodes, &named, &columns) < unnamed_priority);
    }

    #[test]
    fn longer_xref_breaks_name_ties() {
        let rules = rules();
        let columns = Columns::new(TableKind::Nodes);

        let mut short = Row {
            values: vec![String::new(); columns.len()],
            source: Arc::from("a"),
            ..Row::default()
        };
        short.set(&columns, "name", "water".to_string());
        short.set(&columns, "xref", "CAS:7732-18-5".to_string());

        let mut long = short.clone();
        long.set(&columns, "xref", "CAS:7732-18-5|KEGG:C00001".to_string());

        assert!(
            rules.priority(TableKind::Nodes, &long, &columns) < rules.priority(TableKind::Nodes, &short, &columns)
        );
    }

    #[test]
    fn configured_overrides_replace_and_extend() {
        let mut config = DedupConfig::default();
        config.predicate_priority = Some(HashMap::from([("biolink:related_to".to_string(), 1)]));
        config.pruned_pairs.push(("GO".to_string(), "GO".to_string()));
        config
            .fanout_exempt_pairs
            .push(("Proteomes".to_string(), "NCBITaxon".to_string()));
        let rules = DedupRules::new(&config);

        assert_eq!(rules.predicate_rank("biolink:related_to"), 1);
        // an override table replaces the built-in one entirely
        assert_eq!(rules.predicate_rank("biolink:subclass_of"), 6);
        assert!(rules.is_pruned("GO:1", "GO:2"));
        assert!(rules.is_fanout_exempt("Proteomes:UP1", "NCBITaxon:562"));
        assert!(rules.is_fanout_exempt("NCBITaxon:562", "CHEBI:1"));
    }
}
