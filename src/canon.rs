use std::collections::HashMap;

use crate::config::CanonConfig;
use crate::model::{curie_local, curie_prefix, Columns, Row};


/// Legacy prefixes rewritten to their current registry form.
static PREFIX_REWRITES: &[(&str, &str)] = &[
    ("medium", "mediadive.medium"),
    ("solution", "mediadive.solution"),
    ("ingredient", "mediadive.ingredient"),
    ("strain", "kgmicrobe.strain"),
    ("ec", "EC"),
    ("eccode", "EC"),
];

/// Deprecated category names replaced with their current spelling.
static CATEGORY_REWRITES: &[(&str, &str)] = &[("biolink:ChemicalSubstance", "biolink:ChemicalEntity")];

/// The legacy IntEnz query form occasionally found in EC identifiers and IRIs.
static INTENZ_QUERY: &str = "intenz/query";

static EC_CATEGORY: &str = "biolink:MolecularActivity";
static MEDIUM_CATEGORY: &str = "METPO:1004005";


/// The outcome of canonicalizing a single row.
#[derive(Debug, PartialEq, Eq)]
pub enum CanonOutcome {
    Kept,
    /// The row was dropped because the named required field was empty.
    Dropped(&'static str),
}


/// Normalizes identifier strings and category values so downstream equality
/// tests are well-defined. Pure and deterministic; the rewrite tables are
/// fixed at construction so tests can instantiate alternates.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    prefix_map: HashMap<String, String>,
    category_map: HashMap<String, String>,
}

impl Canonicalizer {
    pub fn new(config: &CanonConfig) -> Canonicalizer {
        let mut prefix_map: HashMap<String, String> = PREFIX_REWRITES
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        prefix_map.extend(config.prefix_map.clone());

        let mut category_map: HashMap<String, String> = CATEGORY_REWRITES
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        category_map.extend(config.category_map.clone());

        Canonicalizer {
            prefix_map,
            category_map,
        }
    }

    /// Rewrites one identifier: trims it, converts legacy IntEnz query URLs
    /// to EC compact URIs, and applies the prefix rewrite table.
    pub fn identifier(&self, id: &str) -> String {
        let id = id.trim();

        if id.contains(INTENZ_QUERY) {
            if let Some(code) = intenz_code(id) {
                return format!("EC:{code}");
            }
        }

        match id.split_once(':') {
            Some((prefix, local)) => match self.prefix_map.get(prefix) {
                Some(rewritten) => format!("{rewritten}:{local}"),
                None => id.to_string(),
            },
            None => id.to_string(),
        }
    }

    pub fn canon_node(&self, row: &mut Row, columns: &Columns) -> CanonOutcome {
        let id = self.identifier(row.get(columns, "id"));

        // category canonicalization happens before trimming so the
        // substitution tables only ever see trimmed keys
        let mut category = row.get(columns, "category").trim().to_string();
        if let Some(rewritten) = self.category_map.get(&category) {
            category = rewritten.clone();
        }
        match curie_prefix(&id) {
            "EC" => category = EC_CATEGORY.to_string(),
            "mediadive.medium" => category = MEDIUM_CATEGORY.to_string(),
            _ => {}
        }

        row.set(columns, "id", id);
        row.set(columns, "category", category);
        trim_values(row);

        // EC iri rewriting: replace the legacy IntEnz form (or fill an absent
        // iri) with the canonical form derived from the local code
        let id = row.get(columns, "id");
        if curie_prefix(id) == "EC" {
            let iri = row.get(columns, "iri");
            if iri.is_empty() || iri.contains(INTENZ_QUERY) {
                let iri = format!("https://enzyme.expasy.org/EC/{}", curie_local(id));
                row.set(columns, "iri", iri);
            }
        }

        if row.get(columns, "id").is_empty() {
            return CanonOutcome::Dropped("id");
        }
        if row.get(columns, "category").is_empty() {
            return CanonOutcome::Dropped("category");
        }
        CanonOutcome::Kept
    }

    pub fn canon_edge(&self, row: &mut Row, columns: &Columns) -> CanonOutcome {
        let subject = self.identifier(row.get(columns, "subject"));
        let object = self.identifier(row.get(columns, "object"));
        row.set(columns, "subject", subject);
        row.set(columns, "object", object);
        trim_values(row);

        if row.get(columns, "subject").is_empty() {
            return CanonOutcome::Dropped("subject");
        }
        if row.get(columns, "object").is_empty() {
            return CanonOutcome::Dropped("object");
        }
        if row.get(columns, "predicate").is_empty() {
            return CanonOutcome::Dropped("predicate");
        }
        CanonOutcome::Kept
    }
}

fn trim_values(row: &mut Row) {
    for value in &mut row.values {
        let trimmed = value.trim();
        if trimmed.len() != value.len() {
            *value = trimmed.to_string();
        }
    }
}

/// Pulls the EC code out of a legacy IntEnz query URL.
fn intenz_code(iri: &str) -> Option<&str> {
    let (_, tail) = iri.split_once("ec=")?;
    let code = tail.split('&').next().unwrap_or(tail);
    if code.is_empty() {
        None
    }
    else {
        Some(code)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableKind;

    fn canonicalizer() -> Canonicalizer {
        Canonicalizer::new(&CanonConfig::default())
    }

    fn node_row(columns: &Columns, id: &str, category: &str) -> Row {
        let mut row = Row {
            values: vec![String::new(); columns.len()],
            ..Row::default()
        };
        row.set(columns, "id", id.to_string());
        row.set(columns, "category", category.to_string());
        row
    }

    #[test]
    fn legacy_prefixes_are_rewritten() {
        let canon = canonicalizer();
        assert_eq!(canon.identifier("medium:1"), "mediadive.medium:1");
        assert_eq!(canon.identifier("solution:2"), "mediadive.solution:2");
        assert_eq!(canon.identifier("ingredient:3"), "mediadive.ingredient:3");
        assert_eq!(canon.identifier("strain:4"), "kgmicrobe.strain:4");
        assert_eq!(canon.identifier("ec:1.1.1.1"), "EC:1.1.1.1");
        assert_eq!(canon.identifier("eccode:1.1.1.1"), "EC:1.1.1.1");
        assert_eq!(canon.identifier("CHEBI:17234"), "CHEBI:17234");
    }

    #[test]
    fn identifier_rewriting_is_idempotent() {
        let canon = canonicalizer();
        for id in ["medium:1", "mediadive.medium:1", "  NCBITaxon:562 ", "EC:1.1.1.1", "plain"] {
            let once = canon.identifier(id);
            assert_eq!(canon.identifier(&once), once);
        }
    }

    #[test]
    fn whitespace_only_differences_collapse() {
        let canon = canonicalizer();
        assert_eq!(canon.identifier(" CHEBI:1 "), canon.identifier("CHEBI:1"));
    }

    #[test]
    fn intenz_ids_become_ec_nodes() {
        let canon = canonicalizer();
        let columns = Columns::new(TableKind::Nodes);
        let mut row = node_row(
            &columns,
            "https://www.ebi.ac.uk/intenz/query?cmd=SearchEC&ec=1.1.1.1",
            "biolink:MolecularActivity",
        );

        assert_eq!(canon.canon_node(&mut row, &columns), CanonOutcome::Kept);
        assert_eq!(row.get(&columns, "id"), "EC:1.1.1.1");
        assert_eq!(row.get(&columns, "category"), "biolink:MolecularActivity");
        assert_eq!(row.get(&columns, "iri"), "https://enzyme.expasy.org/EC/1.1.1.1");
    }

    #[test]
    fn deprecated_categories_are_replaced() {
        let canon = canonicalizer();
        let columns = Columns::new(TableKind::Nodes);
        let mut row = node_row(&columns, "CHEBI:17234", "biolink:ChemicalSubstance");
        canon.canon_node(&mut row, &columns);
        assert_eq!(row.get(&columns, "category"), "biolink:ChemicalEntity");
    }

    #[test]
    fn media_nodes_adopt_the_metpo_category() {
        let canon = canonicalizer();
        let columns = Columns::new(TableKind::Nodes);
        let mut row = node_row(&columns, "medium:1", "biolink:ChemicalMixture");
        canon.canon_node(&mut row, &columns);
        assert_eq!(row.get(&columns, "id"), "mediadive.medium:1");
        assert_eq!(row.get(&columns, "category"), "METPO:1004005");
    }

    #[test]
    fn empty_required_fields_drop_the_row() {
        let canon = canonicalizer();
        let columns = Columns::new(TableKind::Nodes);
        let mut row = node_row(&columns, "   ", "biolink:ChemicalEntity");
        assert_eq!(canon.canon_node(&mut row, &columns), CanonOutcome::Dropped("id"));

        let edge_columns = Columns::new(TableKind::Edges);
        let mut edge = Row {
            values: vec![String::new(); edge_columns.len()],
            ..Row::default()
        };
        edge.set(&edge_columns, "subject", "A:1".to_string());
        edge.set(&edge_columns, "object", "B:2".to_string());
        assert_eq!(canon.canon_edge(&mut edge, &edge_columns), CanonOutcome::Dropped("predicate"));
    }

    #[test]
    fn node_canonicalization_is_idempotent() {
        let canon = canonicalizer();
        let mut columns = Columns::new(TableKind::Nodes);
        columns.upsert("custom");
        let mut row = node_row(&columns, " medium:7 ", " biolink:ChemicalSubstance ");
        row.set(&columns, "custom", "  padded  ".to_string());

        canon.canon_node(&mut row, &columns);
        let first = row.values.clone();
        canon.canon_node(&mut row, &columns);
        assert_eq!(row.values, first);
    }

    #[test]
    fn configured_map_extensions_apply() {
        let mut config = CanonConfig::default();
        config.prefix_map.insert("chebi".to_string(), "CHEBI".to_string());
        config
            .category_map
            .insert("biolink:Protein".to_string(), "biolink:Polypeptide".to_string());
        let canon = Canonicalizer::new(&config);

        assert_eq!(canon.identifier("chebi:15377"), "CHEBI:15377");

        let columns = Columns::new(TableKind::Nodes);
        let mut row = node_row(&columns, "UniprotKB:P0A6F5", "biolink:Protein");
        canon.canon_node(&mut row, &columns);
        assert_eq!(row.get(&columns, "category"), "biolink:Polypeptide");
    }
}
