//! NL→graph-query translation prompt assembly, static safety validation,
//! and the deterministic fallback query builder (C10).
//!
//! The actual remote model call is a `container-service` concern (it needs
//! an HTTP client and settings); everything here is pure string/regex
//! logic so it is exhaustively unit-testable. Grounded in the reference
//! implementation's `graph_nl2cypher.py`, translated into the restricted
//! read-only dialect the graph store adapter executes.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::GraphSchema;

/// Forbidden keywords/patterns a validated query must not contain (§4.5).
/// Case-insensitive, matched as whole words where relevant.
const DISALLOWED_PATTERNS: &[&str] = &[
    r"(?i)\bcreate\b",
    r"(?i)\bmerge\b",
    r"(?i)\bdelete\b",
    r"(?i)\bremove\b",
    r"(?i)\bdrop\b",
    r"(?i)\bset\s+",
    r"(?i)\bcall\s+db\.",
    r"(?i)apoc\.",
    r"(?i)\bload\s+csv\b",
    r"(?i)\bperiodic\b",
    r"(?i)\bindex\b",
    r"(?i)\bconstraint\b",
];

static DISALLOWED: Lazy<Vec<Regex>> =
    Lazy::new(|| DISALLOWED_PATTERNS.iter().map(|p| Regex::new(p).unwrap()).collect());

static HOP_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\s*(\d+)(?:\.\.(\d+))?").unwrap());
static NODE_LABEL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\s*\w*\s*:`?([A-Za-z0-9_]+)`?").unwrap());
static REL_TYPE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-\s*\[\s*\w*\s*:`?([A-Za-z0-9_]+)`?").unwrap());
static APOC_TO_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)apoc\.convert\.toJson\(([^)]+)\)").unwrap());
static MATCH_LEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(match|optional match|with|unwind|return|call)").unwrap());

/// Always-allowed node label / relationship type, regardless of schema.
pub const BASE_NODE_LABEL: &str = "LLCNode";
pub const BASE_EDGE_TYPE: &str = "LLCEdge";

/// Chat messages to send to the remote translator model. Kept as a plain
/// struct rather than depending on any particular HTTP client's message
/// type.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// Assemble the strict system+user prompt pair described in §4.5.
pub fn build_prompt(
    query: &str,
    schema: &GraphSchema,
    max_hops: u32,
    k: usize,
    container_id: &str,
) -> Vec<ChatMessage> {
    let allowed_labels: BTreeSet<String> = schema
        .node_labels
        .iter()
        .cloned()
        .chain(std::iter::once(BASE_NODE_LABEL.to_string()))
        .collect();
    let allowed_rels: BTreeSet<String> = schema
        .edge_types
        .iter()
        .cloned()
        .chain(std::iter::once(BASE_EDGE_TYPE.to_string()))
        .collect();

    let system = format!(
        "You are a Cypher query generator. Generate safe, read-only queries.\n\n\
         RULES:\n\
         1. ALWAYS filter every node pattern by $cid (container_id)\n\
         2. Use ONLY these node labels: {}\n\
         3. Use ONLY these relationship types: {}\n\
         4. NEVER use CREATE, MERGE, DELETE, SET, DROP, REMOVE, INDEX, CONSTRAINT, CALL db.*, or apoc.*\n\
         5. Keep relationship hops <= {}\n\
         6. Include LIMIT {}\n\
         7. Return exactly two columns named 'nodes' and 'rel_maps'\n\n\
         Output ONLY the query, no explanation.",
        allowed_labels.into_iter().collect::<Vec<_>>().join(", "),
        allowed_rels.into_iter().collect::<Vec<_>>().join(", "),
        max_hops,
        k,
    );
    let user = format!("Container ID: {}\nQuestion: {}\n", container_id, query.trim());

    vec![
        ChatMessage { role: "system", content: system },
        ChatMessage { role: "user", content: user },
    ]
}

/// Strip Markdown code fences from a model response.
pub fn strip_code_fences(text: &str) -> String {
    if text.contains("```") {
        let cleaned = text.replace("```cypher", "```");
        let parts: Vec<&str> = cleaned.split("```").collect();
        if parts.len() >= 3 {
            return parts[1].trim().to_string();
        }
    }
    text.trim().to_string()
}

/// Skim to the first MATCH/WITH/OPTIONAL MATCH/UNWIND/RETURN/CALL line so
/// that any prose the model prepended (which might itself contain banned
/// words) is dropped.
pub fn extract_first_query(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let start = lines.iter().position(|l| MATCH_LEAD.is_match(l));
    match start {
        Some(i) => lines[i..].join("\n"),
        None => text.trim().to_string(),
    }
}

/// Replace banned helper-function patterns (e.g. a JSON-of-properties
/// helper) with a safe equivalent.
pub fn strip_banned_functions(text: &str) -> String {
    APOC_TO_JSON.replace_all(text, "properties($1)").into_owned()
}

/// Append `LIMIT k` if the query does not already contain one. Returns the
/// (possibly modified) query and whether a limit was added.
pub fn ensure_limit(query: &str, k: usize) -> (String, bool) {
    if query.to_lowercase().contains("limit") {
        return (query.to_string(), false);
    }
    let trimmed = query.trim().trim_end_matches(';');
    (format!("{}\nLIMIT {}", trimmed, k), true)
}

/// Validation outcome: `issues` is empty iff the query is safe to run.
/// `unknown_labels`/`unknown_rels` are annotated, not rejection reasons
/// (§4.5: "annotating (not rejecting) unknown labels/rel types").
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub issues: Vec<&'static str>,
    pub unknown_labels: Vec<String>,
    pub unknown_rels: Vec<String>,
}

/// Static safety validation for a candidate query (§4.5, §8 invariant:
/// every executed graph query contains `$cid` and a `LIMIT`, no write/DDL
/// keyword, and uses only allowed labels/relationship types).
pub fn validate_query(query: &str, schema: &GraphSchema, max_hops: u32) -> ValidationOutcome {
    let mut out = ValidationOutcome::default();

    if query.trim().is_empty() {
        out.issues.push("GRAPH_QUERY_INVALID");
        return out;
    }

    for pattern in DISALLOWED.iter() {
        if pattern.is_match(query) {
            out.issues.push("GRAPH_QUERY_INVALID");
            return out;
        }
    }

    let lower = query.to_lowercase();
    if !lower.contains("limit") {
        out.issues.push("GRAPH_QUERY_INVALID");
    }
    if !lower.contains("$cid") {
        out.issues.push("GRAPH_QUERY_INVALID");
    }

    let mut max_seen = 0u32;
    for cap in HOP_PATTERN.captures_iter(query) {
        let start: u32 = cap.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let end: u32 = cap.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(start);
        max_seen = max_seen.max(end);
    }
    if max_seen > max_hops {
        out.issues.push("GRAPH_QUERY_INVALID");
    }

    let allowed_labels: BTreeSet<&str> = schema
        .node_labels
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(BASE_NODE_LABEL))
        .collect();
    for cap in NODE_LABEL_PATTERN.captures_iter(query) {
        let label = cap.get(1).unwrap().as_str();
        if !allowed_labels.contains(label) {
            out.unknown_labels.push(label.to_string());
        }
    }

    let allowed_rels: BTreeSet<&str> = schema
        .edge_types
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(BASE_EDGE_TYPE))
        .collect();
    for cap in REL_TYPE_PATTERN.captures_iter(query) {
        let rel = cap.get(1).unwrap().as_str();
        if !allowed_rels.contains(rel) {
            out.unknown_rels.push(rel.to_string());
        }
    }

    out.valid = out.issues.is_empty();
    out
}

/// Deterministic fallback query: find up to `k` `LLCNode`s whose
/// summary/label contains a keyword from the question, expand one hop,
/// project `nodes` + `rel_maps` (§4.5).
pub fn build_fallback_query(max_hops: u32, k: usize, query: Option<&str>) -> String {
    let _ = max_hops; // fallback is always a one-hop expansion per §4.5
    let keywords: Vec<String> = query
        .unwrap_or_default()
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| regex::escape(&w.to_lowercase()))
        .collect();

    let where_clause = if keywords.is_empty() {
        String::new()
    } else {
        format!(
            "WHERE n.summary IS NOT NULL AND toLower(n.summary) =~ '.*({}).*'\n",
            keywords.join("|")
        )
    };

    format!(
        "MATCH (n:{label} {{container_id: $cid}})\n\
         {where_clause}WITH n LIMIT {k}\n\
         WITH collect(n) AS seed_nodes\n\
         OPTIONAL MATCH (seed)-[r:{edge}]-(neighbor:{label} {{container_id: $cid}})\n\
         WHERE seed IN seed_nodes\n\
         WITH seed_nodes + collect(DISTINCT neighbor) AS all_nodes, collect(DISTINCT r) AS rels\n\
         UNWIND all_nodes AS node\n\
         WITH collect(DISTINCT node)[0..{k}] AS nodes, rels\n\
         RETURN nodes AS nodes, rels AS rel_maps\n\
         LIMIT {k}",
        label = BASE_NODE_LABEL,
        edge = BASE_EDGE_TYPE,
        k = k,
        where_clause = where_clause,
    )
}

/// Whether a line looks like the start of a query body, used by the
/// translator client to decide if an LLM response needs [`extract_first_query`].
pub fn looks_like_query_start(line: &str) -> bool {
    MATCH_LEAD.is_match(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> GraphSchema {
        GraphSchema {
            node_labels: vec!["Person".to_string(), "Project".to_string()],
            edge_types: vec!["WORKS_ON".to_string()],
        }
    }

    #[test]
    fn rejects_empty_query() {
        let out = validate_query("", &schema(), 2);
        assert!(!out.valid);
    }

    #[test]
    fn rejects_write_keywords() {
        let q = "MATCH (n:LLCNode {container_id: $cid}) CREATE (m) RETURN n LIMIT 10";
        let out = validate_query(q, &schema(), 2);
        assert!(!out.valid);
    }

    #[test]
    fn rejects_missing_limit_or_cid() {
        let no_limit = "MATCH (n:LLCNode {container_id: $cid}) RETURN n";
        assert!(!validate_query(no_limit, &schema(), 2).valid);
        let no_cid = "MATCH (n:LLCNode) RETURN n LIMIT 10";
        assert!(!validate_query(no_cid, &schema(), 2).valid);
    }

    #[test]
    fn rejects_hops_exceeding_max() {
        let q = "MATCH (n:LLCNode {container_id: $cid})-[r:LLCEdge*1..5]-(m) RETURN n LIMIT 10";
        assert!(!validate_query(q, &schema(), 2).valid);
    }

    #[test]
    fn accepts_well_formed_query_and_annotates_unknown_label() {
        let q = "MATCH (n:Spaceship {container_id: $cid})-[r:WORKS_ON*1..2]-(m:Person {container_id: $cid}) RETURN n AS nodes, r AS rel_maps LIMIT 10";
        let out = validate_query(q, &schema(), 2);
        assert!(out.valid);
        assert_eq!(out.unknown_labels, vec!["Spaceship".to_string()]);
    }

    #[test]
    fn ensure_limit_appends_when_absent() {
        let (q, added) = ensure_limit("MATCH (n) RETURN n", 5);
        assert!(added);
        assert!(q.to_lowercase().contains("limit 5"));
        let (q2, added2) = ensure_limit("MATCH (n) RETURN n LIMIT 5", 5);
        assert!(!added2);
        assert_eq!(q2, "MATCH (n) RETURN n LIMIT 5");
    }

    #[test]
    fn fallback_query_always_has_cid_and_limit() {
        let q = build_fallback_query(2, 20, Some("who works on project x"));
        assert!(q.contains("$cid"));
        assert!(q.to_lowercase().contains("limit"));
        let schema = GraphSchema::default();
        let out = validate_query(&q, &schema, 2);
        assert!(out.valid, "fallback must validate: {:?}", out.issues);
    }

    #[test]
    fn strip_code_fences_extracts_inner_block() {
        let text = "here you go:\n```cypher\nMATCH (n) RETURN n LIMIT 1\n```";
        assert_eq!(strip_code_fences(text), "MATCH (n) RETURN n LIMIT 1");
    }

    #[test]
    fn extract_first_query_drops_leading_prose() {
        let text = "Sure, here is the query:\nMATCH (n:LLCNode {container_id: $cid}) RETURN n LIMIT 1";
        let extracted = extract_first_query(text);
        assert!(extracted.starts_with("MATCH"));
    }
}
