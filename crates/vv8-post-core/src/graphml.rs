//! GraphML serialization of the causality graph, plus a minimal reader
//! for round-trip checks.
//!
//! Node identity is `(isolate, is_iframe, script_id)`. GraphML cannot
//! represent two edges between one node pair; the duplicate is logged and
//! dropped, and consumers needing multi-edges use the JSON edge stream.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::causality::{CausalityGraph, NodeRef};
use crate::context::{LogInfo, ScriptHash};

struct KeyDef {
    id: &'static str,
    target: &'static str,
    name: &'static str,
    attr_type: &'static str,
    default: &'static str,
}

const KEY_DEFS: &[KeyDef] = &[
    KeyDef { id: "d0", target: "node", name: "isRoot", attr_type: "boolean", default: "false" },
    KeyDef { id: "d1", target: "node", name: "isolateKey", attr_type: "string", default: "unknown" },
    KeyDef { id: "d2", target: "node", name: "scriptID", attr_type: "long", default: "-1" },
    KeyDef { id: "d3", target: "node", name: "bytes", attr_type: "long", default: "0" },
    KeyDef { id: "d4", target: "node", name: "sha2", attr_type: "string", default: "unknown" },
    KeyDef { id: "d5", target: "node", name: "url", attr_type: "string", default: "" },
    KeyDef { id: "d6", target: "node", name: "isIframe", attr_type: "boolean", default: "false" },
    KeyDef { id: "d7", target: "node", name: "firstOrigin", attr_type: "string", default: "unknown" },
    KeyDef { id: "d8", target: "edge", name: "action", attr_type: "string", default: "unknown" },
    KeyDef { id: "d9", target: "edge", name: "url", attr_type: "string", default: "" },
];

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NodeKey {
    isolate: String,
    is_iframe: bool,
    script_id: i64,
}

fn node_key(graph: &CausalityGraph, log: &LogInfo, node: NodeRef) -> NodeKey {
    match node {
        NodeRef::Script(id) => {
            let script = log.script(id);
            NodeKey {
                isolate: log.isolate_tag(script.isolate).to_string(),
                is_iframe: false,
                script_id: script.id,
            }
        }
        NodeRef::Iframe(id) => {
            let frame = graph.iframe(id);
            NodeKey {
                isolate: frame
                    .isolate
                    .map(|iso| log.isolate_tag(iso).to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                is_iframe: true,
                script_id: frame.id,
            }
        }
    }
}

fn node_data(graph: &CausalityGraph, log: &LogInfo, node: NodeRef) -> Vec<(&'static str, String)> {
    match node {
        NodeRef::Script(id) => {
            let script = log.script(id);
            vec![
                ("d0", "false".to_string()),
                ("d1", log.isolate_tag(script.isolate).to_string()),
                ("d2", script.id.to_string()),
                ("d3", script.code_hash.length.to_string()),
                ("d4", script.code_hash.sha2_hex()),
                ("d5", script.url.clone().unwrap_or_default()),
                ("d6", "false".to_string()),
                ("d7", script.first_origin.origin.clone()),
            ]
        }
        NodeRef::Iframe(id) => {
            let frame = graph.iframe(id);
            vec![
                ("d0", "false".to_string()),
                (
                    "d1",
                    frame
                        .isolate
                        .map(|iso| log.isolate_tag(iso).to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                ),
                ("d2", frame.id.to_string()),
                ("d3", "0".to_string()),
                // Frame nodes carry the zeroed digest, as in the JSON
                // edge stream.
                ("d4", ScriptHash::default().sha2_hex()),
                ("d5", frame.url.clone()),
                ("d6", "true".to_string()),
                ("d7", "unknown".to_string()),
            ]
        }
    }
}

/// Serialize the causality graph as a GraphML document.
pub fn to_graphml(graph: &CausalityGraph, log: &LogInfo) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");
    for key in KEY_DEFS {
        xml.push_str(&format!(
            "  <key id=\"{}\" for=\"{}\" attr.name=\"{}\" attr.type=\"{}\"><default>{}</default></key>\n",
            key.id,
            key.target,
            key.name,
            key.attr_type,
            escape_xml(key.default),
        ));
    }
    xml.push_str(&format!(
        "  <graph id=\"{}\" edgedefault=\"directed\">\n",
        escape_xml(&log.root_name)
    ));

    // Root node anchoring all orphan edges.
    xml.push_str("    <node id=\"root\"><data key=\"d0\">true</data></node>\n");

    let mut node_ids: BTreeMap<NodeKey, String> = BTreeMap::new();
    let mut edges: BTreeMap<(String, String), usize> = BTreeMap::new();
    let mut node_xml = String::new();
    let mut edge_xml = String::new();

    let mut ensure_node = |node: NodeRef, node_xml: &mut String| -> String {
        let key = node_key(graph, log, node);
        if let Some(id) = node_ids.get(&key) {
            return id.clone();
        }
        let id = format!("n{}", node_ids.len());
        node_xml.push_str(&format!("    <node id=\"{id}\">"));
        for (data_key, value) in node_data(graph, log, node) {
            node_xml.push_str(&format!(
                "<data key=\"{data_key}\">{}</data>",
                escape_xml(&value)
            ));
        }
        node_xml.push_str("</node>\n");
        node_ids.insert(key, id.clone());
        id
    };

    for r in &graph.records {
        let child_id = ensure_node(r.child, &mut node_xml);
        let (source_id, data): (String, Vec<(&str, String)>) = match r.parent {
            Some(parent) => (
                ensure_node(parent, &mut node_xml),
                vec![
                    ("d8", r.genesis.as_str().to_string()),
                    ("d9", r.url.clone().unwrap_or_default()),
                ],
            ),
            None => (
                "root".to_string(),
                vec![("d8", r.genesis.as_str().to_string())],
            ),
        };
        let edge_key = (source_id.clone(), child_id.clone());
        if edges.contains_key(&edge_key) {
            warn!(
                source = %source_id,
                target = %child_id,
                action = r.genesis.as_str(),
                "duplicate edge not representable in GraphML; dropping"
            );
            continue;
        }
        let edge_id = format!("e{}", edges.len());
        edge_xml.push_str(&format!(
            "    <edge id=\"{edge_id}\" source=\"{source_id}\" target=\"{child_id}\">"
        ));
        for (data_key, value) in &data {
            edge_xml.push_str(&format!(
                "<data key=\"{data_key}\">{}</data>",
                escape_xml(value)
            ));
        }
        edge_xml.push_str("</edge>\n");
        edges.insert(edge_key, edges.len());
    }

    xml.push_str(&node_xml);
    xml.push_str(&edge_xml);
    xml.push_str("  </graph>\n</graphml>\n");
    xml
}

/// A reparsed GraphML document: attribute maps keyed by resolved
/// attr.name. Only the subset this module emits is understood.
#[derive(Debug, Default)]
pub struct ParsedGraph {
    pub graph_id: String,
    pub nodes: BTreeMap<String, BTreeMap<String, String>>,
    pub edges: Vec<ParsedEdge>,
}

#[derive(Debug)]
pub struct ParsedEdge {
    pub source: String,
    pub target: String,
    pub attrs: BTreeMap<String, String>,
}

struct Tag {
    name: String,
    attrs: BTreeMap<String, String>,
    closing: bool,
    self_closing: bool,
}

fn parse_tag(body: &str) -> Tag {
    let body = body.trim();
    let closing = body.starts_with('/');
    let body = body.trim_start_matches('/');
    let self_closing = body.ends_with('/');
    let body = body.trim_end_matches('/');
    let mut parts = body.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default().to_string();
    let mut attrs = BTreeMap::new();
    if let Some(rest) = parts.next() {
        let mut rest = rest;
        while let Some(eq) = rest.find('=') {
            let key = rest[..eq].trim().to_string();
            let after = &rest[eq + 1..];
            let Some(quote_start) = after.find('"') else { break };
            let Some(quote_len) = after[quote_start + 1..].find('"') else { break };
            let value = &after[quote_start + 1..quote_start + 1 + quote_len];
            attrs.insert(key, unescape_xml(value));
            rest = &after[quote_start + quote_len + 2..];
        }
    }
    Tag { name, attrs, closing, self_closing }
}

/// Parse a GraphML document previously produced by [`to_graphml`].
pub fn parse_graphml(xml: &str) -> Result<ParsedGraph> {
    let mut parsed = ParsedGraph::default();
    let mut keys: BTreeMap<String, String> = BTreeMap::new();
    let mut current_attrs: Option<(String, BTreeMap<String, String>)> = None;
    let mut current_edge: Option<(String, String)> = None;

    let mut rest = xml;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            return Err(anyhow!("unterminated tag"));
        };
        let tag_body = &after[..close];
        let text_after = &after[close + 1..];

        if tag_body.starts_with('?') || tag_body.starts_with('!') {
            rest = text_after;
            continue;
        }
        let tag = parse_tag(tag_body);
        match (tag.name.as_str(), tag.closing) {
            ("key", false) => {
                if let (Some(id), Some(name)) = (tag.attrs.get("id"), tag.attrs.get("attr.name")) {
                    keys.insert(id.clone(), name.clone());
                }
            }
            ("graph", false) => {
                parsed.graph_id = tag.attrs.get("id").cloned().unwrap_or_default();
            }
            ("node", false) => {
                let id = tag
                    .attrs
                    .get("id")
                    .cloned()
                    .ok_or_else(|| anyhow!("node without id"))?;
                if tag.self_closing {
                    parsed.nodes.insert(id, BTreeMap::new());
                } else {
                    current_attrs = Some((id, BTreeMap::new()));
                    current_edge = None;
                }
            }
            ("node", true) => {
                if let Some((id, attrs)) = current_attrs.take() {
                    parsed.nodes.insert(id, attrs);
                }
            }
            ("edge", false) => {
                let source = tag
                    .attrs
                    .get("source")
                    .cloned()
                    .ok_or_else(|| anyhow!("edge without source"))?;
                let target = tag
                    .attrs
                    .get("target")
                    .cloned()
                    .ok_or_else(|| anyhow!("edge without target"))?;
                if tag.self_closing {
                    parsed.edges.push(ParsedEdge { source, target, attrs: BTreeMap::new() });
                } else {
                    current_attrs = Some((String::new(), BTreeMap::new()));
                    current_edge = Some((source, target));
                }
            }
            ("edge", true) => {
                if let (Some((_, attrs)), Some((source, target))) =
                    (current_attrs.take(), current_edge.take())
                {
                    parsed.edges.push(ParsedEdge { source, target, attrs });
                }
            }
            ("data", false) => {
                if !tag.self_closing {
                    let key_id = tag.attrs.get("key").cloned().unwrap_or_default();
                    let name = keys.get(&key_id).cloned().unwrap_or(key_id);
                    if let Some(end) = text_after.find('<') {
                        if let Some((_, attrs)) = current_attrs.as_mut() {
                            attrs.insert(name, unescape_xml(&text_after[..end]));
                        }
                    }
                }
            }
            _ => {}
        }
        rest = text_after;
    }
    Ok(parsed)
}
