//! Script causality reconstruction: for every script in the trace,
//! recover how it came to execute (eval, dynamic include/insert,
//! document.write injection, iframe load, static inclusion).

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::Write;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use vv8_post_trace::html::{HtmlToken, HtmlTokenizer};
use vv8_post_trace::record::{strip_quotes, ApiAccess, RecordOp};

use crate::aggregate::{
    emit_stream_record, AggregationContext, Aggregator, DatabaseSink, Format, SinkSupport,
    SqlValue,
};
use crate::context::{ExecutionContext, IsolateId, LogInfo, ScriptHash, ScriptId};
use crate::graphml;

/// Why a script came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Genesis {
    Eval,
    Include,
    WriteInclude,
    Insert,
    WriteInsert,
    Iframe,
    Static,
    StaticIframe,
    Unknown,
}

impl Genesis {
    pub fn as_str(self) -> &'static str {
        match self {
            Genesis::Eval => "eval",
            Genesis::Include => "include",
            Genesis::WriteInclude => "write_include",
            Genesis::Insert => "insert",
            Genesis::WriteInsert => "write_insert",
            Genesis::Iframe => "iframe",
            Genesis::Static => "static",
            Genesis::StaticIframe => "static_iframe",
            Genesis::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IframeId(pub u32);

/// A synthesized frame node; distinct from arena scripts.
#[derive(Debug, Clone)]
pub struct IframeNode {
    pub id: i64,
    pub url: String,
    pub isolate: Option<IsolateId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeRef {
    Script(ScriptId),
    Iframe(IframeId),
}

impl NodeRef {
    pub fn is_iframe(self) -> bool {
        matches!(self, NodeRef::Iframe(_))
    }
}

#[derive(Debug, Clone)]
pub struct CausalityRecord {
    pub child: NodeRef,
    pub parent: Option<NodeRef>,
    pub genesis: Genesis,
    pub url: Option<String>,
    /// Ambiguity signals: how many parents claimed this URL/hash, and how
    /// many scripts matched it.
    pub parent_card: usize,
    pub child_card: usize,
}

/// The reconstructed graph: edge records plus the synthesized iframe
/// node table they reference.
#[derive(Debug)]
pub struct CausalityGraph {
    pub records: Vec<CausalityRecord>,
    pub iframes: Vec<IframeNode>,
}

impl CausalityGraph {
    pub fn iframe(&self, id: IframeId) -> &IframeNode {
        &self.iframes[id.0 as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct GenesisLink {
    parent: ScriptId,
    via_write: bool,
}

/// Inclusions and source-map entries are keyed by the origin they were
/// observed under plus the cooked (scheme-stripped) URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct UrlKey {
    origin: String,
    url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct WriteKey {
    script: ScriptId,
    origin: String,
}

pub struct ScriptCausalityAggregator {
    include_map: BTreeMap<UrlKey, BTreeSet<GenesisLink>>,
    insert_map: BTreeMap<ScriptHash, BTreeSet<GenesisLink>>,
    write_map: BTreeMap<WriteKey, String>,
    /// Resolved frame URL → scripts that loaded it.
    iframe_map: BTreeMap<String, BTreeSet<ScriptId>>,
}

/// `//host/path?query` form of a parsed URL: everything after the scheme.
fn scheme_stripped(u: &Url) -> String {
    let s = u.as_str();
    match s.find(':') {
        Some(i) => s[i + 1..].to_string(),
        None => s.to_string(),
    }
}

fn parse_with_base(raw: &str, base_origin: &str) -> Option<Url> {
    match Url::parse(raw) {
        Ok(mut u) => {
            if u.host_str().map_or(true, |h| h.is_empty()) {
                if let Ok(base) = Url::parse(base_origin) {
                    let _ = u.set_host(base.host_str());
                }
            }
            Some(u)
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(base_origin).ok()?.join(raw).ok()
        }
        Err(_) => None,
    }
}

/// Cooked include-URL: resolved against the acting script's first origin,
/// scheme stripped. Falls back to the raw string when parsing fails.
fn cook_include_url(raw: &str, first_origin: &str) -> String {
    match parse_with_base(raw, first_origin) {
        Some(u) => scheme_stripped(&u),
        None => {
            warn!(url = raw, "cannot parse inclusion URL; keying on raw form");
            raw.to_string()
        }
    }
}

/// Cooked iframe URL: host resolved, scheme kept, so frame URLs compare
/// against origin strings. A bare "/" path is dropped for the same
/// reason: origins carry no trailing slash.
fn cook_iframe_url(raw: &str, first_origin: &str) -> String {
    match parse_with_base(raw, first_origin) {
        Some(u) => {
            let s = u.to_string();
            if u.path() == "/" && u.query().is_none() && u.fragment().is_none() {
                s.trim_end_matches('/').to_string()
            } else {
                s
            }
        }
        None => {
            warn!(url = raw, "cannot parse iframe URL; keying on raw form");
            raw.to_string()
        }
    }
}

/// Cooked script load-URL for the source index: scheme stripped, raw kept
/// when the URL does not parse (scheme-relative and path-relative strings
/// have no scheme to strip).
fn cook_script_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(u) => scheme_stripped(&u),
        Err(_) => raw.to_string(),
    }
}

impl ScriptCausalityAggregator {
    pub fn new() -> Self {
        Self {
            include_map: BTreeMap::new(),
            insert_map: BTreeMap::new(),
            write_map: BTreeMap::new(),
            iframe_map: BTreeMap::new(),
        }
    }

    fn record_inclusion(
        &mut self,
        raw_url: &str,
        first_origin: &str,
        actor_origin: &str,
        actor: ScriptId,
        via_write: bool,
    ) {
        let cooked = cook_include_url(raw_url, first_origin);
        self.include_map
            .entry(UrlKey { origin: actor_origin.to_string(), url: cooked })
            .or_default()
            .insert(GenesisLink { parent: actor, via_write });
    }

    fn record_insertion(&mut self, code_hash: ScriptHash, actor: ScriptId, via_write: bool) {
        self.insert_map
            .entry(code_hash)
            .or_default()
            .insert(GenesisLink { parent: actor, via_write });
    }

    fn record_iframe(&mut self, raw_url: &str, ctx: &ExecutionContext<'_>) {
        let cooked = cook_iframe_url(raw_url, &ctx.script.first_origin.origin);
        self.iframe_map.entry(cooked).or_default().insert(ctx.script_id);
    }

    fn append_write(&mut self, ctx: &ExecutionContext<'_>, html: &str) {
        let key = WriteKey {
            script: ctx.script_id,
            origin: ctx.origin.origin.clone(),
        };
        self.write_map.entry(key).or_default().push_str(html);
    }

    /// Parse the accumulated document.write streams as HTML, turning
    /// `<script src>` tags into write-inclusions, script bodies and `on*`
    /// handler attributes into write-insertions.
    fn drain_write_streams(&mut self, log: &LogInfo) {
        let write_map = std::mem::take(&mut self.write_map);
        for (key, stream) in write_map {
            let first_origin = log.script(key.script).first_origin.origin.clone();
            info!(
                bytes = stream.len(),
                origin = %key.origin,
                script = log.script(key.script).id,
                "parsing document.write stream"
            );
            let mut in_script = false;
            let mut chunks = String::new();
            for token in HtmlTokenizer::new(&stream) {
                match &token {
                    HtmlToken::StartTag { name, attrs, self_closing } => {
                        if name == "script" && !self_closing {
                            in_script = true;
                            for (k, v) in attrs {
                                if k == "src" {
                                    debug!(url = %v, "write-stream include");
                                    self.record_inclusion(
                                        v,
                                        &first_origin,
                                        &key.origin,
                                        key.script,
                                        true,
                                    );
                                }
                            }
                        }
                        // Event-handler attributes are script injections
                        // wherever they appear.
                        for (k, v) in attrs {
                            if k.starts_with("on") {
                                self.record_insertion(ScriptHash::new(v), key.script, true);
                            }
                        }
                    }
                    HtmlToken::EndTag { name } => {
                        if name == "script" {
                            if !chunks.is_empty() {
                                let hash = ScriptHash::new(&chunks);
                                debug!(
                                    bytes = chunks.len(),
                                    sha2 = %hash.sha2_hex(),
                                    "write-stream insert"
                                );
                                self.record_insertion(hash, key.script, true);
                            }
                            in_script = false;
                            chunks.clear();
                        }
                    }
                    HtmlToken::Text(text) => {
                        if in_script {
                            chunks.push_str(text);
                        }
                    }
                }
            }
        }
    }

    /// Run the emission algorithm over everything collected during
    /// ingest, producing the causality edge set.
    pub fn dump_records(
        &mut self,
        ctx: &AggregationContext,
        log: &LogInfo,
    ) -> Result<CausalityGraph> {
        let mut records: Vec<CausalityRecord> = Vec::new();
        let mut src_map: BTreeMap<UrlKey, Vec<ScriptId>> = BTreeMap::new();
        let mut code_map: BTreeMap<ScriptHash, Vec<ScriptId>> = BTreeMap::new();

        // Index all non-synthetic scripts; eval children become edges
        // immediately and are not indexed.
        for (id, script) in log.scripts() {
            if script.synthetic {
                continue;
            }
            if let Some(parent) = script.evaled_by {
                records.push(CausalityRecord {
                    child: NodeRef::Script(id),
                    parent: Some(NodeRef::Script(parent)),
                    genesis: Genesis::Eval,
                    url: None,
                    parent_card: 0,
                    child_card: 0,
                });
                continue;
            }
            code_map.entry(script.code_hash).or_default().push(id);
            if let Some(script_url) = script.url.as_deref().filter(|u| !u.is_empty()) {
                let key = UrlKey {
                    origin: script.first_origin.origin.clone(),
                    url: cook_script_url(script_url),
                };
                src_map.entry(key).or_default().push(id);
            }
        }

        self.drain_write_streams(log);

        let include_map = std::mem::take(&mut self.include_map);
        let insert_map = std::mem::take(&mut self.insert_map);
        let iframe_map = std::mem::take(&mut self.iframe_map);

        let remove_code_entry =
            |code_map: &mut BTreeMap<ScriptHash, Vec<ScriptId>>, script: ScriptId, hash: ScriptHash| {
                match code_map.get_mut(&hash) {
                    Some(instances) => {
                        if let Some(pos) = instances.iter().position(|&s| s == script) {
                            instances.remove(pos);
                        }
                        if instances.is_empty() {
                            code_map.remove(&hash);
                        }
                    }
                    None => {
                        warn!(sha2 = %hash.sha2_hex(), "script missing from code index during removal");
                    }
                }
            };

        // Dynamic inclusions: every script loaded from an included URL is
        // a child of every script that set that URL.
        for (key, includers) in &include_map {
            let Some(matching) = src_map.remove(key) else {
                continue;
            };
            let parent_card = includers.len();
            let child_card = matching.len();
            for &includee in &matching {
                for includer in includers {
                    records.push(CausalityRecord {
                        child: NodeRef::Script(includee),
                        parent: Some(NodeRef::Script(includer.parent)),
                        genesis: if includer.via_write {
                            Genesis::WriteInclude
                        } else {
                            Genesis::Include
                        },
                        url: Some(key.url.clone()),
                        parent_card,
                        child_card,
                    });
                }
                remove_code_entry(&mut code_map, includee, log.script(includee).code_hash);
            }
        }

        // Synthesize one frame node per distinct iframe URL.
        let mut iframes: Vec<IframeNode> = Vec::new();
        let mut frame_by_url: BTreeMap<String, IframeId> = BTreeMap::new();
        let add_frame = |iframes: &mut Vec<IframeNode>,
                             frame_by_url: &mut BTreeMap<String, IframeId>,
                             url: &str| {
            *frame_by_url.entry(url.to_string()).or_insert_with(|| {
                let id = IframeId(iframes.len() as u32);
                iframes.push(IframeNode {
                    id: iframes.len() as i64,
                    url: url.to_string(),
                    isolate: None,
                });
                id
            })
        };

        for (frame_url, parents) in &iframe_map {
            let frame = add_frame(&mut iframes, &mut frame_by_url, frame_url);
            for &parent in parents {
                iframes[frame.0 as usize].isolate = Some(log.script(parent).isolate);
                records.push(CausalityRecord {
                    child: NodeRef::Iframe(frame),
                    parent: Some(NodeRef::Script(parent)),
                    genesis: Genesis::Iframe,
                    url: Some(frame_url.clone()),
                    parent_card: 0,
                    child_card: 0,
                });
            }
        }

        let root_domain = ctx.root_domain.as_deref();
        if root_domain.is_none() {
            warn!("no root domain specified; every origin anchors through its own frame node");
        }

        // Whatever is left in the source index was loaded without any
        // observed dynamic cause: statically included.
        for (key, matching) in &src_map {
            for &script_id in matching {
                let script = log.script(script_id);
                let first_origin = script.first_origin.origin.as_str();
                let parent = if let Some(&frame) = frame_by_url.get(first_origin) {
                    iframes[frame.0 as usize].isolate = Some(script.isolate);
                    Some(NodeRef::Iframe(frame))
                } else if root_domain == Some(first_origin) {
                    // Anchored at the synthetic root.
                    None
                } else {
                    let frame = add_frame(&mut iframes, &mut frame_by_url, first_origin);
                    iframes[frame.0 as usize].isolate = Some(script.isolate);
                    Some(NodeRef::Iframe(frame))
                };
                records.push(CausalityRecord {
                    child: NodeRef::Script(script_id),
                    parent,
                    genesis: Genesis::Static,
                    url: Some(key.url.clone()),
                    parent_card: 0,
                    child_card: 0,
                });
                remove_code_entry(&mut code_map, script_id, script.code_hash);
            }
        }

        // Frame nodes synthesized for origins (not observed iframe loads)
        // have no parent of their own.
        for (frame_url, &frame) in &frame_by_url {
            if !iframe_map.contains_key(frame_url) {
                records.push(CausalityRecord {
                    child: NodeRef::Iframe(frame),
                    parent: None,
                    genesis: Genesis::StaticIframe,
                    url: Some(frame_url.clone()),
                    parent_card: 0,
                    child_card: 0,
                });
            }
        }

        // Dynamic insertions, matched by body hash against what remains.
        for (hash, inserters) in &insert_map {
            let Some(matching) = code_map.remove(hash) else {
                continue;
            };
            let parent_card = inserters.len();
            let child_card = matching.len();
            for &insertee in &matching {
                for inserter in inserters {
                    records.push(CausalityRecord {
                        child: NodeRef::Script(insertee),
                        parent: Some(NodeRef::Script(inserter.parent)),
                        genesis: if inserter.via_write {
                            Genesis::WriteInsert
                        } else {
                            Genesis::Insert
                        },
                        url: None,
                        parent_card,
                        child_card,
                    });
                }
            }
        }

        // Everything still unaccounted for.
        for matching in code_map.values() {
            for &script_id in matching {
                records.push(CausalityRecord {
                    child: NodeRef::Script(script_id),
                    parent: None,
                    genesis: Genesis::Unknown,
                    url: None,
                    parent_card: 0,
                    child_card: 0,
                });
            }
        }

        Ok(CausalityGraph { records, iframes })
    }

}

/// `(sha2, runtime id, is_iframe)` view of a node. Frame nodes carry the
/// zeroed digest, the same stand-in the relations expect for non-scripts.
fn node_identity(graph: &CausalityGraph, log: &LogInfo, node: NodeRef) -> ([u8; 32], i64, bool) {
    match node {
        NodeRef::Script(id) => {
            let script = log.script(id);
            (script.code_hash.sha2, script.id, false)
        }
        NodeRef::Iframe(id) => (ScriptHash::default().sha2, graph.iframe(id).id, true),
    }
}

impl Default for ScriptCausalityAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator for ScriptCausalityAggregator {
    fn name(&self) -> &'static str {
        "script_causality"
    }

    fn ingest_record(
        &mut self,
        ctx: &ExecutionContext<'_>,
        line: u64,
        op: RecordOp,
        fields: &[String],
    ) -> Result<()> {
        if op != RecordOp::Set && op != RecordOp::Call {
            return Ok(());
        }
        let access = match ApiAccess::from_fields(op, fields) {
            Ok(access) => access,
            Err(err) => {
                warn!(line, %err, "skipping malformed causality record");
                return Ok(());
            }
        };
        let value = access.args.first().map(String::as_str);

        match (op, access.receiver, access.member) {
            (RecordOp::Set, "HTMLScriptElement", "src") => match value.and_then(strip_quotes) {
                Some(url) => self.record_inclusion(
                    url,
                    &ctx.script.first_origin.origin,
                    &ctx.origin.origin,
                    ctx.script_id,
                    false,
                ),
                None => warn!(line, value, "bogus HTMLScriptElement.src assignment"),
            },
            (RecordOp::Set, "HTMLScriptElement", "text" | "innerText") => {
                match value.and_then(strip_quotes) {
                    Some(body) => {
                        self.record_insertion(ScriptHash::new(body), ctx.script_id, false)
                    }
                    None => warn!(line, value, "bogus HTMLScriptElement.text assignment"),
                }
            }
            (RecordOp::Call, "HTMLDocument", "write" | "writeln") => {
                match value.and_then(strip_quotes) {
                    Some(html) => self.append_write(ctx, html),
                    None => warn!(line, value, "document.write with no usable argument"),
                }
            }
            (RecordOp::Set, _, "innerHTML" | "outerHTML") => {
                match value.and_then(strip_quotes) {
                    Some(html) => self.append_write(ctx, html),
                    None => warn!(line, value, "markup assignment with no usable value"),
                }
            }
            (RecordOp::Set, "HTMLIFrameElement", "src") => match value.and_then(strip_quotes) {
                Some(url) => self.record_iframe(url, ctx),
                None => warn!(line, value, "bogus HTMLIFrameElement.src assignment"),
            },
            (RecordOp::Set, "HTMLIFrameElement", "srcdoc") => {
                match value.and_then(strip_quotes) {
                    Some(html) => self.append_write(ctx, html),
                    None => warn!(line, value, "bogus HTMLIFrameElement.srcdoc assignment"),
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn sinks(&self) -> SinkSupport {
        SinkSupport::STREAM | SinkSupport::DATABASE
    }

    fn dump_to_stream(
        &mut self,
        ctx: &AggregationContext,
        log: &LogInfo,
        out: &mut dyn Write,
    ) -> Result<()> {
        let graph = self.dump_records(ctx, log)?;

        if ctx.formats.contains(&Format::CausalityGraphml) {
            let xml = graphml::to_graphml(&graph, log);
            out.write_all(xml.as_bytes())?;
            out.write_all(b"\n")?;
        }

        if ctx.formats.contains(&Format::Causality) {
            for r in &graph.records {
                let (child_hash, child_id, child_iframe) = node_identity(&graph, log, r.child);
                let mut doc = json!({
                    "child_hash": hex::encode(child_hash),
                    "script_id": child_id,
                    "is_iframe": child_iframe,
                    "genesis": r.genesis.as_str(),
                    "by_url": r.url,
                });
                match r.parent {
                    Some(parent) => {
                        let (parent_hash, parent_id, parent_iframe) =
                            node_identity(&graph, log, parent);
                        doc["parent_hash"] = json!(hex::encode(parent_hash));
                        doc["parent_script_id"] = json!(parent_id);
                        doc["parent_is_iframe"] = json!(parent_iframe);
                    }
                    None => {
                        doc["parent_hash"] = serde_json::Value::Null;
                    }
                }
                emit_stream_record(out, "script_causality", doc)?;
            }
        }
        Ok(())
    }

    fn dump_to_database(
        &mut self,
        ctx: &AggregationContext,
        log: &LogInfo,
        db: &mut dyn DatabaseSink,
    ) -> Result<()> {
        let graph = self.dump_records(ctx, log)?;
        let visit_domain = ctx
            .root_domain
            .clone()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null);
        let log_id = SqlValue::Text(log.log_id.to_string());

        if ctx.formats.contains(&Format::CausalityGraphml) {
            let xml = graphml::to_graphml(&graph, log);
            db.bulk_insert(
                "script_causality_graphml",
                &["id", "xml"],
                vec![vec![log_id.clone(), SqlValue::Text(xml)]],
            )?;
        }

        if ctx.formats.contains(&Format::Causality) {
            let rows: Vec<Vec<SqlValue>> = graph
                .records
                .iter()
                .map(|r| {
                    debug!(
                        genesis = r.genesis.as_str(),
                        url = r.url.as_deref().unwrap_or(""),
                        parents = r.parent_card,
                        children = r.child_card,
                        "causality edge"
                    );
                    let (child_hash, _, _) = node_identity(&graph, log, r.child);
                    let parent_hash = match r.parent.map(|p| node_identity(&graph, log, p)) {
                        Some((hash, _, _)) => SqlValue::Bytes(hash.to_vec()),
                        None => SqlValue::Null,
                    };
                    vec![
                        log_id.clone(),
                        visit_domain.clone(),
                        SqlValue::Bytes(child_hash.to_vec()),
                        SqlValue::Text(r.genesis.as_str().to_string()),
                        parent_hash,
                        r.url.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null),
                    ]
                })
                .collect();
            db.bulk_insert(
                "script_causality",
                &[
                    "logfile_id",
                    "visit_domain",
                    "child_hash",
                    "genesis",
                    "parent_hash",
                    "by_url",
                ],
                rows,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::FormatSet;

    fn dump(trace: &str, root_domain: Option<&str>) -> (CausalityGraph, LogInfo) {
        let mut log = LogInfo::new("t.log", None);
        let mut agg = ScriptCausalityAggregator::new();
        log.ingest_stream(trace.as_bytes(), &mut [&mut agg as &mut dyn Aggregator])
            .unwrap();
        let ctx = AggregationContext {
            formats: [Format::Causality].into_iter().collect::<FormatSet>(),
            root_domain: root_domain.map(str::to_string),
        };
        let graph = agg.dump_records(&ctx, &log).unwrap();
        (graph, log)
    }

    fn find<'g>(graph: &'g CausalityGraph, genesis: Genesis) -> Vec<&'g CausalityRecord> {
        graph.records.iter().filter(|r| r.genesis == genesis).collect()
    }

    fn script_runtime_id(log: &LogInfo, node: NodeRef) -> i64 {
        match node {
            NodeRef::Script(id) => log.script(id).id,
            NodeRef::Iframe(_) => panic!("expected a script node"),
        }
    }

    #[test]
    fn eval_children_become_eval_edges() {
        let trace = concat!(
            "~I\n",
            "@\"http://a\"\n",
            "$0:\"http://a/\":function(){}\n",
            "$1:0:evaledCode\n",
        );
        let (graph, log) = dump(trace, Some("http://a"));
        let evals = find(&graph, Genesis::Eval);
        assert_eq!(evals.len(), 1);
        assert_eq!(script_runtime_id(&log, evals[0].child), 1);
        assert_eq!(script_runtime_id(&log, evals[0].parent.unwrap()), 0);
    }

    #[test]
    fn dynamic_include_links_parent_to_loaded_script() {
        let trace = concat!(
            "~I\n",
            "@\"http://a\"\n",
            "$0:\"http://a/p.js\":parent code\n",
            "!0\n",
            "s3:{HTMLScriptElement}:\"src\":\"http://b/q.js\"\n",
            "$1:\"http://b/q.js\":included code\n",
        );
        let (graph, log) = dump(trace, Some("http://a"));
        let includes = find(&graph, Genesis::Include);
        assert_eq!(includes.len(), 1);
        let edge = includes[0];
        assert_eq!(script_runtime_id(&log, edge.child), 1);
        assert_eq!(script_runtime_id(&log, edge.parent.unwrap()), 0);
        assert_eq!(edge.url.as_deref(), Some("//b/q.js"));
        assert_eq!(edge.parent_card, 1);
        assert_eq!(edge.child_card, 1);
        // The included script is accounted for: no unknown edge for it.
        assert!(find(&graph, Genesis::Unknown).is_empty());
    }

    #[test]
    fn relative_include_inherits_host_from_first_origin() {
        let trace = concat!(
            "~I\n",
            "@\"http://a\"\n",
            "$0:\"http://a/p.js\":parent code\n",
            "!0\n",
            "s3:{HTMLScriptElement}:\"src\":\"/q.js\"\n",
            "$1:\"http://a/q.js\":included code\n",
        );
        let (graph, _log) = dump(trace, Some("http://a"));
        let includes = find(&graph, Genesis::Include);
        assert_eq!(includes.len(), 1);
        assert_eq!(includes[0].url.as_deref(), Some("//a/q.js"));
    }

    #[test]
    fn document_write_script_src_is_a_write_include() {
        let trace = concat!(
            "~I\n",
            "@\"http://a\"\n",
            "$0:\"http://a/p.js\":parent code\n",
            "!0\n",
            "c5:\"write\":{HTMLDocument}:\"<script src='http://c/r.js'></script>\"\n",
            "$1:\"http://c/r.js\":injected code\n",
        );
        let (graph, log) = dump(trace, Some("http://a"));
        let writes = find(&graph, Genesis::WriteInclude);
        assert_eq!(writes.len(), 1);
        assert_eq!(script_runtime_id(&log, writes[0].child), 1);
        assert_eq!(script_runtime_id(&log, writes[0].parent.unwrap()), 0);
    }

    #[test]
    fn written_script_bodies_and_handlers_become_insertions() {
        let body = "var injected = 1;";
        let trace = format!(
            concat!(
                "~I\n",
                "@\"http://a\"\n",
                "$0:\"http://a/p.js\":parent code\n",
                "!0\n",
                "c5:\"write\":{{HTMLDocument}}:\"<script>{body}</script>\"\n",
                "c6:\"write\":{{HTMLDocument}}:\"<img src=x onerror='pwn()'>\"\n",
            ),
            body = body,
        );
        let mut log = LogInfo::new("t.log", None);
        let mut agg = ScriptCausalityAggregator::new();
        log.ingest_stream(trace.as_bytes(), &mut [&mut agg as &mut dyn Aggregator])
            .unwrap();
        agg.drain_write_streams(&log);
        let body_links = agg.insert_map.get(&ScriptHash::new(body)).unwrap();
        assert!(body_links.iter().all(|l| l.via_write));
        assert!(
            agg.insert_map.contains_key(&ScriptHash::new("pwn()")),
            "on* attribute values are recorded as handler injections"
        );
    }

    #[test]
    fn inline_text_assignment_records_an_insertion() {
        let body = "alert(2)";
        let trace = format!(
            concat!(
                "~I\n",
                "@\"http://a\"\n",
                "$0:\"http://a/p.js\":parent code\n",
                "!0\n",
                "s9:{{HTMLScriptElement}}:\"text\":\"{body}\"\n",
                "$1:\"http://a/x\":{body}\n",
            ),
            body = body,
        );
        let mut log = LogInfo::new("t.log", None);
        let mut agg = ScriptCausalityAggregator::new();
        log.ingest_stream(trace.as_bytes(), &mut [&mut agg as &mut dyn Aggregator])
            .unwrap();
        let links = agg.insert_map.get(&ScriptHash::new(body)).unwrap().clone();
        assert_eq!(links.len(), 1);
        let link = links.iter().next().unwrap();
        assert!(!link.via_write);
        assert_eq!(log.script(link.parent).id, 0);

        // The matching script carries a load URL, so the source index
        // claims it as static before insertion matching runs.
        let ctx = AggregationContext {
            formats: [Format::Causality].into_iter().collect::<FormatSet>(),
            root_domain: None,
        };
        let graph = agg.dump_records(&ctx, &log).unwrap();
        assert_eq!(find(&graph, Genesis::Static).len(), 2);
        assert!(find(&graph, Genesis::Insert).is_empty());
    }

    #[test]
    fn iframe_loads_and_origin_anchoring() {
        let trace = concat!(
            "~I\n",
            "@\"http://a\"\n",
            "$0:\"http://a/p.js\":parent code\n",
            "!0\n",
            "s3:{HTMLIFrameElement}:\"src\":\"http://frame/\"\n",
            "@\"http://frame\"\n",
            "$1:\"http://other/in-frame.js\":frame script\n",
        );
        let (graph, log) = dump(trace, Some("http://a"));
        let iframe_edges = find(&graph, Genesis::Iframe);
        assert_eq!(iframe_edges.len(), 1);
        assert!(iframe_edges[0].child.is_iframe());
        assert_eq!(iframe_edges[0].url.as_deref(), Some("http://frame"));
        assert_eq!(script_runtime_id(&log, iframe_edges[0].parent.unwrap()), 0);

        // Script 0 is first-party static (anchored at the root, no
        // parent); script 1's first-origin is the observed iframe URL, so
        // it parents to that frame node.
        let statics = find(&graph, Genesis::Static);
        assert_eq!(statics.len(), 2);
        let rooted = statics
            .iter()
            .find(|r| script_runtime_id(&log, r.child) == 0)
            .unwrap();
        assert!(rooted.parent.is_none());
        let framed = statics
            .iter()
            .find(|r| script_runtime_id(&log, r.child) == 1)
            .unwrap();
        assert_eq!(framed.parent, Some(iframe_edges[0].child));

        // Every frame node here was an observed load: no static_iframe
        // records.
        assert!(find(&graph, Genesis::StaticIframe).is_empty());
    }

    #[test]
    fn unparsable_src_strings_still_index_as_urls() {
        // "0x0" is neither an integer nor a quoted URL; it is kept as a
        // raw URL key and the script surfaces as static, not unknown.
        let trace = concat!(
            "~I\n",
            "@\"http://a\"\n",
            "$0:0x0:no url no parent\n",
        );
        let (graph, _log) = dump(trace, Some("http://a"));
        assert!(find(&graph, Genesis::Unknown).is_empty());
        assert_eq!(find(&graph, Genesis::Static).len(), 1);
    }

    #[test]
    fn multiple_includers_multiply_edges_with_cardinality() {
        let trace = concat!(
            "~I\n",
            "@\"http://a\"\n",
            "$0:\"http://a/p.js\":parent one\n",
            "$1:\"http://a/q.js\":parent two\n",
            "!0\n",
            "s3:{HTMLScriptElement}:\"src\":\"http://b/s.js\"\n",
            "!1\n",
            "s9:{HTMLScriptElement}:\"src\":\"http://b/s.js\"\n",
            "$2:\"http://b/s.js\":shared child\n",
        );
        let (graph, log) = dump(trace, Some("http://a"));
        let includes = find(&graph, Genesis::Include);
        assert_eq!(includes.len(), 2);
        for edge in &includes {
            assert_eq!(script_runtime_id(&log, edge.child), 2);
            assert_eq!(edge.parent_card, 2);
            assert_eq!(edge.child_card, 1);
        }
    }
}
