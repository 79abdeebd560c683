//! Tracks DOM element types created through Document.createElement.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};

use vv8_post_trace::record::{filter_name, strip_quotes, ApiAccess, RecordOp};

use crate::aggregate::{
    emit_stream_record, AggregationContext, Aggregator, DatabaseSink, Format, SinkSupport,
    SqlValue,
};
use crate::context::{ExecutionContext, LogInfo, ScriptId};
use crate::idl::IdlTree;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OriginCallsite {
    origin: String,
    script: ScriptId,
    offset: i64,
}

pub struct CreateElementAggregator {
    idl: Arc<IdlTree>,
    /// Lowercased tag names created per callsite, with counts.
    tag_map: BTreeMap<OriginCallsite, BTreeMap<String, u64>>,
}

impl CreateElementAggregator {
    pub fn new(idl: Arc<IdlTree>) -> Self {
        Self { idl, tag_map: BTreeMap::new() }
    }
}

impl Aggregator for CreateElementAggregator {
    fn name(&self) -> &'static str {
        "create_element"
    }

    fn ingest_record(
        &mut self,
        ctx: &ExecutionContext<'_>,
        line: u64,
        op: RecordOp,
        fields: &[String],
    ) -> Result<()> {
        if op != RecordOp::Call {
            return Ok(());
        }
        let access = match ApiAccess::from_fields(op, fields) {
            Ok(access) => access,
            Err(err) => {
                warn!(line, %err, "skipping malformed call record");
                return Ok(());
            }
        };
        if filter_name(access.member) {
            return Ok(());
        }
        let full_name = self
            .idl
            .normalize_member(access.receiver, access.member)
            .unwrap_or_else(|_| access.full_name());
        if full_name != "HTMLDocument.createElement" {
            return Ok(());
        }

        match access.args.first().map(String::as_str).and_then(strip_quotes) {
            Some(tag_name) => {
                debug!(tag = tag_name, offset = access.offset, "createElement");
                *self
                    .tag_map
                    .entry(OriginCallsite {
                        origin: ctx.origin.origin.clone(),
                        script: ctx.script_id,
                        offset: access.offset,
                    })
                    .or_default()
                    .entry(tag_name.to_ascii_lowercase())
                    .or_insert(0) += 1;
            }
            None => warn!(line, "bogus argument to Document.createElement"),
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
        if !ctx.formats.contains(&Format::CreateElement) {
            return Ok(());
        }
        for (site, tags) in &self.tag_map {
            for (tag, count) in tags {
                emit_stream_record(
                    out,
                    "create_element",
                    json!({
                        "script_hash": log.script(site.script).code_hash.sha2_hex(),
                        "script_offset": site.offset,
                        "security_origin": site.origin,
                        "tag_name": tag,
                        "create_count": count,
                    }),
                )?;
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
        if !ctx.formats.contains(&Format::CreateElement) {
            return Ok(());
        }
        let visit_domain = ctx
            .root_domain
            .clone()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null);
        let log_id = SqlValue::Text(log.log_id.to_string());
        let mut rows = Vec::new();
        for (site, tags) in &self.tag_map {
            for (tag, count) in tags {
                rows.push(vec![
                    log_id.clone(),
                    visit_domain.clone(),
                    SqlValue::Text(site.origin.clone()),
                    SqlValue::Bytes(log.script(site.script).code_hash.sha2.to_vec()),
                    SqlValue::Int(site.offset),
                    SqlValue::Text(tag.clone()),
                    SqlValue::Int(*count as i64),
                ]);
            }
        }
        db.bulk_insert(
            "create_elements",
            &[
                "logfile_id",
                "visit_domain",
                "security_origin",
                "script_hash",
                "script_offset",
                "tag_name",
                "create_count",
            ],
            rows,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::FormatSet;

    fn idl() -> Arc<IdlTree> {
        Arc::new(
            IdlTree::from_json(
                r#"{
                    "Document": { "methods": ["createElement"] },
                    "HTMLDocument": { "parent": "Document" }
                }"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn counts_created_tags_lowercased() {
        // Empty tree: normalization falls back to the raw receiver name.
        let idl = Arc::new(IdlTree::from_json("{}").unwrap());
        let trace = concat!(
            "~I\n",
            "@\"http://x\"\n",
            "$3:\"http://x/s.js\":code\n",
            "!3\n",
            "c10:\"createElement\":{HTMLDocument}:\"DIV\"\n",
            "c10:\"createElement\":{HTMLDocument}:\"div\"\n",
            "c10:\"createElement\":{HTMLDocument}:\"Div\"\n",
            "c10:\"createElement\":{HTMLDocument}:\"span\"\n",
        );
        let mut log = LogInfo::new("t.log", None);
        let mut agg = CreateElementAggregator::new(idl);
        log.ingest_stream(trace.as_bytes(), &mut [&mut agg as &mut dyn Aggregator])
            .unwrap();
        let ctx = AggregationContext {
            formats: [Format::CreateElement].into_iter().collect::<FormatSet>(),
            root_domain: None,
        };
        let mut out = Vec::new();
        agg.dump_to_stream(&ctx, &log, &mut out).unwrap();
        let records: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        let div = records.iter().find(|r| r[1]["tag_name"] == "div").unwrap();
        assert_eq!(div[1]["create_count"], 3);
        assert_eq!(div[1]["script_offset"], 10);
        assert_eq!(div[1]["security_origin"], "http://x");
        let span = records.iter().find(|r| r[1]["tag_name"] == "span").unwrap();
        assert_eq!(span[1]["create_count"], 1);
    }

    #[test]
    fn other_calls_are_ignored() {
        let trace = concat!(
            "~I\n",
            "@\"http://x\"\n",
            "$3:\"http://x/s.js\":code\n",
            "!3\n",
            "c10:\"createTextNode\":{HTMLDocument}:\"hi\"\n",
            "g11:{HTMLDocument}:\"createElement\"\n",
        );
        let mut log = LogInfo::new("t.log", None);
        let mut agg = CreateElementAggregator::new(idl());
        log.ingest_stream(trace.as_bytes(), &mut [&mut agg as &mut dyn Aggregator])
            .unwrap();
        assert!(agg.tag_map.is_empty());
    }
}
