//! Feature-usage aggregation: per-callsite API use counts partitioned
//! into monomorphic and polymorphic relations, plus script-creation and
//! script-blob harvesting.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use vv8_post_trace::record::{filter_name, ApiAccess, RecordOp};

use crate::aggregate::{
    emit_stream_record, AggregationContext, Aggregator, DatabaseSink, Format, SinkSupport,
    SqlValue,
};
use crate::context::{ExecutionContext, LogInfo, ScriptHash, ScriptId};
use crate::idl::IdlTree;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct UsageKey {
    origin: String,
    script: ScriptId,
    offset: i64,
    name: String,
    op: RecordOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Callsite {
    script: ScriptId,
    offset: i64,
}

pub struct FeatureUsageAggregator {
    idl: Arc<IdlTree>,
    usage: BTreeMap<UsageKey, u64>,
    /// Raw member names observed per callsite; cardinality ≥ 2 marks the
    /// callsite polymorphic.
    morphisms: BTreeMap<Callsite, BTreeSet<String>>,
}

impl FeatureUsageAggregator {
    pub fn new(idl: Arc<IdlTree>) -> Self {
        Self { idl, usage: BTreeMap::new(), morphisms: BTreeMap::new() }
    }

    fn is_poly(&self, site: Callsite) -> bool {
        self.morphisms.get(&site).map_or(false, |set| set.len() >= 2)
    }

    fn feature_tuples(&self, poly: bool) -> (Vec<(&UsageKey, u64)>, usize) {
        let mut tuples = Vec::new();
        let mut suppressed = 0;
        for (key, &count) in &self.usage {
            if self.is_poly(Callsite { script: key.script, offset: key.offset }) == poly {
                tuples.push((key, count));
            } else {
                suppressed += 1;
            }
        }
        (tuples, suppressed)
    }

    /// One script per distinct hash, synthetic scripts excluded.
    fn script_tuples(&self, log: &LogInfo) -> Vec<ScriptId> {
        let mut by_hash: BTreeMap<ScriptHash, ScriptId> = BTreeMap::new();
        for (id, script) in log.scripts() {
            if !script.synthetic {
                by_hash.insert(script.code_hash, id);
            }
        }
        info!(scripts = by_hash.len(), "script creation records");
        by_hash.into_values().collect()
    }
}

impl Aggregator for FeatureUsageAggregator {
    fn name(&self) -> &'static str {
        "feature_usage"
    }

    fn ingest_record(
        &mut self,
        ctx: &ExecutionContext<'_>,
        line: u64,
        op: RecordOp,
        fields: &[String],
    ) -> Result<()> {
        if op == RecordOp::New {
            // Constructor records carry no member name worth counting.
            return Ok(());
        }
        let access = match ApiAccess::from_fields(op, fields) {
            Ok(access) => access,
            Err(err) => {
                warn!(line, %err, "skipping malformed feature record");
                return Ok(());
            }
        };
        if filter_name(access.member) {
            return Ok(());
        }

        // Normalize to the defining IDL interface so receiver-side
        // polymorphism does not split one feature across names.
        let full_name = self
            .idl
            .normalize_member(access.receiver, access.member)
            .unwrap_or_else(|_| access.full_name());

        *self
            .usage
            .entry(UsageKey {
                origin: ctx.origin.origin.clone(),
                script: ctx.script_id,
                offset: access.offset,
                name: full_name,
                op,
            })
            .or_insert(0) += 1;

        self.morphisms
            .entry(Callsite { script: ctx.script_id, offset: access.offset })
            .or_default()
            .insert(access.member.to_string());
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
        for (format, tag) in [
            (Format::Features, "feature_usage"),
            (Format::PolyFeatures, "poly_feature_usage"),
        ] {
            if !ctx.formats.contains(&format) {
                continue;
            }
            let poly = format == Format::PolyFeatures;
            let (tuples, suppressed) = self.feature_tuples(poly);
            for (key, count) in &tuples {
                emit_stream_record(
                    out,
                    tag,
                    json!({
                        "security_origin": key.origin,
                        "script_hash": log.script(key.script).code_hash.sha2_hex(),
                        "script_offset": key.offset,
                        "feature_name": key.name,
                        "feature_use": key.op.as_str(),
                        "use_count": count,
                    }),
                )?;
            }
            info!(
                tag,
                emitted = tuples.len(),
                suppressed,
                "feature-usage tuples emitted"
            );
        }

        if ctx.formats.contains(&Format::Scripts) {
            for id in self.script_tuples(log) {
                let script = log.script(id);
                let eval_parent_hash = script
                    .evaled_by
                    .map(|parent| log.script(parent).code_hash.sha2_hex());
                emit_stream_record(
                    out,
                    "script_creation",
                    json!({
                        "script_hash": script.code_hash.sha2_hex(),
                        "script_url": script.url,
                        "eval_parent_hash": eval_parent_hash,
                        "isolate_ptr": log.isolate_tag(script.isolate),
                        "runtime_id": script.id,
                        "first_origin": script.first_origin.origin,
                    }),
                )?;
            }
        }

        if ctx.formats.contains(&Format::Blobs) {
            for id in self.script_tuples(log) {
                let script = log.script(id);
                emit_stream_record(
                    out,
                    "script_blob",
                    json!({
                        "script_hash": script.code_hash.sha2_hex(),
                        "script_code": script.code,
                        "sha256sum": script.code_hash.sha2_hex(),
                        "size": script.code_hash.length,
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
        let visit_domain = ctx
            .root_domain
            .clone()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null);
        let log_id = SqlValue::Text(log.log_id.to_string());

        for (format, relation) in [
            (Format::Features, "feature_usage"),
            (Format::PolyFeatures, "poly_feature_usage"),
        ] {
            if !ctx.formats.contains(&format) {
                continue;
            }
            let poly = format == Format::PolyFeatures;
            let (tuples, suppressed) = self.feature_tuples(poly);
            let rows: Vec<Vec<SqlValue>> = tuples
                .iter()
                .map(|(key, count)| {
                    vec![
                        log_id.clone(),
                        visit_domain.clone(),
                        SqlValue::Text(key.origin.clone()),
                        SqlValue::Bytes(log.script(key.script).code_hash.sha2.to_vec()),
                        SqlValue::Int(key.offset),
                        SqlValue::Text(key.name.clone()),
                        SqlValue::Text(key.op.as_str().to_string()),
                        SqlValue::Int(*count as i64),
                    ]
                })
                .collect();
            info!(relation, emitted = rows.len(), suppressed, "feature-usage tuples stored");
            db.bulk_insert(
                relation,
                &[
                    "logfile_id",
                    "visit_domain",
                    "security_origin",
                    "script_hash",
                    "script_offset",
                    "feature_name",
                    "feature_use",
                    "use_count",
                ],
                rows,
            )?;
        }

        if ctx.formats.contains(&Format::Scripts) {
            let rows: Vec<Vec<SqlValue>> = self
                .script_tuples(log)
                .into_iter()
                .map(|id| {
                    let script = log.script(id);
                    vec![
                        log_id.clone(),
                        visit_domain.clone(),
                        SqlValue::Bytes(script.code_hash.sha2.to_vec()),
                        script
                            .url
                            .clone()
                            .filter(|u| !u.is_empty())
                            .map(SqlValue::Text)
                            .unwrap_or(SqlValue::Null),
                        script
                            .evaled_by
                            .map(|p| SqlValue::Bytes(log.script(p).code_hash.sha2.to_vec()))
                            .unwrap_or(SqlValue::Null),
                        SqlValue::Text(log.isolate_tag(script.isolate).to_string()),
                        SqlValue::Int(script.id),
                        SqlValue::Text(script.first_origin.origin.clone()),
                    ]
                })
                .collect();
            db.bulk_insert(
                "script_creation",
                &[
                    "logfile_id",
                    "visit_domain",
                    "script_hash",
                    "script_url",
                    "eval_parent_hash",
                    "isolate_ptr",
                    "runtime_id",
                    "first_origin",
                ],
                rows,
            )?;
        }

        if ctx.formats.contains(&Format::Blobs) {
            let rows: Vec<Vec<SqlValue>> = self
                .script_tuples(log)
                .into_iter()
                .map(|id| {
                    let script = log.script(id);
                    vec![
                        SqlValue::Bytes(script.code_hash.sha2.to_vec()),
                        SqlValue::Text(script.code.clone()),
                        SqlValue::Bytes(script.code_hash.sha2.to_vec()),
                        SqlValue::Int(script.code_hash.length as i64),
                    ]
                })
                .collect();
            info!(blobs = rows.len(), "unique scripts to archive");
            db.bulk_insert(
                "script_blobs",
                &["script_hash", "script_code", "sha256sum", "size"],
                rows,
            )?;
        }
        Ok(())
    }
}
