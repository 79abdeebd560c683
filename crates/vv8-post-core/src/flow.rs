//! Per-script API flow: the ordered sequence of `offset,name,op` trigrams
//! each script performed.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use vv8_post_trace::record::{filter_name, ApiAccess, RecordOp};

use crate::aggregate::{
    emit_stream_record, AggregationContext, Aggregator, DatabaseSink, SinkSupport, SqlValue,
};
use crate::context::{ExecutionContext, LogInfo, ScriptId};

pub struct FlowAggregator {
    scripts: BTreeMap<ScriptId, Vec<String>>,
    /// Previous action, as `(script, "offset,name")`, for collapsing a
    /// call onto its own preceding access of the same member.
    last_action: Option<(ScriptId, String)>,
}

impl FlowAggregator {
    pub fn new() -> Self {
        Self { scripts: BTreeMap::new(), last_action: None }
    }
}

impl Default for FlowAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator for FlowAggregator {
    fn name(&self) -> &'static str {
        "script_flow"
    }

    fn ingest_record(
        &mut self,
        ctx: &ExecutionContext<'_>,
        line: u64,
        op: RecordOp,
        fields: &[String],
    ) -> Result<()> {
        let access = match ApiAccess::from_fields(op, fields) {
            Ok(access) => access,
            Err(err) => {
                warn!(line, %err, "skipping malformed flow record");
                return Ok(());
            }
        };
        if filter_name(access.member) {
            return Ok(());
        }
        let full_name = access.full_name();
        let prefix = format!("{},{}", access.offset, full_name);
        let action = format!("{},{}", prefix, op.as_str());

        // A call observed immediately after another access of the same
        // callsite/member replaces that entry (typically the get of the
        // function object preceding its invocation).
        if op == RecordOp::Call {
            if let Some((last_script, last_prefix)) = &self.last_action {
                if *last_script == ctx.script_id && *last_prefix == prefix {
                    if let Some(apis) = self.scripts.get_mut(&ctx.script_id) {
                        apis.pop();
                    }
                }
            }
        }

        self.scripts.entry(ctx.script_id).or_default().push(action);
        self.last_action = Some((ctx.script_id, prefix));
        Ok(())
    }

    fn sinks(&self) -> SinkSupport {
        SinkSupport::STREAM | SinkSupport::DATABASE
    }

    fn dump_to_stream(
        &mut self,
        _ctx: &AggregationContext,
        log: &LogInfo,
        out: &mut dyn Write,
    ) -> Result<()> {
        for (script_id, apis) in &self.scripts {
            let script = log.script(*script_id);
            let evaled_by = script.evaled_by.map(|p| log.script(p).id).unwrap_or(-1);
            emit_stream_record(
                out,
                "script_flow",
                json!({
                    "script_id": script.id,
                    "isolate": log.isolate_tag(script.isolate),
                    "synthetic": script.synthetic,
                    "code": script.code,
                    "url": script.url,
                    "evaled_by": evaled_by,
                    "first_origin": script.first_origin.origin,
                    "apis": apis,
                }),
            )?;
        }
        Ok(())
    }

    fn dump_to_database(
        &mut self,
        _ctx: &AggregationContext,
        log: &LogInfo,
        db: &mut dyn DatabaseSink,
    ) -> Result<()> {
        info!(scripts = self.scripts.len(), "script flows analysed");
        let rows: Vec<Vec<SqlValue>> = self
            .scripts
            .iter()
            .map(|(script_id, apis)| {
                let script = log.script(*script_id);
                vec![
                    SqlValue::Text(log.isolate_tag(script.isolate).to_string()),
                    log.submission_id
                        .map(|id| SqlValue::Text(id.to_string()))
                        .unwrap_or(SqlValue::Null),
                    SqlValue::Int(script.id),
                    SqlValue::Bool(script.synthetic),
                    SqlValue::Text(script.code.clone()),
                    script
                        .url
                        .clone()
                        .map(SqlValue::Text)
                        .unwrap_or(SqlValue::Null),
                    SqlValue::Int(script.evaled_by.map(|p| log.script(p).id).unwrap_or(-1)),
                    SqlValue::TextArray(apis.clone()),
                    SqlValue::Text(script.first_origin.origin.clone()),
                ]
            })
            .collect();
        db.bulk_insert(
            "script_flow",
            &[
                "isolate",
                "submission_id",
                "script_id",
                "synthetic",
                "code",
                "url",
                "evaled_by",
                "apis",
                "first_origin",
            ],
            rows,
        )?;
        Ok(())
    }
}
