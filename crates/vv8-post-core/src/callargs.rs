//! Records the raw argument lists passed to each called API, keyed by
//! callsite and normalized API name.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::warn;

use vv8_post_trace::record::{filter_name, ApiAccess, RecordOp};

use crate::aggregate::{
    emit_stream_record, AggregationContext, Aggregator, Format, SinkSupport,
};
use crate::context::{ExecutionContext, LogInfo, ScriptId};
use crate::idl::IdlTree;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CallKey {
    origin: String,
    script: ScriptId,
    offset: i64,
    api_name: String,
}

pub struct CallArgsAggregator {
    idl: Arc<IdlTree>,
    calls: BTreeMap<CallKey, Vec<Vec<String>>>,
}

impl CallArgsAggregator {
    pub fn new(idl: Arc<IdlTree>) -> Self {
        Self { idl, calls: BTreeMap::new() }
    }
}

impl Aggregator for CallArgsAggregator {
    fn name(&self) -> &'static str {
        "callargs"
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
        let api_name = self
            .idl
            .normalize_member(access.receiver, access.member)
            .unwrap_or_else(|_| access.full_name());
        self.calls
            .entry(CallKey {
                origin: ctx.origin.origin.clone(),
                script: ctx.script_id,
                offset: access.offset,
                api_name,
            })
            .or_default()
            .push(access.args.to_vec());
        Ok(())
    }

    fn sinks(&self) -> SinkSupport {
        SinkSupport::STREAM
    }

    fn dump_to_stream(
        &mut self,
        ctx: &AggregationContext,
        log: &LogInfo,
        out: &mut dyn Write,
    ) -> Result<()> {
        if !ctx.formats.contains(&Format::CallArgs) {
            return Ok(());
        }
        for (key, args) in &self.calls {
            emit_stream_record(
                out,
                "callargs",
                json!({
                    "script_hash": log.script(key.script).code_hash.sha2_hex(),
                    "script_offset": key.offset,
                    "security_origin": key.origin,
                    "api_name": key.api_name,
                    "passed_args": args,
                }),
            )?;
        }
        Ok(())
    }
}
