//! First/third-party classification of scripts, by comparing the owning
//! entity of a script's URL host against the entities of its first
//! origin and of the trace's root domain.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use vv8_post_trace::record::RecordOp;

use crate::aggregate::{
    emit_stream_record, AggregationContext, Aggregator, DatabaseSink, SinkSupport, SqlValue,
};
use crate::context::{ExecutionContext, LogInfo, ScriptId};
use crate::entity::{EntityMap, EntityProperty};

pub struct FptpAggregator {
    entities: Arc<EntityMap>,
    seen: BTreeSet<ScriptId>,
}

/// Host portion of a URL-ish string. Scheme-less inputs ("example.com")
/// are read as bare hosts.
fn hostname(s: &str) -> String {
    if let Ok(u) = Url::parse(s) {
        return u.host_str().unwrap_or_default().to_string();
    }
    match Url::parse(&format!("http://{s}")) {
        Ok(u) => u.host_str().unwrap_or_default().to_string(),
        Err(_) => String::new(),
    }
}

struct Classification {
    script_entity: EntityProperty,
    origin_entity: EntityProperty,
}

impl FptpAggregator {
    pub fn new(entities: Arc<EntityMap>) -> Self {
        Self { entities, seen: BTreeSet::new() }
    }

    fn classify(&self, log: &LogInfo, script: ScriptId) -> Classification {
        let script = log.script(script);
        let script_host = hostname(script.url.as_deref().unwrap_or_default());
        let origin_host = hostname(&script.first_origin.origin);
        Classification {
            script_entity: self.entities.entity_for_host_or_unknown(&script_host),
            origin_entity: self.entities.entity_for_host_or_unknown(&origin_host),
        }
    }

    fn root_entity(&self, ctx: &AggregationContext) -> EntityProperty {
        match ctx.root_domain.as_deref() {
            Some(root) => self.entities.entity_for_host_or_unknown(&hostname(root)),
            None => {
                warn!("no root domain specified; root-party comparison degrades to empty");
                EntityProperty::unknown("")
            }
        }
    }
}

impl Aggregator for FptpAggregator {
    fn name(&self) -> &'static str {
        "first_party_third_party"
    }

    fn ingest_record(
        &mut self,
        ctx: &ExecutionContext<'_>,
        _line: u64,
        _op: RecordOp,
        _fields: &[String],
    ) -> Result<()> {
        // Classification needs only the set of scripts that executed.
        self.seen.insert(ctx.script_id);
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
        let root_entity = self.root_entity(ctx);
        for &script_id in &self.seen {
            let script = log.script(script_id);
            let c = self.classify(log, script_id);
            emit_stream_record(
                out,
                "first_party_third_party",
                json!({
                    "sha2": script.code_hash.sha2_hex(),
                    "url": script.url,
                    "first_origin": script.first_origin.origin,
                    "script_entity": c.script_entity.display_name,
                    "origin_entity": c.origin_entity.display_name,
                    "root_entity": root_entity.display_name,
                    "third_party_to_first_origin":
                        c.script_entity.display_name != c.origin_entity.display_name,
                    "third_party_to_root_domain":
                        c.script_entity.display_name != root_entity.display_name,
                    "tracking": c.script_entity.tracking,
                }),
            )?;
        }
        Ok(())
    }

    fn dump_to_database(
        &mut self,
        ctx: &AggregationContext,
        log: &LogInfo,
        db: &mut dyn DatabaseSink,
    ) -> Result<()> {
        info!(scripts = self.seen.len(), "first/third-party classification");
        let root_entity = self.root_entity(ctx);
        let root_domain = ctx.root_domain.clone().unwrap_or_default();
        let rows: Vec<Vec<SqlValue>> = self
            .seen
            .iter()
            .map(|&script_id| {
                let script = log.script(script_id);
                let c = self.classify(log, script_id);
                vec![
                    SqlValue::Bytes(script.code_hash.sha2.to_vec()),
                    SqlValue::Text(root_domain.clone()),
                    script
                        .url
                        .clone()
                        .map(SqlValue::Text)
                        .unwrap_or(SqlValue::Null),
                    SqlValue::Text(script.first_origin.origin.clone()),
                    SqlValue::Text(root_entity.display_name.clone()),
                    SqlValue::Text(c.origin_entity.display_name.clone()),
                    SqlValue::Text(c.script_entity.display_name.clone()),
                    SqlValue::Bool(
                        c.script_entity.display_name != c.origin_entity.display_name,
                    ),
                    SqlValue::Bool(c.script_entity.display_name != root_entity.display_name),
                    SqlValue::Float(c.script_entity.tracking),
                ]
            })
            .collect();
        db.bulk_insert(
            "thirdpartyfirstparty",
            &[
                "sha2",
                "root_domain",
                "url",
                "first_origin",
                "property_of_root_domain",
                "property_of_first_origin",
                "property_of_script",
                "is_script_third_party_with_first_origin",
                "is_script_third_party_with_root_domain",
                "script_origin_tracking_value",
            ],
            rows,
        )?;
        Ok(())
    }
}
