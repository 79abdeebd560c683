//! Aggregator abstraction, output-format registry, and sink dispatch.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use vv8_post_trace::record::RecordOp;

use crate::context::{ExecutionContext, LogInfo};
use crate::entity::EntityMap;
use crate::idl::IdlTree;

bitflags::bitflags! {
    /// Sinks an aggregator can flush itself into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SinkSupport: u32 {
        const STREAM   = 0b01;
        const DATABASE = 0b10;
    }
}

/// Named output passes. Several names may share one aggregator instance
/// (see [`Format::tag`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Format {
    Features,
    PolyFeatures,
    Scripts,
    Blobs,
    Causality,
    CausalityGraphml,
    CreateElement,
    CallArgs,
    Flow,
    Fptp,
    Noop,
}

impl Format {
    pub const ALL: [Format; 11] = [
        Format::Features,
        Format::PolyFeatures,
        Format::Scripts,
        Format::Blobs,
        Format::Causality,
        Format::CausalityGraphml,
        Format::CreateElement,
        Format::CallArgs,
        Format::Flow,
        Format::Fptp,
        Format::Noop,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "features" => Some(Format::Features),
            "poly_features" => Some(Format::PolyFeatures),
            "scripts" => Some(Format::Scripts),
            "blobs" => Some(Format::Blobs),
            "causality" => Some(Format::Causality),
            "causality_graphml" => Some(Format::CausalityGraphml),
            "create_element" => Some(Format::CreateElement),
            "callargs" => Some(Format::CallArgs),
            "flow" => Some(Format::Flow),
            "fptp" => Some(Format::Fptp),
            "noop" => Some(Format::Noop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Format::Features => "features",
            Format::PolyFeatures => "poly_features",
            Format::Scripts => "scripts",
            Format::Blobs => "blobs",
            Format::Causality => "causality",
            Format::CausalityGraphml => "causality_graphml",
            Format::CreateElement => "create_element",
            Format::CallArgs => "callargs",
            Format::Flow => "flow",
            Format::Fptp => "fptp",
            Format::Noop => "noop",
        }
    }

    /// Formats with the same tag are served by a single aggregator
    /// instance, constructed once and flushed once.
    fn tag(self) -> AggregatorTag {
        match self {
            Format::Features | Format::PolyFeatures | Format::Scripts | Format::Blobs => {
                AggregatorTag::FeatureUsage
            }
            Format::Causality | Format::CausalityGraphml => AggregatorTag::ScriptCausality,
            Format::CreateElement => AggregatorTag::CreateElement,
            Format::CallArgs => AggregatorTag::CallArgs,
            Format::Flow => AggregatorTag::Flow,
            Format::Fptp => AggregatorTag::Fptp,
            Format::Noop => AggregatorTag::Noop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AggregatorTag {
    FeatureUsage,
    ScriptCausality,
    CreateElement,
    CallArgs,
    Flow,
    Fptp,
    Noop,
}

pub type FormatSet = BTreeSet<Format>;

/// Options shared by every aggregator at dump time.
#[derive(Debug, Default)]
pub struct AggregationContext {
    pub formats: FormatSet,
    /// Root domain of the traced page, supplied by the caller. Absence
    /// disables origin-based anchoring in the causality graph.
    pub root_domain: Option<String>,
}

/// A typed cell for one column of a bulk-insert row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    TextArray(Vec<String>),
}

/// Database back-end contract: one bulk insert per relation, executed
/// within a single transaction per aggregator. Drivers live outside this
/// workspace; tests use [`MemoryDatabaseSink`].
pub trait DatabaseSink {
    fn bulk_insert(
        &mut self,
        relation: &str,
        columns: &[&str],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<()>;
}

/// Collects bulk inserts in memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryDatabaseSink {
    pub tables: std::collections::BTreeMap<String, (Vec<String>, Vec<Vec<SqlValue>>)>,
}

impl DatabaseSink for MemoryDatabaseSink {
    fn bulk_insert(
        &mut self,
        relation: &str,
        columns: &[&str],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<()> {
        let entry = self
            .tables
            .entry(relation.to_string())
            .or_insert_with(|| (columns.iter().map(|c| c.to_string()).collect(), Vec::new()));
        entry.1.extend(rows);
        Ok(())
    }
}

/// A stateful analysis pass over one trace. Records arrive in file order,
/// already gated (active, non-synthetic script; non-empty origin), and
/// state flushes once at end of stream through a supported sink.
pub trait Aggregator {
    fn name(&self) -> &'static str;

    fn ingest_record(
        &mut self,
        ctx: &ExecutionContext<'_>,
        line: u64,
        op: RecordOp,
        fields: &[String],
    ) -> Result<()>;

    fn sinks(&self) -> SinkSupport;

    fn dump_to_stream(
        &mut self,
        ctx: &AggregationContext,
        log: &LogInfo,
        out: &mut dyn Write,
    ) -> Result<()> {
        let _ = (ctx, log, out);
        Ok(())
    }

    fn dump_to_database(
        &mut self,
        ctx: &AggregationContext,
        log: &LogInfo,
        db: &mut dyn DatabaseSink,
    ) -> Result<()> {
        let _ = (ctx, log, db);
        Ok(())
    }
}

/// The one sink chosen for a processing run.
pub enum OutputSink<'a> {
    Stream(&'a mut dyn Write),
    Database(&'a mut dyn DatabaseSink),
}

/// Flush one aggregator through the chosen sink, if it supports it;
/// unsupported combinations are logged and skipped.
pub fn dump_aggregator(
    agg: &mut dyn Aggregator,
    ctx: &AggregationContext,
    log: &LogInfo,
    sink: &mut OutputSink<'_>,
) -> Result<()> {
    match sink {
        OutputSink::Stream(out) => {
            if agg.sinks().contains(SinkSupport::STREAM) {
                agg.dump_to_stream(ctx, log, *out)
            } else {
                warn!(aggregator = agg.name(), "aggregator does not support stream dumping");
                Ok(())
            }
        }
        OutputSink::Database(db) => {
            if agg.sinks().contains(SinkSupport::DATABASE) {
                agg.dump_to_database(ctx, log, *db)
            } else {
                warn!(aggregator = agg.name(), "aggregator does not support database dumping");
                Ok(())
            }
        }
    }
}

/// Shared read-only databases handed to aggregator constructors.
#[derive(Clone, Default)]
pub struct AggregatorResources {
    pub idl: Arc<IdlTree>,
    pub entities: Option<Arc<EntityMap>>,
}

/// Instantiate the aggregators needed by a format set, de-duplicated by
/// shared tag.
pub fn make_aggregators(
    formats: &FormatSet,
    resources: &AggregatorResources,
) -> Result<Vec<Box<dyn Aggregator>>> {
    let mut made: BTreeSet<AggregatorTag> = BTreeSet::new();
    let mut aggs: Vec<Box<dyn Aggregator>> = Vec::new();
    for format in formats {
        let tag = format.tag();
        if !made.insert(tag) {
            continue;
        }
        match tag {
            AggregatorTag::FeatureUsage => {
                aggs.push(Box::new(crate::features::FeatureUsageAggregator::new(
                    resources.idl.clone(),
                )));
            }
            AggregatorTag::ScriptCausality => {
                aggs.push(Box::new(crate::causality::ScriptCausalityAggregator::new()));
            }
            AggregatorTag::CreateElement => {
                aggs.push(Box::new(crate::elements::CreateElementAggregator::new(
                    resources.idl.clone(),
                )));
            }
            AggregatorTag::CallArgs => {
                aggs.push(Box::new(crate::callargs::CallArgsAggregator::new(
                    resources.idl.clone(),
                )));
            }
            AggregatorTag::Flow => {
                aggs.push(Box::new(crate::flow::FlowAggregator::new()));
            }
            AggregatorTag::Fptp => {
                let entities = resources
                    .entities
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("fptp pass requires an entity database"))?;
                aggs.push(Box::new(crate::fptp::FptpAggregator::new(entities)));
            }
            AggregatorTag::Noop => {}
        }
    }
    Ok(aggs)
}

/// Emit one `[tag, object]` stream record, newline-delimited.
pub(crate) fn emit_stream_record(
    out: &mut dyn Write,
    tag: &str,
    doc: serde_json::Value,
) -> Result<()> {
    serde_json::to_writer(&mut *out, &serde_json::json!([tag, doc]))?;
    out.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_round_trip() {
        for format in Format::ALL {
            assert_eq!(Format::parse(format.as_str()), Some(format));
        }
        assert_eq!(Format::parse("nope"), None);
    }

    #[test]
    fn shared_tags_co_construct_once() {
        let formats: FormatSet =
            [Format::Features, Format::PolyFeatures, Format::Scripts, Format::Blobs]
                .into_iter()
                .collect();
        let aggs = make_aggregators(&formats, &AggregatorResources::default()).unwrap();
        assert_eq!(aggs.len(), 1);
        assert_eq!(aggs[0].name(), "feature_usage");
    }

    #[test]
    fn noop_constructs_nothing() {
        let formats: FormatSet = [Format::Noop].into_iter().collect();
        let aggs = make_aggregators(&formats, &AggregatorResources::default()).unwrap();
        assert!(aggs.is_empty());
    }

    #[test]
    fn fptp_requires_entity_database() {
        let formats: FormatSet = [Format::Fptp].into_iter().collect();
        assert!(make_aggregators(&formats, &AggregatorResources::default()).is_err());
    }
}
