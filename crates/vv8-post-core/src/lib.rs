pub mod aggregate;
pub mod annotate;
pub mod callargs;
pub mod causality;
pub mod context;
pub mod elements;
pub mod entity;
pub mod features;
pub mod flow;
pub mod fptp;
pub mod graphml;
pub mod idl;

pub use crate::aggregate::{
    dump_aggregator, make_aggregators, AggregationContext, Aggregator, DatabaseSink, Format,
    FormatSet, OutputSink, SinkSupport,
};
pub use crate::context::{ExecutionContext, IsolateId, LogInfo, Origin, ScriptHash, ScriptId};
