use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use vv8_post_core::aggregate::{
    dump_aggregator, make_aggregators, AggregationContext, Aggregator, AggregatorResources,
    Format, FormatSet, OutputSink,
};
use vv8_post_core::annotate::annotate_stream;
use vv8_post_core::context::LogInfo;
use vv8_post_core::entity::EntityMap;
use vv8_post_core::idl::IdlTree;
use vv8_post_trace::scan::SegmentReader;

mod cluster;

use cluster::{cluster_inputs, InputClusters, LogSegment};

#[derive(Parser)]
#[command(name = "vv8-post", about = "Post-process VV8 execution traces")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Parse traces and run aggregation passes")]
    Process {
        /// Input traces: file names ('stem.N.log' segments are grouped
        /// and ordered automatically) or '-' for stdin.
        #[arg(value_name = "INPUT", required = true)]
        inputs: Vec<String>,
        /// '+'-delimited aggregation passes to perform.
        #[arg(long, default_value = "noop")]
        aggs: String,
        /// Root domain of the visited page, for causality anchoring and
        /// party classification.
        #[arg(long)]
        root_domain: Option<String>,
        /// Override the root name recorded for the log stream.
        #[arg(long)]
        log_root: Option<String>,
        /// External submission identifier to attach to the log.
        #[arg(long)]
        submission_id: Option<Uuid>,
        /// IDL interface database.
        #[arg(long, default_value = "idldata.json")]
        idl_data: PathBuf,
        /// Entity ownership database (for the fptp pass).
        #[arg(long, default_value = "entities.json")]
        entities: PathBuf,
    },
    #[command(about = "Echo raw lines as JSON annotated with script/offset context")]
    Annotate {
        #[arg(value_name = "INPUT", required = true)]
        inputs: Vec<String>,
    },
    #[command(about = "Copy the (reassembled) raw log stream to stdout")]
    Dump {
        #[arg(value_name = "INPUT", required = true)]
        inputs: Vec<String>,
    },
}

fn parse_formats(aggs: &str) -> Result<FormatSet> {
    let mut formats = FormatSet::new();
    for name in aggs.split('+') {
        let format = Format::parse(name)
            .ok_or_else(|| anyhow!("unknown aggregation pass '{name}'"))?;
        info!(pass = name, "output enabled");
        formats.insert(format);
    }
    Ok(formats)
}

fn open_cluster(segments: &[LogSegment]) -> Result<Box<dyn Read>> {
    if segments.len() == 1 && segments[0].name == "-" {
        info!("reading from stdin");
        return Ok(Box::new(io::stdin()));
    }
    let mut readers: Vec<Box<dyn Read>> = Vec::with_capacity(segments.len());
    for segment in segments {
        info!(file = %segment.name, "opening");
        readers.push(Box::new(File::open(&segment.name)?));
    }
    Ok(Box::new(SegmentReader::new(readers)))
}

fn load_resources(
    formats: &FormatSet,
    idl_data: &Path,
    entities: &Path,
) -> Result<AggregatorResources> {
    let needs_idl = formats.iter().any(|f| {
        matches!(
            f,
            Format::Features
                | Format::PolyFeatures
                | Format::Scripts
                | Format::Blobs
                | Format::CreateElement
                | Format::CallArgs
        )
    });
    let idl = if needs_idl {
        Arc::new(IdlTree::load(idl_data)?)
    } else {
        Arc::new(IdlTree::default())
    };
    let entity_map = if formats.contains(&Format::Fptp) {
        Some(Arc::new(EntityMap::load(entities)?))
    } else {
        None
    };
    Ok(AggregatorResources { idl, entities: entity_map })
}

fn process(
    clusters: InputClusters,
    formats: FormatSet,
    resources: AggregatorResources,
    root_domain: Option<String>,
    log_root: Option<String>,
    submission_id: Option<Uuid>,
) -> Result<()> {
    for (cluster_name, segments) in &clusters {
        let reader = BufReader::new(open_cluster(segments)?);
        let root_name = log_root.clone().unwrap_or_else(|| cluster_name.clone());

        let mut aggs = make_aggregators(&formats, &resources)?;
        let mut log = LogInfo::new(root_name, submission_id);
        {
            let mut views: Vec<&mut dyn Aggregator> = Vec::with_capacity(aggs.len());
            for a in aggs.iter_mut() {
                views.push(a.as_mut());
            }
            log.ingest_stream(reader, &mut views)?;
        }

        let ctx = AggregationContext {
            formats: formats.clone(),
            root_domain: root_domain.clone(),
        };
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut sink = OutputSink::Stream(&mut out);
        for agg in &mut aggs {
            dump_aggregator(agg.as_mut(), &ctx, &log, &mut sink)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Process {
            inputs,
            aggs,
            root_domain,
            log_root,
            submission_id,
            idl_data,
            entities,
        } => {
            let formats = parse_formats(&aggs)?;
            let resources = load_resources(&formats, &idl_data, &entities)?;
            let clusters = cluster_inputs(&inputs)?;
            process(clusters, formats, resources, root_domain, log_root, submission_id)
        }
        Command::Annotate { inputs } => {
            let clusters = cluster_inputs(&inputs)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for segments in clusters.values() {
                let reader = BufReader::new(open_cluster(segments)?);
                annotate_stream(reader, &mut out)?;
            }
            Ok(())
        }
        Command::Dump { inputs } => {
            let clusters = cluster_inputs(&inputs)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for segments in clusters.values() {
                let mut reader = open_cluster(segments)?;
                let count = io::copy(&mut reader, &mut out)?;
                info!(bytes = count, "emitted");
            }
            out.flush()?;
            Ok(())
        }
    }
}
