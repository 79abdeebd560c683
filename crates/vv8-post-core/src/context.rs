//! Trace context tracking: isolates, scripts, and the evolving execution
//! context fed to aggregators during ingest.
//!
//! `LogInfo` owns flat arenas of isolates and scripts; every
//! cross-reference is an index newtype, never an owning pointer.

use std::collections::HashMap;
use std::io::BufRead;

use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use vv8_post_trace::record::{unquoted, RecordOp};
use vv8_post_trace::scan::LineScanner;
use vv8_post_trace::split::{split_fields, SplitError};

use crate::aggregate::Aggregator;

/// Scripts injected through the automation harness end with this marker.
pub const PUPPETEER_EVAL_SUFFIX: &str = "//# sourceURL=__puppeteer_evaluation_script__\n)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateId(pub u32);

/// Identifies a script body by its `(length, SHA2-256, SHA3-256)` triple.
/// SHA2 alone collides in the wild; the triple is treated as identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ScriptHash {
    pub length: usize,
    pub sha2: [u8; 32],
    pub sha3: [u8; 32],
}

impl ScriptHash {
    pub fn new(code: &str) -> Self {
        let sha2 = Sha256::digest(code.as_bytes());
        let sha3 = Sha3_256::digest(code.as_bytes());
        Self {
            length: code.len(),
            sha2: sha2.into(),
            sha3: sha3.into(),
        }
    }

    pub fn sha2_hex(&self) -> String {
        hex::encode(self.sha2)
    }
}

/// A Same-Origin-Policy identity with its optional security token. The
/// empty origin is the "no enforceable origin yet" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin {
    pub origin: String,
    pub security_token: String,
}

impl Origin {
    pub fn is_empty(&self) -> bool {
        self.origin.is_empty()
    }
}

#[derive(Debug)]
pub struct ScriptInfo {
    /// Runtime ID, unique within the owning isolate.
    pub id: i64,
    pub isolate: IsolateId,
    pub code: String,
    pub code_hash: ScriptHash,
    /// Load URL. Mutually exclusive with `evaled_by`.
    pub url: Option<String>,
    /// The script whose eval produced this one.
    pub evaled_by: Option<ScriptId>,
    /// Active origin when the script was first declared.
    pub first_origin: Origin,
    /// Instrumentation/harness scripts, excluded from all aggregation.
    pub synthetic: bool,
}

#[derive(Debug)]
pub struct IsolateInfo {
    /// Opaque hex pointer tag from the engine.
    pub tag: String,
    scripts: HashMap<i64, ScriptId>,
    pub current_script: Option<ScriptId>,
    pub current_origin: Origin,
}

impl IsolateInfo {
    fn new(tag: String) -> Self {
        Self {
            tag,
            scripts: HashMap::new(),
            current_script: None,
            current_origin: Origin::default(),
        }
    }

    pub fn script_by_runtime_id(&self, id: i64) -> Option<ScriptId> {
        self.scripts.get(&id).copied()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestStats {
    pub lines: u64,
    pub bytes: u64,
}

/// Ephemeral per-record view handed to aggregators: the active script and
/// the active security origin. Valid only for one `ingest_record` call.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub script_id: ScriptId,
    pub script: &'a ScriptInfo,
    pub origin: &'a Origin,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("line {line}: invalid op byte 0x{op:02x}")]
    InvalidOp { line: u64, op: u8 },
    #[error("line {line}: '{op}' record is missing fields")]
    MissingFields { line: u64, op: char },
    #[error("line {line}: invalid script ID '{value}'")]
    BadScriptId { line: u64, value: String },
    #[error("line {line}: redefining script ID {id} in isolate {isolate}")]
    ScriptRedefined { line: u64, id: i64, isolate: String },
    #[error("line {line}: unknown parent script ID {id} in isolate {isolate}")]
    UnknownEvalParent { line: u64, id: i64, isolate: String },
    #[error("line {line}: changing to undefined script ID {id} in isolate {isolate}")]
    UnknownScript { line: u64, id: i64, isolate: String },
    #[error("line {line}: context op before any isolate")]
    NoActiveIsolate { line: u64 },
    #[error("line {line}: {source}")]
    Split {
        line: u64,
        source: SplitError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// All context for one trace under processing: arena-owned isolates and
/// scripts, the active isolate (the "world"), and ingest statistics.
#[derive(Debug)]
pub struct LogInfo {
    /// Unique ID assigned to this log.
    pub log_id: Uuid,
    /// External submission identifier, if the caller has one.
    pub submission_id: Option<Uuid>,
    /// Root filename of the (possibly fragmented) log stream.
    pub root_name: String,
    isolates: Vec<IsolateInfo>,
    by_tag: HashMap<String, IsolateId>,
    scripts: Vec<ScriptInfo>,
    world: Option<IsolateId>,
    pub stats: IngestStats,
}

impl LogInfo {
    pub fn new(root_name: impl Into<String>, submission_id: Option<Uuid>) -> Self {
        Self {
            log_id: Uuid::new_v4(),
            submission_id,
            root_name: root_name.into(),
            isolates: Vec::new(),
            by_tag: HashMap::new(),
            scripts: Vec::new(),
            world: None,
            stats: IngestStats::default(),
        }
    }

    pub fn script(&self, id: ScriptId) -> &ScriptInfo {
        &self.scripts[id.0 as usize]
    }

    pub fn isolate(&self, id: IsolateId) -> &IsolateInfo {
        &self.isolates[id.0 as usize]
    }

    pub fn isolate_tag(&self, id: IsolateId) -> &str {
        &self.isolates[id.0 as usize].tag
    }

    pub fn world(&self) -> Option<IsolateId> {
        self.world
    }

    pub fn scripts(&self) -> impl Iterator<Item = (ScriptId, &ScriptInfo)> {
        self.scripts
            .iter()
            .enumerate()
            .map(|(i, s)| (ScriptId(i as u32), s))
    }

    pub(crate) fn change_isolate(&mut self, tag: &str) -> IsolateId {
        let id = match self.by_tag.get(tag) {
            Some(&id) => id,
            None => {
                let id = IsolateId(self.isolates.len() as u32);
                self.isolates.push(IsolateInfo::new(tag.to_string()));
                self.by_tag.insert(tag.to_string(), id);
                id
            }
        };
        self.isolates[id.0 as usize].current_script = None;
        self.world = Some(id);
        id
    }

    pub(crate) fn world_mut(&mut self, line: u64) -> Result<&mut IsolateInfo, TraceError> {
        let id = self.world.ok_or(TraceError::NoActiveIsolate { line })?;
        Ok(&mut self.isolates[id.0 as usize])
    }

    pub(crate) fn add_script(
        &mut self,
        line: u64,
        id: i64,
        src: &str,
        code: String,
    ) -> Result<ScriptId, TraceError> {
        let world_id = self.world.ok_or(TraceError::NoActiveIsolate { line })?;
        let world = &self.isolates[world_id.0 as usize];
        if world.scripts.contains_key(&id) {
            return Err(TraceError::ScriptRedefined {
                line,
                id,
                isolate: world.tag.clone(),
            });
        }

        let code_hash = ScriptHash::new(&code);
        let first_origin = world.current_origin.clone();
        let mut script = ScriptInfo {
            id,
            isolate: world_id,
            code,
            code_hash,
            url: None,
            evaled_by: None,
            first_origin,
            synthetic: false,
        };

        // Integer source field: the eval parent's runtime ID. Anything
        // else is a quoted load URL.
        match src.parse::<i64>() {
            Ok(parent_id) => {
                let parent = world.script_by_runtime_id(parent_id).ok_or_else(|| {
                    TraceError::UnknownEvalParent {
                        line,
                        id: parent_id,
                        isolate: world.tag.clone(),
                    }
                })?;
                script.evaled_by = Some(parent);
                script.synthetic = self.scripts[parent.0 as usize].synthetic;
            }
            Err(_) => {
                let url = unquoted(src);
                script.synthetic =
                    url.is_empty() || script.code.ends_with(PUPPETEER_EVAL_SUFFIX);
                script.url = Some(url.to_string());
            }
        }

        let script_id = ScriptId(self.scripts.len() as u32);
        self.scripts.push(script);
        self.isolates[world_id.0 as usize].scripts.insert(id, script_id);
        Ok(script_id)
    }

    pub(crate) fn change_script(&mut self, line: u64, id: i64) -> Result<(), TraceError> {
        let world = self.world_mut(line)?;
        match world.script_by_runtime_id(id) {
            Some(script) => {
                world.current_script = Some(script);
                Ok(())
            }
            None => Err(TraceError::UnknownScript {
                line,
                id,
                isolate: world.tag.clone(),
            }),
        }
    }

    pub(crate) fn change_origin(&mut self, line: u64, origin: &str, token: &str) -> Result<(), TraceError> {
        let world = self.world_mut(line)?;
        world.current_origin = Origin {
            origin: origin.to_string(),
            security_token: token.to_string(),
        };
        Ok(())
    }

    /// Parse a trace stream and fan every data record out to the given
    /// aggregators, in file order.
    ///
    /// Context ops mutate the tracker; all other records are delivered
    /// gated: aggregators only ever observe records with an active,
    /// non-synthetic script and a non-empty origin.
    pub fn ingest_stream<R: BufRead>(
        &mut self,
        reader: R,
        aggs: &mut [&mut dyn Aggregator],
    ) -> anyhow::Result<()> {
        let mut scan = LineScanner::new(reader);
        while let Some((line_no, line)) = scan.next_line().map_err(TraceError::Io)? {
            if line.is_empty() {
                continue;
            }
            let op = line[0];
            let fields = split_fields(&line[1..])
                .map_err(|source| TraceError::Split { line: line_no, source })?;
            match op {
                b'~' => {
                    let tag = fields.first().ok_or(TraceError::MissingFields {
                        line: line_no,
                        op: '~',
                    })?;
                    self.change_isolate(tag);
                }
                b'$' => {
                    if fields.len() < 3 {
                        return Err(TraceError::MissingFields { line: line_no, op: '$' }.into());
                    }
                    let id = fields[0].parse::<i64>().map_err(|_| TraceError::BadScriptId {
                        line: line_no,
                        value: fields[0].clone(),
                    })?;
                    let code = fields[2].clone();
                    self.add_script(line_no, id, &fields[1], code)?;
                }
                b'!' => {
                    let raw = fields.first().ok_or(TraceError::MissingFields {
                        line: line_no,
                        op: '!',
                    })?;
                    // A non-numeric ID is the engine signalling "back to
                    // top level / unknown": clear the active script.
                    match raw.parse::<i64>() {
                        Ok(id) => self.change_script(line_no, id)?,
                        Err(_) => self.world_mut(line_no)?.current_script = None,
                    }
                }
                b'@' => {
                    let raw = fields.first().ok_or(TraceError::MissingFields {
                        line: line_no,
                        op: '@',
                    })?;
                    let origin = unquoted(raw).to_string();
                    let token = fields.get(1).map(|t| unquoted(t).to_string()).unwrap_or_default();
                    self.change_origin(line_no, &origin, &token)?;
                }
                other => {
                    let op = RecordOp::from_byte(other)
                        .ok_or(TraceError::InvalidOp { line: line_no, op: other })?;
                    if let Some(ctx) = self.current_context() {
                        for agg in aggs.iter_mut() {
                            agg.ingest_record(&ctx, line_no, op, &fields)?;
                        }
                    }
                }
            }
        }
        self.stats.lines = scan.lines();
        self.stats.bytes = scan.bytes();
        info!(lines = self.stats.lines, bytes = self.stats.bytes, "trace processed");
        Ok(())
    }

    /// The gating predicate: a context exists only when the world has an
    /// active, non-synthetic script and a non-empty origin.
    fn current_context(&self) -> Option<ExecutionContext<'_>> {
        let world = &self.isolates[self.world?.0 as usize];
        let script_id = world.current_script?;
        let script = &self.scripts[script_id.0 as usize];
        if script.synthetic || world.current_origin.is_empty() {
            return None;
        }
        Some(ExecutionContext {
            script_id,
            script,
            origin: &world.current_origin,
        })
    }
}
