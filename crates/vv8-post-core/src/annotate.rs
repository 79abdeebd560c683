//! Annotation mode: a simplified pass that echoes raw trace lines as
//! JSON, decorated with the execution context in force at each line.
//! Useful for eyeballing context tracking against a real log.

use std::io::{BufRead, Write};

use anyhow::Result;
use serde_json::json;

use vv8_post_trace::record::unquoted;
use vv8_post_trace::scan::LineScanner;
use vv8_post_trace::split::split_fields;

use crate::context::{LogInfo, TraceError};

/// Stream each raw line back out as `{"t": line, ...}` with the declared
/// script ("d"/"s"), record offset ("o"), and active script ("x") where
/// known.
pub fn annotate_stream<R: BufRead, W: Write>(reader: R, out: &mut W) -> Result<()> {
    let mut log = LogInfo::new("annotate", None);
    let mut scan = LineScanner::new(reader);

    while let Some((line_no, line)) = scan.next_line()? {
        let raw = String::from_utf8_lossy(line).into_owned();
        let mut doc = json!({ "t": raw });

        if !line.is_empty() {
            let fields = split_fields(&line[1..])
                .map_err(|source| TraceError::Split { line: line_no, source })?;
            match line[0] {
                b'~' => {
                    if let Some(tag) = fields.first() {
                        log.change_isolate(tag);
                    }
                }
                b'$' => {
                    if fields.len() >= 3 {
                        let id = fields[0].parse::<i64>().map_err(|_| {
                            TraceError::BadScriptId { line: line_no, value: fields[0].clone() }
                        })?;
                        let script = log.add_script(line_no, id, &fields[1], fields[2].clone())?;
                        doc["d"] = json!(id);
                        doc["s"] = json!(log.script(script).code_hash.sha2_hex());
                    }
                }
                b'!' => match fields.first().map(|f| f.parse::<i64>()) {
                    Some(Ok(id)) => log.change_script(line_no, id)?,
                    _ => log.world_mut(line_no)?.current_script = None,
                },
                b'@' => {
                    let origin = fields.first().map(|f| unquoted(f)).unwrap_or_default();
                    let token = fields.get(1).map(|f| unquoted(f)).unwrap_or_default();
                    log.change_origin(line_no, origin, token)?;
                }
                _ => {
                    if let Some(offset) = fields.first().and_then(|f| f.parse::<i64>().ok()) {
                        if offset >= 0 {
                            doc["o"] = json!(offset);
                        }
                    }
                }
            }
            if let Some(world) = log.world() {
                if let Some(sid) = log.isolate(world).current_script {
                    doc["x"] = json!(log.script(sid).id);
                }
            }
        }
        serde_json::to_writer(&mut *out, &doc)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotates_context_per_line() {
        let trace = concat!(
            "~I\n",
            "@\"http://a\"\n",
            "$0:\"http://a/s.js\":code\n",
            "!0\n",
            "g5:{Window}:\"foo\"\n",
        );
        let mut out = Vec::new();
        annotate_stream(trace.as_bytes(), &mut out).unwrap();
        let docs: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(docs.len(), 5);
        assert_eq!(docs[2]["d"], 0);
        assert!(docs[2]["s"].is_string());
        assert_eq!(docs[3]["x"], 0);
        assert_eq!(docs[4]["o"], 5);
        assert_eq!(docs[4]["x"], 0);
    }

    #[test]
    fn annotate_surfaces_structural_errors() {
        assert!(annotate_stream("~I\n$0:\"u\":a\n$0:\"u\":b\n".as_bytes(), &mut Vec::new()).is_err());
    }
}
