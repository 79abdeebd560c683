//! Grouping of raw input names into ordered multi-segment log clusters.
//!
//! The engine fragments long traces as `stem.0.log`, `stem.1.log`, ...;
//! all segments of one trace must be read as a single stream, in rank
//! order.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegment {
    pub rank: u64,
    pub name: String,
}

/// Cluster key (the rank-0 segment name) → ordered segment list.
pub type InputClusters = BTreeMap<String, Vec<LogSegment>>;

pub fn cluster_inputs(args: &[String]) -> Result<InputClusters> {
    // Three fields: name stem, segment rank, ".log".
    let pattern = Regex::new(r"(vv8-[^.]+\.)(\d+)(\.log)$").expect("segment pattern");
    let mut clusters = InputClusters::new();
    for arg in args {
        match pattern.captures(arg) {
            Some(caps) => {
                let key = format!("{}0{}", &caps[1], &caps[3]);
                let rank: u64 = caps[2]
                    .parse()
                    .with_context(|| format!("segment rank in '{arg}'"))?;
                clusters
                    .entry(key)
                    .or_default()
                    .push(LogSegment { rank, name: arg.clone() });
            }
            None => {
                // Stdin ("-") or a plain, unfragmented file.
                clusters
                    .entry(arg.clone())
                    .or_default()
                    .push(LogSegment { rank: 0, name: arg.clone() });
            }
        }
    }
    for segments in clusters.values_mut() {
        segments.sort_by_key(|s| s.rank);
    }
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn groups_segments_under_rank_zero_key() {
        let clusters = cluster_inputs(&names(&[
            "vv8-site.2.log",
            "vv8-site.0.log",
            "vv8-site.1.log",
            "vv8-other.0.log",
        ]))
        .unwrap();
        assert_eq!(clusters.len(), 2);
        let site = &clusters["vv8-site.0.log"];
        assert_eq!(
            site.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            ["vv8-site.0.log", "vv8-site.1.log", "vv8-site.2.log"]
        );
    }

    #[test]
    fn plain_names_and_stdin_stand_alone() {
        let clusters = cluster_inputs(&names(&["-", "trace.txt"])).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters["-"].len(), 1);
        assert_eq!(clusters["trace.txt"][0].rank, 0);
    }
}
