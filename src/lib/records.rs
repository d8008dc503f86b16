//! Record readers for pairwise-alignment link files.
//!
//! The pipeline's primary input is a tab-separated file of pairwise
//! alignments ("links"), sorted and grouped by query token. The first nine
//! columns are fixed; trailing columns are carried by upstream tools and
//! ignored here. Lines starting with `#` and blank lines are not records.

use std::path::Path;

use ahash::AHashMap;

use crate::errors::{PipelineError, Result};
use crate::segment::SegmentReader;

/// One pairwise alignment between a query and a subject sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRecord {
    pub query: String,
    pub sbjct: String,
    pub evalue: f64,
    pub query_start: u32,
    pub query_end: u32,
    pub query_ali: String,
    pub sbjct_start: u32,
    pub sbjct_end: u32,
    pub sbjct_ali: String,
}

impl LinkRecord {
    /// Parses the nine leading tab-separated columns of a link line.
    pub fn parse(path: &Path, line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        let mut next = |name: &str| {
            fields.next().ok_or_else(|| PipelineError::Parse {
                path: path.to_path_buf(),
                line: line.to_string(),
                reason: format!("missing column '{name}'"),
            })
        };
        let query = next("query")?.to_string();
        let sbjct = next("sbjct")?.to_string();
        let evalue = next("evalue")?;
        let query_start = next("query_start")?;
        let query_end = next("query_end")?;
        let query_ali = next("query_ali")?.to_string();
        let sbjct_start = next("sbjct_start")?;
        let sbjct_end = next("sbjct_end")?;
        let sbjct_ali = next("sbjct_ali")?.to_string();

        let numeric = |value: &str, name: &str| -> Result<u32> {
            value.parse().map_err(|_| PipelineError::Parse {
                path: path.to_path_buf(),
                line: line.to_string(),
                reason: format!("column '{name}' is not an integer"),
            })
        };
        let evalue: f64 = evalue.parse().map_err(|_| PipelineError::Parse {
            path: path.to_path_buf(),
            line: line.to_string(),
            reason: "column 'evalue' is not a number".to_string(),
        })?;

        Ok(Self {
            query,
            sbjct,
            evalue,
            query_start: numeric(query_start, "query_start")?,
            query_end: numeric(query_end, "query_end")?,
            query_ali,
            sbjct_start: numeric(sbjct_start, "sbjct_start")?,
            sbjct_end: numeric(sbjct_end, "sbjct_end")?,
            sbjct_ali,
        })
    }
}

/// All links for one query token, in file order unless re-sorted by a step.
#[derive(Debug, Clone)]
pub struct LinkGroup {
    pub key: String,
    pub links: Vec<LinkRecord>,
}

/// Returns the grouping key of a payload line, or `None` for comments and
/// blank lines.
#[must_use]
pub fn key_of(line: &str) -> Option<&str> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(line.split('\t').next().unwrap_or(line))
}

/// Read-only token→nid lookup table, loaded once from the sequence index
/// and shared across workers as an immutable snapshot.
#[derive(Debug, Default)]
pub struct IdMap {
    entries: AHashMap<String, SequenceEntry>,
}

/// Internal id and length of one indexed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceEntry {
    pub nid: u64,
    pub length: u32,
}

impl IdMap {
    /// Loads the nid table written by the `sequences` step.
    ///
    /// The table must be complete (or have complete shards); an in-progress
    /// table fails with [`PipelineError::IncompleteInput`], which is the
    /// prerequisite check for every step that consumes the map.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut entries = AHashMap::new();
        let mut saw_header = false;
        for line in SegmentReader::open(path)? {
            let line = line?;
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            if !saw_header {
                // the single column-header line
                saw_header = true;
                continue;
            }
            let mut fields = line.split('\t');
            let (Some(nid), Some(token), Some(length)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(PipelineError::Parse {
                    path: path.to_path_buf(),
                    line,
                    reason: "expected columns nid, token, length".to_string(),
                });
            };
            let entry = SequenceEntry {
                nid: nid.parse().map_err(|_| PipelineError::Parse {
                    path: path.to_path_buf(),
                    line: line.clone(),
                    reason: "column 'nid' is not an integer".to_string(),
                })?,
                length: length.parse().map_err(|_| PipelineError::Parse {
                    path: path.to_path_buf(),
                    line: line.clone(),
                    reason: "column 'length' is not an integer".to_string(),
                })?,
            };
            entries.insert(token.to_string(), entry);
        }
        Ok(Self { entries })
    }

    /// Looks up a sequence token.
    #[must_use]
    pub fn get(&self, token: &str) -> Option<SequenceEntry> {
        self.entries.get(token).copied()
    }

    /// Number of indexed sequences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map holds no sequences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
