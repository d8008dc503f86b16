//! Sentinel-terminated segmented files.
//!
//! Every output artifact of the pipeline is a line-oriented text file whose
//! final line is a fixed sentinel token, written exactly once by the writer
//! that closes the file. A file that ends with the sentinel is *complete*; a
//! file without it is in-progress (or was truncated by a crash) and must not
//! be consumed by downstream steps.
//!
//! Chunk-parallel steps write one *shard* per chunk under a deterministic
//! suffix (`<path>.<total:010>.<index:010>`). [`merge`] concatenates complete
//! shards into the canonical file, deduplicating column headers, and deletes
//! the shards afterwards. Merging is idempotent: a second call is a no-op.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{PipelineError, Result};

/// The completion sentinel, written as the final line of a complete file.
///
/// Payload lines are tab-separated records or `#`-prefixed comments that are
/// never exactly this token, so the sentinel cannot collide with data.
pub const SENTINEL: &str = "#//";

/// Width of the zero-padded numeric fields in shard file names.
const SHARD_FIELD_WIDTH: usize = 10;

/// Returns true iff `path` exists and its trailing bytes are the sentinel.
///
/// This is the O(1)-at-the-tail completeness check: only the last few bytes
/// of the file are read. I/O errors are treated as "not complete".
pub fn is_complete<P: AsRef<Path>>(path: P) -> bool {
    fn tail_matches(path: &Path) -> std::io::Result<bool> {
        let token = format!("{SENTINEL}\n");
        let token = token.as_bytes();
        let mut file = File::open(path)?;
        let size = file.seek(SeekFrom::End(0))?;
        if size < token.len() as u64 {
            return Ok(false);
        }
        file.seek(SeekFrom::End(-(token.len() as i64)))?;
        let mut buf = vec![0u8; token.len()];
        file.read_exact(&mut buf)?;
        Ok(buf == token)
    }
    let path = path.as_ref();
    path.exists() && tail_matches(path).unwrap_or(false)
}

/// Returns the shard path for `(index, total)` under the fixed convention.
///
/// Fields are fixed-width zero-padded decimal so that lexicographic and
/// numeric shard ordering coincide.
pub fn shard_path(path: &Path, total: usize, index: usize) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let shard = format!("{name}.{total:0w$}.{index:0w$}", w = SHARD_FIELD_WIDTH);
    path.with_file_name(shard)
}

/// Lists existing shard files for `path`, in shard order.
///
/// Only names matching the exact `<name>.<total:010>.<index:010>` convention
/// are returned; unrelated siblings sharing the prefix are ignored.
pub fn shard_parts(path: &Path) -> Result<Vec<PathBuf>> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let prefix = format!("{name}.");
    let mut parts = Vec::new();
    let entries = fs::read_dir(&dir).map_err(|e| PipelineError::io(&dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(&dir, e))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(suffix) = file_name.strip_prefix(&prefix) else { continue };
        if is_shard_suffix(suffix) {
            parts.push(entry.path());
        }
    }
    parts.sort();
    Ok(parts)
}

/// Checks that `suffix` is `<total:010>.<index:010>` with all-numeric fields.
fn is_shard_suffix(suffix: &str) -> bool {
    let mut fields = suffix.split('.');
    let (Some(total), Some(index), None) = (fields.next(), fields.next(), fields.next()) else {
        return false;
    };
    total.len() == SHARD_FIELD_WIDTH
        && index.len() == SHARD_FIELD_WIDTH
        && total.bytes().all(|b| b.is_ascii_digit())
        && index.bytes().all(|b| b.is_ascii_digit())
}

/// A buffered writer that appends the sentinel on [`close`](SegmentWriter::close).
///
/// Dropping the writer without calling `close` flushes buffered payload but
/// never writes the sentinel, so a crashed or killed writer always leaves an
/// incomplete file behind.
#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,
    inner: BufWriter<File>,
}

impl SegmentWriter {
    /// Creates a fresh output file.
    ///
    /// Fails with [`PipelineError::AlreadyExists`] if `path` exists and
    /// `force` is false.
    pub fn create<P: AsRef<Path>>(path: P, force: bool) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() && !force {
            return Err(PipelineError::AlreadyExists { path: path.to_path_buf() });
        }
        let file = File::create(path).map_err(|e| PipelineError::io(path, e))?;
        Ok(Self { path: path.to_path_buf(), inner: BufWriter::new(file) })
    }

    /// Reopens `path` at its end for appending.
    ///
    /// Fails with [`PipelineError::AlreadyComplete`] if the file already ends
    /// with the sentinel. A non-existent path behaves exactly like
    /// [`create`](Self::create): a fresh file with no continuation point.
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if is_complete(path) {
            return Err(PipelineError::AlreadyComplete { path: path.to_path_buf() });
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| PipelineError::io(path, e))?;
        Ok(Self { path: path.to_path_buf(), inner: BufWriter::new(file) })
    }

    /// Writes one payload line; the trailing newline is added here.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.inner
            .write_all(line.as_bytes())
            .and_then(|()| self.inner.write_all(b"\n"))
            .map_err(|e| PipelineError::io(&self.path, e))
    }

    /// The path this writer produces.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the sentinel, flushes, and consumes the writer.
    ///
    /// Only after `close` returns does [`is_complete`] hold for the path.
    pub fn close(mut self) -> Result<()> {
        self.inner
            .write_all(format!("{SENTINEL}\n").as_bytes())
            .and_then(|()| self.inner.flush())
            .map_err(|e| PipelineError::io(&self.path, e))
    }
}

/// A line iterator over a complete logical file or its complete shards.
///
/// Sentinel lines are filtered out. When reading across shards, one leading
/// header line (the first non-comment line) is stripped from every shard
/// after the first so the concatenation carries exactly one header.
#[derive(Debug)]
pub struct SegmentReader {
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<BufReader<File>>,
    skip_header: bool,
}

impl SegmentReader {
    /// Opens `path` for reading.
    ///
    /// If `path` is complete, iterates over it alone. If it is absent or
    /// incomplete but complete shards exist, iterates over the shards in
    /// shard order. Fails with [`PipelineError::IncompleteInput`] if neither
    /// holds, naming the offending file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if is_complete(path) {
            return Ok(Self {
                files: vec![path.to_path_buf()],
                next_file: 0,
                current: None,
                skip_header: false,
            });
        }
        let parts = shard_parts(path)?;
        if parts.is_empty() {
            return Err(PipelineError::IncompleteInput { path: path.to_path_buf() });
        }
        for part in &parts {
            if !is_complete(part) {
                return Err(PipelineError::IncompleteInput { path: part.clone() });
            }
        }
        Ok(Self { files: parts, next_file: 0, current: None, skip_header: false })
    }

    /// Advances to the next file, arming the header skip for all but the first.
    fn open_next(&mut self) -> Result<bool> {
        if self.next_file >= self.files.len() {
            return Ok(false);
        }
        let path = &self.files[self.next_file];
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        self.current = Some(BufReader::new(file));
        self.skip_header = self.next_file > 0;
        self.next_file += 1;
        Ok(true)
    }
}

impl Iterator for SegmentReader {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.open_next() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            let reader = self.current.as_mut().expect("reader opened above");
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    self.current = None;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    let path = self.files[self.next_file - 1].clone();
                    return Some(Err(PipelineError::io(path, e)));
                }
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            if line == SENTINEL {
                continue;
            }
            if self.skip_header && !line.starts_with('#') {
                // the duplicated column header of a later shard
                self.skip_header = false;
                continue;
            }
            return Some(Ok(line));
        }
    }
}

/// Merges the shards of `path` into the canonical complete file.
///
/// Returns `false` immediately if `path` is already complete. Otherwise the
/// shards are streamed through a fresh writer, the sentinel is appended, the
/// shard files are deleted, and `true` is returned. Calling `merge` twice is
/// safe: the second call no-ops on the completeness check.
pub fn merge<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    if is_complete(path) {
        return Ok(false);
    }
    let reader = SegmentReader::open(path)?;
    let parts = shard_parts(path)?;
    let mut writer = SegmentWriter::create(path, true)?;
    for line in reader {
        writer.write_line(&line?)?;
    }
    writer.close()?;
    for part in &parts {
        fs::remove_file(part).map_err(|e| PipelineError::io(part, e))?;
    }
    Ok(true)
}

/// Recovers the resume point from a partially written output file.
///
/// Scans the tail of `path` backwards for the last complete payload line and
/// returns its first tab-separated field. An unterminated trailing fragment
/// (a line cut off mid-write by a crash) is ignored. Returns `None` for
/// absent, empty, or comment-only files.
pub fn find_continuation_key<P: AsRef<Path>>(path: P) -> Result<Option<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let size = file.seek(SeekFrom::End(0)).map_err(|e| PipelineError::io(path, e))?;
    if size == 0 {
        return Ok(None);
    }
    let mut window: u64 = 1024;
    loop {
        let offset = window.min(size);
        file.seek(SeekFrom::Start(size - offset)).map_err(|e| PipelineError::io(path, e))?;
        let mut buf = vec![0u8; offset as usize];
        file.read_exact(&mut buf).map_err(|e| PipelineError::io(path, e))?;
        let text = String::from_utf8_lossy(&buf);
        // drop an unterminated trailing fragment
        let text = match text.rfind('\n') {
            Some(i) => &text[..i],
            None if offset == size => return Ok(None),
            None => {
                window = (window * 2).min(size);
                continue;
            }
        };
        let pieces: Vec<&str> = text.split('\n').collect();
        for (i, piece) in pieces.iter().enumerate().rev() {
            let line = piece.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if i == 0 && offset < size {
                // this piece may be cut off at the window head
                break;
            }
            let key = line.split('\t').next().unwrap_or(line);
            return Ok(Some(key.to_string()));
        }
        if offset == size {
            return Ok(None);
        }
        window = (window * 2).min(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_complete(path: &Path, lines: &[&str]) {
        let mut writer = SegmentWriter::create(path, false).unwrap();
        for line in lines {
            writer.write_line(line).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_sentinel_written_only_on_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        let mut writer = SegmentWriter::create(&path, false).unwrap();
        writer.write_line("a\t1").unwrap();
        drop(writer);
        assert!(path.exists());
        assert!(!is_complete(&path));

        let mut writer = SegmentWriter::append(&path).unwrap();
        writer.write_line("b\t2").unwrap();
        writer.close().unwrap();
        assert!(is_complete(&path));
    }

    #[test]
    fn test_create_refuses_existing_unless_forced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        write_complete(&path, &["a\t1"]);
        let err = SegmentWriter::create(&path, false).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyExists { .. }));
        assert!(SegmentWriter::create(&path, true).is_ok());
    }

    #[test]
    fn test_append_refuses_complete_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        write_complete(&path, &["a\t1"]);
        let err = SegmentWriter::append(&path).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyComplete { .. }));
    }

    #[test]
    fn test_append_on_missing_path_behaves_like_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        assert_eq!(find_continuation_key(&path).unwrap(), None);
        let mut writer = SegmentWriter::append(&path).unwrap();
        writer.write_line("a\t1").unwrap();
        writer.close().unwrap();
        assert!(is_complete(&path));
    }

    #[test]
    fn test_reader_filters_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        write_complete(&path, &["# comment", "key\tvalue", "a\t1", "b\t2"]);
        let lines: Vec<String> =
            SegmentReader::open(&path).unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["# comment", "key\tvalue", "a\t1", "b\t2"]);
    }

    #[test]
    fn test_reader_rejects_incomplete_file_without_shards() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        std::fs::write(&path, "a\t1\n").unwrap();
        let err = SegmentReader::open(&path).unwrap_err();
        assert!(matches!(err, PipelineError::IncompleteInput { .. }));
    }

    #[test]
    fn test_shard_path_is_zero_padded() {
        let path = shard_path(Path::new("/tmp/out.tsv"), 4, 2);
        assert_eq!(path, Path::new("/tmp/out.tsv.0000000004.0000000002"));
    }

    #[test]
    fn test_shard_parts_ignores_unrelated_siblings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        write_complete(&shard_path(&path, 2, 1), &["h", "b"]);
        write_complete(&shard_path(&path, 2, 0), &["h", "a"]);
        std::fs::write(dir.path().join("out.tsv.bak"), "x").unwrap();
        std::fs::write(dir.path().join("out.tsv.123.456"), "x").unwrap();
        let parts = shard_parts(&path).unwrap();
        assert_eq!(parts, vec![shard_path(&path, 2, 0), shard_path(&path, 2, 1)]);
    }

    #[test]
    fn test_reader_strips_headers_of_later_shards() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        write_complete(&shard_path(&path, 3, 0), &["# preamble", "key\tvalue", "a\t1"]);
        write_complete(&shard_path(&path, 3, 1), &["# preamble", "key\tvalue", "b\t2"]);
        write_complete(&shard_path(&path, 3, 2), &["# preamble", "key\tvalue", "c\t3"]);
        let lines: Vec<String> =
            SegmentReader::open(&path).unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(
            lines,
            vec![
                "# preamble",
                "key\tvalue",
                "a\t1",
                "# preamble",
                "b\t2",
                "# preamble",
                "c\t3"
            ]
        );
    }

    #[test]
    fn test_reader_rejects_incomplete_shard() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        write_complete(&shard_path(&path, 2, 0), &["key\tvalue", "a\t1"]);
        std::fs::write(shard_path(&path, 2, 1), "key\tvalue\nb\t2\n").unwrap();
        let err = SegmentReader::open(&path).unwrap_err();
        match err {
            PipelineError::IncompleteInput { path } => {
                assert!(path.to_string_lossy().ends_with("0000000001"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_merge_concatenates_and_deletes_shards() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        write_complete(&shard_path(&path, 2, 0), &["key\tvalue", "a\t1"]);
        write_complete(&shard_path(&path, 2, 1), &["key\tvalue", "b\t2"]);

        assert!(merge(&path).unwrap());
        assert!(is_complete(&path));
        assert!(shard_parts(&path).unwrap().is_empty());
        let lines: Vec<String> =
            SegmentReader::open(&path).unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["key\tvalue", "a\t1", "b\t2"]);

        // second call is a no-op on an unchanged file
        let before = std::fs::read_to_string(&path).unwrap();
        assert!(!merge(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_find_continuation_key_returns_last_payload_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        std::fs::write(&path, "# comment\nkey\tvalue\nq1\t1\nq2\t2\n").unwrap();
        assert_eq!(find_continuation_key(&path).unwrap(), Some("q2".to_string()));
    }

    #[test]
    fn test_find_continuation_key_ignores_trailing_fragment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        std::fs::write(&path, "q1\t1\nq2\t2\nq3\t").unwrap();
        assert_eq!(find_continuation_key(&path).unwrap(), Some("q2".to_string()));
    }

    #[test]
    fn test_find_continuation_key_empty_and_comment_only() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.tsv");
        std::fs::write(&empty, "").unwrap();
        assert_eq!(find_continuation_key(&empty).unwrap(), None);

        let comments = dir.path().join("comments.tsv");
        std::fs::write(&comments, "# a\n# b\n").unwrap();
        assert_eq!(find_continuation_key(&comments).unwrap(), None);
    }

    #[test]
    fn test_find_continuation_key_long_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tsv");
        let mut content = String::from("q1\t1\n");
        content.push_str("q2\t");
        content.push_str(&"x".repeat(8192));
        content.push('\n');
        std::fs::write(&path, content).unwrap();
        assert_eq!(find_continuation_key(&path).unwrap(), Some("q2".to_string()));
    }
}
