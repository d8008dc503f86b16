//! Byte-range chunking of large record files.
//!
//! [`plan`] partitions a file into `total_chunks` ranges of roughly equal
//! logical size. Ranges are planned arithmetically and *realized* lazily by
//! the iterators: a chunk that does not start at offset 0 first realigns to
//! the next record (or group) boundary, and iteration runs past the planned
//! end until the record or group in progress is finished. Together this
//! guarantees that the union of all realized chunks covers every record
//! exactly once, with no record or group split between two workers.
//!
//! Gzip-compressed inputs are chunked in uncompressed coordinates using the
//! container's trailing size field as a hint. The implied compression ratio
//! is sanity-bounded; an implausible hint degrades planning to a single
//! whole-file chunk rather than risking a misaligned plan.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::bufread::MultiGzDecoder;
use log::warn;

use crate::errors::{PipelineError, Result};
use crate::records::{key_of, LinkGroup, LinkRecord};

/// Longest record line tolerated during boundary realignment.
const MAX_LINE_BYTES: u64 = 1 << 20;

/// Accepted range for the compressed/uncompressed size ratio hint.
const RATIO_BOUNDS: (f64, f64) = (0.1, 0.8);

/// A disjoint byte range of the input assigned to one worker.
///
/// Offsets are logical (uncompressed) coordinates; `end` is an exclusive
/// planning bound, with `u64::MAX` standing for "true end of file".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    /// The degenerate whole-file chunk.
    #[must_use]
    pub fn whole_file() -> Self {
        Self { index: 0, total: 1, start: 0, end: u64::MAX }
    }
}

/// Computes the chunk plan for `path`.
///
/// Chunk `i` spans `[ceil(size/total)*i, min(ceil(size/total)*(i+1), size))`;
/// chunk 0 starts at the true beginning and the last chunk ends at true EOF.
/// `total_chunks == 1` degenerates to the whole file with no seeking. A
/// request for more chunks than the file has records is legal; the surplus
/// chunks realize as empty.
pub fn plan<P: AsRef<Path>>(path: P, total_chunks: usize) -> Result<Vec<Chunk>> {
    let path = path.as_ref();
    let total = total_chunks.max(1);
    let Some(size) = logical_size(path)? else {
        return Ok(vec![Chunk::whole_file()]);
    };
    if total == 1 {
        return Ok(vec![Chunk { index: 0, total: 1, start: 0, end: size }]);
    }
    let chunk_size = size.div_ceil(total as u64).max(1);
    Ok((0..total)
        .map(|index| Chunk {
            index,
            total,
            start: chunk_size * index as u64,
            end: (chunk_size * (index as u64 + 1)).min(size),
        })
        .collect())
}

/// Logical (uncompressed) size of `path`, or `None` when it cannot be
/// trusted and chunking must fall back to a single chunk.
fn logical_size(path: &Path) -> Result<Option<u64>> {
    let meta = fs::metadata(path).map_err(|e| PipelineError::io(path, e))?;
    if !is_gzip(path) {
        return Ok(Some(meta.len()));
    }
    // gzip trailer: the last four bytes are the uncompressed size mod 2^32
    let compressed = meta.len();
    if compressed < 18 {
        warn!("{}: too small for a gzip member, chunking disabled", path.display());
        return Ok(None);
    }
    let mut file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    file.seek(SeekFrom::End(-4)).map_err(|e| PipelineError::io(path, e))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf).map_err(|e| PipelineError::io(path, e))?;
    let uncompressed = u64::from(u32::from_le_bytes(buf));
    if uncompressed == 0 {
        warn!("{}: gzip size field is zero, chunking disabled", path.display());
        return Ok(None);
    }
    let ratio = compressed as f64 / uncompressed as f64;
    if !(RATIO_BOUNDS.0..=RATIO_BOUNDS.1).contains(&ratio) {
        warn!(
            "{}: implausible compression ratio {ratio:.2}, chunking disabled",
            path.display()
        );
        return Ok(None);
    }
    Ok(Some(uncompressed))
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Opens `path` for sequential text reading, transparently decompressing
/// gzip inputs.
pub fn open_text<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    if is_gzip(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file)))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// A positioned line source over a plain or gzip-compressed file.
///
/// Positions are logical (uncompressed) byte offsets. Plain files seek;
/// compressed files advance by decompressing and discarding, which costs
/// time proportional to the offset but is always exact.
struct SliceReader {
    source: Source,
    path: PathBuf,
    pos: u64,
}

enum Source {
    Plain(BufReader<File>),
    Gzip(Box<BufReader<MultiGzDecoder<BufReader<File>>>>),
}

impl SliceReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        let source = if is_gzip(path) {
            Source::Gzip(Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file)))))
        } else {
            Source::Plain(BufReader::new(file))
        };
        Ok(Self { source, path: path.to_path_buf(), pos: 0 })
    }

    /// Moves the logical position to `offset` (or EOF, whichever is first).
    fn advance_to(&mut self, offset: u64) -> Result<()> {
        match &mut self.source {
            Source::Plain(reader) => {
                reader
                    .seek(SeekFrom::Start(offset))
                    .map_err(|e| PipelineError::io(&self.path, e))?;
                self.pos = offset;
            }
            Source::Gzip(reader) => {
                debug_assert_eq!(self.pos, 0, "gzip sources advance once, from the start");
                let skipped = std::io::copy(
                    &mut reader.by_ref().take(offset),
                    &mut std::io::sink(),
                )
                .map_err(|e| PipelineError::io(&self.path, e))?;
                self.pos = skipped;
            }
        }
        Ok(())
    }

    /// Reads one line including its newline; returns the byte count.
    fn read_line(&mut self, buf: &mut String) -> Result<usize> {
        buf.clear();
        let n = match &mut self.source {
            Source::Plain(reader) => reader.read_line(buf),
            Source::Gzip(reader) => reader.read_line(buf),
        }
        .map_err(|e| PipelineError::io(&self.path, e))?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Discards the remainder of the line containing the current position.
    fn skip_partial_line(&mut self) -> Result<()> {
        let offset = self.pos;
        let mut buf = String::new();
        let n = self.read_line(&mut buf)?;
        if n as u64 > MAX_LINE_BYTES {
            return Err(PipelineError::BoundaryAlignment { path: self.path.clone(), offset });
        }
        Ok(())
    }
}

fn trim_newline(line: &mut String) {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
}

/// Lazy line iterator over one chunk of a file.
///
/// A chunk that does not start at offset 0 discards everything up to the
/// next line start; iteration yields every line that *starts* at or before
/// the chunk end, so the line straddling a boundary belongs to the earlier
/// chunk.
pub struct LineSlice {
    reader: SliceReader,
    end: u64,
    done: bool,
}

impl LineSlice {
    pub fn new<P: AsRef<Path>>(path: P, chunk: &Chunk) -> Result<Self> {
        let mut reader = SliceReader::open(path.as_ref())?;
        if chunk.start > 0 {
            reader.advance_to(chunk.start)?;
            reader.skip_partial_line()?;
        }
        Ok(Self { reader, end: chunk.end, done: false })
    }
}

impl Iterator for LineSlice {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.reader.pos > self.end {
            return None;
        }
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                trim_newline(&mut line);
                Some(Ok(line))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazy group iterator over one chunk of a key-grouped link file.
///
/// Grouping never splits a group across chunks: realignment advances to the
/// start of the first group *after* the chunk start (backing the scan up far
/// enough to learn the key in progress at the boundary), and a group that
/// begins at or before the chunk end is consumed to completion even when it
/// extends past it.
pub struct GroupSlice {
    reader: SliceReader,
    end: u64,
    pending: Option<(String, Vec<LinkRecord>)>,
    /// A line read past the realignment point, with its start offset.
    carry: Option<(u64, String)>,
    done: bool,
}

impl GroupSlice {
    pub fn new<P: AsRef<Path>>(path: P, chunk: &Chunk) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = SliceReader::open(path)?;
        let mut carry = None;
        if chunk.start > 0 {
            carry = Self::realign(&mut reader, chunk.start)?;
        }
        Ok(Self { reader, end: chunk.end, pending: None, carry, done: false })
    }

    /// Positions `reader` at the first line after `start` and skips the
    /// remainder of the group in progress at the boundary. Returns the first
    /// line belonging to this chunk, if one was read while skipping.
    fn realign(reader: &mut SliceReader, start: u64) -> Result<Option<(u64, String)>> {
        // Back up far enough to read the whole line containing `start`: its
        // key identifies the group that the previous chunk finishes.
        let scan_from = start.saturating_sub(MAX_LINE_BYTES);
        reader.advance_to(scan_from)?;
        if scan_from > 0 {
            reader.skip_partial_line()?;
            if reader.pos > start {
                return Err(PipelineError::BoundaryAlignment {
                    path: reader.path.clone(),
                    offset: start,
                });
            }
        }
        let mut line = String::new();
        let boundary_key = loop {
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None); // chunk starts at or beyond EOF
            }
            if n as u64 > MAX_LINE_BYTES {
                return Err(PipelineError::BoundaryAlignment {
                    path: reader.path.clone(),
                    offset: start,
                });
            }
            if reader.pos > start {
                trim_newline(&mut line);
                break key_of(&line).map(str::to_string);
            }
        };
        // The boundary line (and its group) belongs to the previous chunk.
        let Some(boundary_key) = boundary_key else {
            return Ok(None);
        };
        loop {
            let line_start = reader.pos;
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            trim_newline(&mut line);
            if key_of(&line) != Some(boundary_key.as_str()) {
                return Ok(Some((line_start, std::mem::take(&mut line))));
            }
        }
    }
}

impl Iterator for GroupSlice {
    type Item = Result<LinkGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (line_start, line) = match self.carry.take() {
                Some(carried) => carried,
                None => {
                    let line_start = self.reader.pos;
                    let mut line = String::new();
                    match self.reader.read_line(&mut line) {
                        Ok(0) => {
                            self.done = true;
                            return self
                                .pending
                                .take()
                                .map(|(key, links)| Ok(LinkGroup { key, links }));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                    trim_newline(&mut line);
                    (line_start, line)
                }
            };
            let Some(key) = key_of(&line) else {
                continue; // comment or blank line
            };
            let key = key.to_string();
            let record = match LinkRecord::parse(&self.reader.path, &line) {
                Ok(record) => record,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match &mut self.pending {
                Some((pending_key, links)) if *pending_key == key => links.push(record),
                Some(_) => {
                    let (finished_key, finished) =
                        self.pending.take().expect("pending checked above");
                    if line_start <= self.end {
                        self.pending = Some((key, vec![record]));
                    } else {
                        self.done = true;
                    }
                    return Some(Ok(LinkGroup { key: finished_key, links: finished }));
                }
                None => {
                    if line_start > self.end {
                        self.done = true;
                        return None;
                    }
                    self.pending = Some((key, vec![record]));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// A file of `records` records, each spanning `lines_per_record` lines
    /// with a shared leading key column, plus a running line counter.
    fn write_grouped_file(path: &Path, records: usize, lines_per_record: usize) {
        let mut out = File::create(path).unwrap();
        let mut counter = 0;
        for record in 0..records {
            for line in 0..lines_per_record {
                writeln!(out, "{record}\t{line}\t{counter}\t{line}").unwrap();
                counter += 1;
            }
        }
    }

    fn collect_all_lines(path: &Path, total_chunks: usize) -> Vec<String> {
        let mut all = Vec::new();
        for chunk in plan(path, total_chunks).unwrap() {
            for line in LineSlice::new(path, &chunk).unwrap() {
                all.push(line.unwrap());
            }
        }
        all
    }

    fn check_line_coverage(path: &Path, total_chunks: usize, expected_lines: usize) {
        let all = collect_all_lines(path, total_chunks);
        assert_eq!(all.len(), expected_lines, "total_chunks={total_chunks}");
        let counters: Vec<usize> =
            all.iter().map(|l| l.split('\t').nth(2).unwrap().parse().unwrap()).collect();
        assert_eq!(counters, (0..expected_lines).collect::<Vec<_>>());
    }

    #[test]
    fn test_chunk_coverage_reconstructs_file_exactly_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.tsv");
        let records = 20;
        let lines = 2;
        write_grouped_file(&path, records, lines);
        for total in [1, 2, records / 3, records / 2, records, records + 1, 2 * records] {
            check_line_coverage(&path, total, records * lines);
        }
    }

    #[test]
    fn test_single_chunk_is_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.tsv");
        write_grouped_file(&path, 5, 1);
        let chunks = plan(&path, 1).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_surplus_chunks_realize_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.tsv");
        write_grouped_file(&path, 3, 1);
        let chunks = plan(&path, 50).unwrap();
        assert_eq!(chunks.len(), 50);
        let mut yielded = 0;
        for chunk in &chunks {
            yielded += LineSlice::new(&path, chunk).unwrap().count();
        }
        assert_eq!(yielded, 3);
    }

    fn link_line(key: usize, sbjct: usize) -> String {
        format!("q{key}\ts{sbjct}\t1e-5\t1\t50\t+49\t1\t50\t+49")
    }

    fn write_link_file(path: &Path, group_sizes: &[usize]) {
        let mut out = File::create(path).unwrap();
        writeln!(out, "# pairwise links").unwrap();
        writeln!(out, "query\tsbjct\tevalue\tqs\tqe\tqali\tss\tse\tsali").unwrap();
        for (key, &size) in group_sizes.iter().enumerate() {
            for sbjct in 0..size {
                writeln!(out, "{}", link_line(key, sbjct)).unwrap();
            }
        }
    }

    #[test]
    fn test_groups_never_split_across_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.tsv");
        let group_sizes = [3, 1, 7, 2, 2, 5, 1, 1, 4, 3];
        write_link_file(&path, &group_sizes);
        for total in 1..=group_sizes.len() + 2 {
            let mut seen: Vec<(String, usize)> = Vec::new();
            for chunk in plan(&path, total).unwrap() {
                for group in GroupSlice::new(&path, &chunk).unwrap() {
                    let group = group.unwrap();
                    seen.push((group.key.clone(), group.links.len()));
                }
            }
            let expected: Vec<(String, usize)> = group_sizes
                .iter()
                .enumerate()
                .map(|(key, &size)| (format!("q{key}"), size))
                .collect();
            assert_eq!(seen, expected, "total_chunks={total}");
        }
    }

    #[test]
    fn test_group_slice_single_chunk_skips_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.tsv");
        write_link_file(&path, &[2, 3]);
        let chunks = plan(&path, 1).unwrap();
        let groups: Vec<LinkGroup> =
            GroupSlice::new(&path, &chunks[0]).unwrap().map(|g| g.unwrap()).collect();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, "q0");
        assert_eq!(groups[0].links.len(), 2);
        assert_eq!(groups[1].key, "q1");
        assert_eq!(groups[1].links.len(), 3);
    }

    #[test]
    fn test_gzip_chunks_cover_all_groups() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.tsv.gz");
        let group_sizes: Vec<usize> = (0..200).map(|i| 1 + i % 5).collect();
        let mut encoder =
            GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        writeln!(encoder, "query\tsbjct\tevalue\tqs\tqe\tqali\tss\tse\tsali").unwrap();
        for (key, &size) in group_sizes.iter().enumerate() {
            for sbjct in 0..size {
                writeln!(encoder, "{}", link_line(key, sbjct)).unwrap();
            }
        }
        encoder.finish().unwrap();

        for total in [1, 4] {
            let mut count = 0;
            for chunk in plan(&path, total).unwrap() {
                for group in GroupSlice::new(&path, &chunk).unwrap() {
                    group.unwrap();
                    count += 1;
                }
            }
            assert_eq!(count, group_sizes.len(), "total_chunks={total}");
        }
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.tsv");
        File::create(&path).unwrap();
        for chunk in plan(&path, 4).unwrap() {
            assert_eq!(LineSlice::new(&path, &chunk).unwrap().count(), 0);
        }
    }
}
