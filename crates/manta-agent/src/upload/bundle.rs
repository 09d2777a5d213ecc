use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::UploadReport;

/// A run of whole CSV records sent as one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub index: usize,
    pub lines: usize,
    pub data: Vec<u8>,
}

/// Snapshot of a bundle taken by the monitor
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Progress {
    pub uploaded: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub remaining: Option<Duration>,
    /// Lines per second since the previous tick
    pub rate: f64,
    pub last_status: String,
    pub idle: Duration,
    pub stalled: bool,
}

#[derive(Debug)]
struct BundleState {
    pending: Vec<Chunk>,
    chunk_count: usize,
    acknowledged: usize,
    total_lines: usize,
    uploaded_lines: usize,
    last_status: String,
    done: bool,
    error: bool,
    started: Instant,
    last_progress: Instant,
    last_tick: Instant,
    last_tick_lines: usize,
}

/// Upload state of one file, shared by the workers and the monitor.
///
/// Every method takes the lock once and never holds it across an `.await`.
#[derive(Debug)]
pub(crate) struct WorkBundle {
    header: Vec<u8>,
    state: Mutex<BundleState>,
}

impl WorkBundle {
    pub fn new(header: Vec<u8>, chunks: Vec<Chunk>) -> Self {
        let now = Instant::now();
        let total_lines = chunks.iter().map(|c| c.lines).sum();
        Self {
            header,
            state: Mutex::new(BundleState {
                chunk_count: chunks.len(),
                done: chunks.is_empty(),
                pending: chunks,
                acknowledged: 0,
                total_lines,
                uploaded_lines: 0,
                last_status: String::new(),
                error: false,
                started: now,
                last_progress: now,
                last_tick: now,
                last_tick_lines: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BundleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next chunk to send, or `None` once the bundle is finished either way
    pub fn take_work(&self) -> Option<Chunk> {
        let mut state = self.lock();
        if state.done || state.error {
            return None;
        }
        state.pending.pop()
    }

    pub fn record_success(&self, chunk: &Chunk, status: String) {
        let mut state = self.lock();
        state.acknowledged += 1;
        state.uploaded_lines += chunk.lines;
        state.last_status = status;
        state.last_progress = Instant::now();
        if state.acknowledged == state.chunk_count {
            state.done = true;
        }
    }

    /// Remember the latest failure text without failing the bundle
    pub fn record_status(&self, status: String) {
        self.lock().last_status = status;
    }

    /// Fail the whole upload; workers stop at their next check
    pub fn report_error(&self, status: String) {
        let mut state = self.lock();
        state.error = true;
        state.last_status = status;
    }

    pub fn should_stop(&self) -> bool {
        let state = self.lock();
        state.done || state.error
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    pub fn is_error(&self) -> bool {
        self.lock().error
    }

    /// Request body for `chunk`: the header followed by its records
    pub fn body(&self, chunk: &Chunk) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.header.len() + chunk.data.len());
        body.extend_from_slice(&self.header);
        body.extend_from_slice(&chunk.data);
        body
    }

    /// Sample progress; a bundle idle for longer than `max_idle` is failed here
    pub fn progress_tick(&self, max_idle: Duration) -> Progress {
        let mut state = self.lock();
        let now = Instant::now();

        let elapsed = now.duration_since(state.started);
        let idle = now.duration_since(state.last_progress);
        let since_tick = now.duration_since(state.last_tick).as_secs_f64();
        let rate = if since_tick > 0.0 {
            (state.uploaded_lines - state.last_tick_lines) as f64 / since_tick
        } else {
            0.0
        };
        let remaining = (state.uploaded_lines > 0).then(|| {
            let left = (state.total_lines - state.uploaded_lines) as f64;
            elapsed.mul_f64(left / state.uploaded_lines as f64)
        });

        let stalled = !state.done && !state.error && idle > max_idle;
        if stalled {
            state.error = true;
        }
        state.last_tick = now;
        state.last_tick_lines = state.uploaded_lines;

        Progress {
            uploaded: state.uploaded_lines,
            total: state.total_lines,
            elapsed,
            remaining,
            rate,
            last_status: state.last_status.clone(),
            idle,
            stalled,
        }
    }

    pub fn report(&self) -> UploadReport {
        let state = self.lock();
        UploadReport {
            success: state.done && !state.error,
            total_lines: state.total_lines,
            uploaded_lines: state.uploaded_lines,
            chunks: state.chunk_count,
            last_status: state.last_status.clone(),
        }
    }
}

/// Split raw CSV bytes into records, each ending with `\n`.
///
/// Boundaries come from the same `csv` parser the delta engine reads dumps
/// with, so both agree on what a row is. Quoted line breaks stay inside
/// their record, a stray quote inside an unquoted field does not open one,
/// and the bytes themselves are never decoded.
pub(crate) fn split_records(data: &[u8]) -> csv::Result<Vec<Vec<u8>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data);
    let mut record = csv::ByteRecord::new();
    let mut records = Vec::new();
    let mut start = 0usize;

    while reader.read_byte_record(&mut record)? {
        let end = usize::try_from(reader.position().byte()).unwrap_or(data.len());
        let raw = data.get(start..end).unwrap_or_default();
        start = end;

        // Blank lines skipped by the parser sit in front of the record
        let raw = match raw.iter().position(|b| *b != b'\n' && *b != b'\r') {
            Some(first) => &raw[first..],
            None => continue,
        };
        let mut raw = raw.to_vec();
        if raw.last() != Some(&b'\n') {
            raw.push(b'\n');
        }
        records.push(raw);
    }
    Ok(records)
}

/// Group records into chunks of at most `chunk_size`, in file order
pub(crate) fn make_chunks(records: &[Vec<u8>], chunk_size: usize) -> Vec<Chunk> {
    records
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(index, group)| Chunk {
            index,
            lines: group.len(),
            data: group.concat(),
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn bundle(lines: usize, chunk_size: usize) -> WorkBundle {
        let records: Vec<Vec<u8>> = (0..lines).map(|i| format!("{},v\n", i).into_bytes()).collect();
        WorkBundle::new(b"id,v\n".to_vec(), make_chunks(&records, chunk_size))
    }

    fn split(data: &[u8]) -> Vec<String> {
        split_records(data)
            .unwrap()
            .into_iter()
            .map(|r| String::from_utf8(r).unwrap())
            .collect()
    }

    #[test]
    fn test_split_records_handles_quotes_and_blank_lines() {
        let text = b"1,plain\n\n2,\"two\nlines\"\n3,\"say \"\"hi\"\"\"\n4,last";
        assert_eq!(
            split(text),
            vec![
                "1,plain\n",
                "2,\"two\nlines\"\n",
                "3,\"say \"\"hi\"\"\"\n",
                "4,last\n"
            ]
        );
    }

    #[test]
    fn test_split_records_stray_quote_in_unquoted_field() {
        let text = b"id,name\n1,5\" screen\n2,b\n3,c\n";
        assert_eq!(split(text), vec!["id,name\n", "1,5\" screen\n", "2,b\n", "3,c\n"]);
    }

    #[test]
    fn test_split_records_keeps_bytes_and_crlf() {
        let text = b"id,name\r\n1,Jos\xe9\r\n\r\n2,b\r\n";
        let records = split_records(text).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], b"1,Jos\xe9\r\n".to_vec());
        assert_eq!(records[2], b"2,b\r\n".to_vec());
    }

    #[test]
    fn test_split_records_empty_input() {
        assert!(split_records(b"").unwrap().is_empty());
        assert!(split_records(b"\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_make_chunks_sizes() {
        let records: Vec<Vec<u8>> = (0..7).map(|i| format!("{}\n", i).into_bytes()).collect();
        let chunks = make_chunks(&records, 3);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.lines).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(chunks[2].data, b"6\n".to_vec());
    }

    #[test]
    fn test_chunks_taken_from_the_tail() {
        let bundle = bundle(5, 2);
        assert_eq!(bundle.take_work().unwrap().index, 2);
        assert_eq!(bundle.take_work().unwrap().index, 1);
    }

    #[test]
    fn test_done_after_every_chunk_acknowledged() {
        let bundle = bundle(4, 2);
        let first = bundle.take_work().unwrap();
        let second = bundle.take_work().unwrap();
        assert!(bundle.take_work().is_none());

        bundle.record_success(&first, "ok".to_string());
        assert!(!bundle.is_done());
        bundle.record_success(&second, "ok 2".to_string());
        assert!(bundle.is_done());

        let report = bundle.report();
        assert!(report.success);
        assert_eq!(report.uploaded_lines, 4);
        assert_eq!(report.total_lines, 4);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.last_status, "ok 2");
    }

    #[test]
    fn test_error_stops_handing_out_work() {
        let bundle = bundle(4, 1);
        bundle.take_work().unwrap();
        bundle.report_error("HTTP 500".to_string());

        assert!(bundle.should_stop());
        assert!(bundle.take_work().is_none());
        assert!(!bundle.report().success);
    }

    #[test]
    fn test_body_prefixes_header() {
        let bundle = bundle(3, 3);
        let chunk = bundle.take_work().unwrap();
        assert_eq!(bundle.body(&chunk), b"id,v\n0,v\n1,v\n2,v\n".to_vec());
    }

    #[test]
    fn test_empty_bundle_is_done() {
        let bundle = WorkBundle::new(b"id\n".to_vec(), Vec::new());
        assert!(bundle.is_done());
        assert!(bundle.take_work().is_none());
        assert!(bundle.report().success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_estimates_remaining_time() {
        let bundle = bundle(4, 1);
        tokio::time::advance(Duration::from_secs(10)).await;
        let chunk = bundle.take_work().unwrap();
        bundle.record_success(&chunk, "ok".to_string());

        let progress = bundle.progress_tick(Duration::from_secs(60));
        assert_eq!(progress.uploaded, 1);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.elapsed, Duration::from_secs(10));
        assert_eq!(progress.remaining, Some(Duration::from_secs(30)));
        assert!((progress.rate - 0.1).abs() < 1e-9);
        assert!(!progress.stalled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_marks_bundle_errored() {
        let bundle = bundle(2, 1);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!bundle.progress_tick(Duration::from_secs(60)).stalled);

        tokio::time::advance(Duration::from_secs(31)).await;
        let progress = bundle.progress_tick(Duration::from_secs(60));
        assert!(progress.stalled);
        assert_eq!(progress.remaining, None);
        assert!(bundle.is_error());
    }
}
