//! Live worker output buffer for streamed exec chunks.
//!
//! A volatile in-memory tail buffer keyed by worker_id, built for
//! low-latency peeking without persisting every chunk. Entries expire
//! after inactivity; pruning happens opportunistically on access.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Max bytes retained per worker (tail).
const DEFAULT_MAX_BYTES: usize = 50 * 1024;
/// Buffers are dropped after this much inactivity.
const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// Bus events carry at most this much of a chunk.
pub const EVENT_CHUNK_BYTES: usize = 4 * 1024;

/// Metadata cached alongside a worker's buffer.
#[derive(Debug, Clone, Default)]
pub struct WorkerOutputMeta {
    pub job_id: Option<i64>,
    pub course_id: Option<i64>,
    pub trace_id: Option<Uuid>,
    pub owner_id: Option<i64>,
}

struct Buffer {
    chunks: VecDeque<String>,
    size: usize,
    updated_at: Instant,
    last_runner_job_id: Option<Uuid>,
    meta: WorkerOutputMeta,
}

impl Buffer {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            updated_at: Instant::now(),
            last_runner_job_id: None,
            meta: WorkerOutputMeta::default(),
        }
    }

    fn append(&mut self, data: String, max_bytes: usize) {
        if data.is_empty() {
            return;
        }
        self.size += data.len();
        self.chunks.push_back(data);
        self.updated_at = Instant::now();

        let mut overflow = self.size.saturating_sub(max_bytes);
        while overflow > 0 {
            let Some(oldest) = self.chunks.front_mut() else { break };
            if overflow >= oldest.len() {
                self.size -= oldest.len();
                overflow -= oldest.len();
                self.chunks.pop_front();
            } else {
                // Trim only the overflow from the oldest chunk, keeping
                // the cut on a char boundary.
                let boundary = (overflow..oldest.len())
                    .find(|i| oldest.is_char_boundary(*i))
                    .unwrap_or(oldest.len());
                self.size -= boundary;
                oldest.drain(..boundary);
                overflow = 0;
            }
        }
    }

    fn tail(&self, max_bytes: Option<usize>) -> String {
        let combined: String = self.chunks.iter().map(String::as_str).collect();
        match max_bytes {
            Some(limit) if limit > 0 && combined.len() > limit => {
                let start = combined.len() - limit;
                let boundary = (start..combined.len())
                    .find(|i| combined.is_char_boundary(*i))
                    .unwrap_or(combined.len());
                combined[boundary..].to_string()
            }
            _ => combined,
        }
    }
}

/// Tail buffers for all live workers.
pub struct WorkerOutputBuffer {
    max_bytes: usize,
    ttl: Duration,
    buffers: Mutex<HashMap<String, Buffer>>,
}

impl WorkerOutputBuffer {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_BYTES, DEFAULT_TTL)
    }

    pub fn with_limits(max_bytes: usize, ttl: Duration) -> Self {
        Self {
            max_bytes,
            ttl,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn prune_locked(&self, buffers: &mut HashMap<String, Buffer>) {
        let ttl = self.ttl;
        buffers.retain(|_, buf| buf.updated_at.elapsed() <= ttl);
    }

    /// Append an output chunk for a worker. A chunk from a new runner job
    /// gets a separator header; stderr chunks get a `[stderr]` prefix.
    #[allow(clippy::too_many_arguments)]
    pub fn append_output(
        &self,
        worker_id: &str,
        stream: &str,
        data: &str,
        runner_job_id: Option<Uuid>,
        job_id: Option<i64>,
        course_id: Option<i64>,
        trace_id: Option<Uuid>,
        owner_id: Option<i64>,
    ) {
        if worker_id.is_empty() {
            return;
        }
        let mut buffers = self.buffers.lock().expect("output buffer lock");
        self.prune_locked(&mut buffers);
        let buf = buffers
            .entry(worker_id.to_string())
            .or_insert_with(Buffer::new);

        if job_id.is_some() {
            buf.meta.job_id = job_id;
        }
        if course_id.is_some() {
            buf.meta.course_id = course_id;
        }
        if trace_id.is_some() {
            buf.meta.trace_id = trace_id;
        }
        if owner_id.is_some() {
            buf.meta.owner_id = owner_id;
        }

        if data.is_empty() {
            return;
        }

        let mut prefix = String::new();
        if let Some(id) = runner_job_id {
            if buf.last_runner_job_id != Some(id) {
                prefix = format!("\n\n[runner_job {id}]\n");
                buf.last_runner_job_id = Some(id);
            }
        }
        if stream == "stderr" {
            prefix.push_str("[stderr] ");
        }

        buf.append(format!("{prefix}{data}"), self.max_bytes);
    }

    /// Tail output for a worker, optionally capped.
    pub fn get_tail(&self, worker_id: &str, max_bytes: Option<usize>) -> String {
        let mut buffers = self.buffers.lock().expect("output buffer lock");
        self.prune_locked(&mut buffers);
        buffers
            .get(worker_id)
            .map(|buf| buf.tail(max_bytes))
            .unwrap_or_default()
    }

    pub fn get_meta(&self, worker_id: &str) -> Option<WorkerOutputMeta> {
        let mut buffers = self.buffers.lock().expect("output buffer lock");
        self.prune_locked(&mut buffers);
        buffers.get(worker_id).map(|buf| buf.meta.clone())
    }
}

impl Default for WorkerOutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append_simple(buf: &WorkerOutputBuffer, worker: &str, data: &str) {
        buf.append_output(worker, "stdout", data, None, None, None, None, None);
    }

    #[test]
    fn tail_accumulates_in_order() {
        let buf = WorkerOutputBuffer::new();
        append_simple(&buf, "w1", "hello ");
        append_simple(&buf, "w1", "world");
        assert_eq!(buf.get_tail("w1", None), "hello world");
        assert_eq!(buf.get_tail("other", None), "");
    }

    #[test]
    fn buffer_trims_to_tail() {
        let buf = WorkerOutputBuffer::with_limits(10, DEFAULT_TTL);
        append_simple(&buf, "w1", "0123456789");
        append_simple(&buf, "w1", "abcdef");
        let tail = buf.get_tail("w1", None);
        assert_eq!(tail.len(), 10);
        assert!(tail.ends_with("abcdef"));
    }

    #[test]
    fn get_tail_caps_at_max_bytes() {
        let buf = WorkerOutputBuffer::new();
        append_simple(&buf, "w1", &"x".repeat(100));
        assert_eq!(buf.get_tail("w1", Some(10)).len(), 10);
    }

    #[test]
    fn new_runner_job_gets_separator_and_stderr_prefix() {
        let buf = WorkerOutputBuffer::new();
        let job = Uuid::new_v4();
        buf.append_output("w1", "stdout", "out", Some(job), None, None, None, None);
        buf.append_output("w1", "stderr", "err", Some(job), None, None, None, None);
        let tail = buf.get_tail("w1", None);
        assert!(tail.contains(&format!("[runner_job {job}]")));
        assert!(tail.contains("[stderr] err"));
        // Separator appears once per job, not per chunk.
        assert_eq!(tail.matches("[runner_job").count(), 1);
    }

    #[test]
    fn expired_buffers_are_pruned() {
        let buf = WorkerOutputBuffer::with_limits(1024, Duration::from_millis(0));
        append_simple(&buf, "w1", "data");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(buf.get_tail("w1", None), "");
    }

    #[test]
    fn meta_is_merged_not_replaced() {
        let buf = WorkerOutputBuffer::new();
        buf.append_output("w1", "stdout", "a", None, Some(5), None, None, None);
        buf.append_output("w1", "stdout", "b", None, None, Some(7), None, None);
        let meta = buf.get_meta("w1").unwrap();
        assert_eq!(meta.job_id, Some(5));
        assert_eq!(meta.course_id, Some(7));
    }
}
