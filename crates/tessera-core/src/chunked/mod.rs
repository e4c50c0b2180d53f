//! Adaptive chunked transfers
//!
//! Large outbound messages are announced with a `new` chunk and streamed as
//! `payload` chunks, each a byte range of one trailer segment. At most
//! `window` chunks are in flight; when the window fills, the sender waits on
//! the oldest chunk before sending more.
//!
//! ```text
//! new ─▶ p0 ─▶ p1 ─▶ ... ─▶ p(window-1)      window full
//!  ack ◀─┘                                    wait oldest, then drain to half
//!                                             (auto-adjust: grow on fast acks)
//! ```
//!
//! Sizing is asymmetric. A chunk timeout divides the chunk size by 100 and
//! is returned to the caller; fast acknowledgements grow it. After every
//! transfer the bytes and time are folded into a rolling speed estimate
//! that also seeds the `hint_chunk_size` sent to the upstream.

mod assembler;

pub use assembler::{ChunkAssembler, ChunkOutcome};

use crate::config::ChunkingConfig;
use crate::connection::{ConnectionManager, set_task_uid};
use crate::tasks::{Response, TaskHandle};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_protocol::{CHUNKED_TRANSFER_MIN_VERSION, ChunkMessage};
use uuid::Uuid;

/// Chunk size policy and transfer speed estimate
#[derive(Debug, Clone)]
pub struct ChunkSizer {
    config: ChunkingConfig,
    size: usize,
    accum_bytes: f64,
    accum_secs: f64,
}

impl ChunkSizer {
    /// Start from the configured chunk size
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            size: config.size,
            config,
            accum_bytes: 0.0,
            accum_secs: 0.0,
        }
    }

    /// Persistent chunk size carried between transfers
    pub fn chunk_size(&self) -> usize {
        self.size
    }

    /// Starting chunk size of a new transfer
    pub fn initial_transfer_size(&self) -> usize {
        self.size.max(self.config.min_size)
    }

    /// Shrink hard after a chunk timed out
    pub fn on_timeout(&mut self) {
        if self.config.auto_adjust {
            self.size = (self.size / 100).max(self.config.min_size);
            tracing::debug!("Chunk timed out, chunk size now {}", self.size);
        }
    }

    /// Round trips shorter than this count as fast
    fn fast_round_trip(&self) -> Duration {
        self.config.timeout.div_f64(self.config.safety_factor)
    }

    /// A single chunk came back very fast: jump to a multiple of the
    /// smallest chunk seen
    pub fn grow_on_fast_return(&self, current: usize, min_size: usize, delta: Duration) -> usize {
        if delta >= self.fast_round_trip() {
            return current;
        }
        let candidate = (min_size as f64 * self.config.safety_factor / 2.0) as usize;
        if candidate > current {
            tracing::debug!(
                "Increased chunk size to {} as the round trip ({:?}) is very small",
                candidate,
                delta
            );
            candidate
        } else {
            current
        }
    }

    /// After draining half the window: grow modestly when round trips are
    /// fast and the waits are dominated by one slow ack
    pub fn grow_on_drain(
        &self,
        current: usize,
        min_size: usize,
        min_delta: Duration,
        max_wait: Duration,
        second_wait: Duration,
    ) -> usize {
        let fast = min_delta < self.fast_round_trip();
        let bimodal = second_wait < max_wait.div_f64(self.config.safety_factor);
        if !(fast && bimodal) {
            return current;
        }
        let candidate = (min_size as f64 * 1.5) as usize;
        if candidate > current {
            tracing::debug!("Increased chunk size to {} as the waits are noisy", candidate);
            candidate
        } else {
            current
        }
    }

    /// Fold a finished transfer into the speed estimate and re-seed the
    /// persistent chunk size
    pub fn record_transfer(&mut self, bytes: usize, elapsed: Duration) {
        self.accum_bytes += bytes as f64;
        self.accum_secs += elapsed.as_secs_f64();
        let ratio = self.accum_secs / self.config.speed_window.as_secs_f64();
        if ratio > 1.0 {
            self.accum_secs /= ratio;
            self.accum_bytes /= ratio;
        }

        if !self.config.auto_adjust {
            return;
        }
        let Some(estimate) = self.estimated_chunk_size() else {
            return;
        };
        let estimate = estimate as usize;
        self.size = if estimate < self.size {
            estimate
        } else {
            (self.size + estimate) / 2
        }
        .max(self.config.min_size);
        tracing::debug!(
            "Transfer speed estimate {:.0} B/s, chunk size now {}",
            self.speed().unwrap_or_default(),
            self.size
        );
    }

    /// Bytes per second over the rolling window
    pub fn speed(&self) -> Option<f64> {
        (self.accum_secs > 0.0).then(|| self.accum_bytes / self.accum_secs)
    }

    /// Chunk size that takes a fifth of the chunk timeout at the estimated
    /// speed; sent to the upstream as `hint_chunk_size`
    pub fn estimated_chunk_size(&self) -> Option<f64> {
        self.speed()
            .map(|speed| self.config.timeout.as_secs_f64() / 5.0 * speed)
    }
}

struct InFlight {
    task: TaskHandle,
    sent: Instant,
    size: usize,
}

/// Sends messages as pipelined, adaptively sized chunks
pub struct ChunkedTransferEngine {
    conn: Arc<ConnectionManager>,
    config: ChunkingConfig,
    sizer: Mutex<ChunkSizer>,
}

impl ChunkedTransferEngine {
    /// Engine sending through `conn`
    pub fn new(conn: Arc<ConnectionManager>, config: ChunkingConfig) -> Self {
        Self {
            conn,
            sizer: Mutex::new(ChunkSizer::new(config.clone())),
            config,
        }
    }

    /// Current sizing state
    pub fn sizer(&self) -> ChunkSizer {
        self.sizer.lock().clone()
    }

    /// Send `message` as a chunked transfer on behalf of the task
    /// `main_task`, which is kept alive while chunks are acknowledged.
    ///
    /// Falls back to a direct send when the negotiated protocol predates
    /// chunking. A chunk timeout or failure aborts the transfer; retrying is
    /// the caller's business.
    pub fn send_chunked(&self, main_task: &str, mut message: Value, segments: Vec<Bytes>) -> Result<()> {
        if !self
            .conn
            .wait_for_auth(Some(self.conn.config().generic_timeout))?
        {
            return Err(Error::Disconnected);
        }
        if self.conn.protocol_version()? < CHUNKED_TRANSFER_MIN_VERSION {
            return self.conn.send(message, segments);
        }

        let mut in_flight = VecDeque::new();
        let result = self.stream_chunks(main_task, &mut message, &segments, &mut in_flight);
        if result.is_err() {
            for f in &in_flight {
                self.conn.tasks().forget(f.task.id());
            }
        }
        result
    }

    fn stream_chunks(
        &self,
        main_task: &str,
        message: &mut Value,
        segments: &[Bytes],
        in_flight: &mut VecDeque<InFlight>,
    ) -> Result<()> {
        let tasks = self.conn.tasks();
        let window = self.config.window.max(1);
        let mut chunk_size = self.sizer.lock().initial_transfer_size();
        let chunk_uid = Uuid::new_v4().simple().to_string();

        self.conn.stamp(message)?;
        let opening = ChunkMessage::New {
            chunk_uid: chunk_uid.clone(),
            rest_sizes: segments.iter().map(|s| s.len() as u64).collect(),
            msg: message.take(),
        };
        let task = tasks.add_task(true, Some(self.config.timeout));
        self.conn.send(opening.to_json(Some(task.id()))?, Vec::new())?;
        in_flight.push_back(InFlight {
            task,
            sent: Instant::now(),
            size: 1,
        });

        let started = Instant::now();
        let total: usize = segments.iter().map(Bytes::len).sum();

        for (rest_index, segment) in segments.iter().enumerate() {
            let mut start = 0;
            while start < segment.len() {
                let len = chunk_size.min(segment.len() - start);
                let task = tasks.add_task(true, Some(self.config.timeout));
                let payload = ChunkMessage::Payload {
                    chunk_uid: chunk_uid.clone(),
                    rest_index,
                    bytes_start: start as u64,
                };
                self.conn.send(
                    payload.to_json(Some(task.id()))?,
                    vec![segment.slice(start..start + len)],
                )?;
                in_flight.push_back(InFlight {
                    task,
                    sent: Instant::now(),
                    size: len,
                });
                start += len;

                if in_flight.len() < window {
                    continue;
                }
                let Some(first) = in_flight.pop_front() else {
                    continue;
                };
                let first_wait = self.wait_chunk(main_task, &first)?;
                let first_delta = first.sent.elapsed();
                if !self.config.auto_adjust {
                    continue;
                }

                let mut max_wait = first_wait;
                let mut second_wait = Duration::ZERO;
                let mut min_delta = first_delta;
                let mut min_size = first.size;
                while in_flight.len() > window / 2 {
                    let Some(next) = in_flight.pop_front() else {
                        break;
                    };
                    let wait = self.wait_chunk(main_task, &next)?;
                    if wait > max_wait {
                        second_wait = max_wait;
                        max_wait = wait;
                    } else if wait > second_wait {
                        second_wait = wait;
                    }
                    let delta = next.sent.elapsed();
                    min_delta = min_delta.min(delta);
                    min_size = min_size.min(next.size);
                    chunk_size = self.sizer.lock().grow_on_fast_return(chunk_size, min_size, delta);
                }
                chunk_size = self.sizer.lock().grow_on_drain(
                    chunk_size,
                    min_size,
                    min_delta,
                    max_wait,
                    second_wait,
                );
            }
        }

        while let Some(next) = in_flight.pop_front() {
            self.wait_chunk(main_task, &next)?;
        }

        let hint = {
            let mut sizer = self.sizer.lock();
            sizer.record_transfer(total, started.elapsed());
            sizer.estimated_chunk_size()
        };
        self.conn.set_hint_chunk_size(hint);
        tracing::debug!(
            "Chunked transfer {} of {} bytes took {:?}",
            chunk_uid,
            total,
            started.elapsed()
        );
        Ok(())
    }

    /// Wait for one chunk's ack; returns how long this call blocked
    fn wait_chunk(&self, main_task: &str, chunk: &InFlight) -> Result<Duration> {
        let tasks = self.conn.tasks();
        let waiting = Instant::now();
        match tasks.await_result(&chunk.task, Some(self.config.timeout), None) {
            Ok(response) if response.generic.success => {
                tasks.touch(main_task);
                Ok(waiting.elapsed())
            }
            Ok(response) => Err(Error::rejected(format!(
                "Failure in chunked send: {}",
                response.generic.reason
            ))),
            Err(Error::Timeout) => {
                self.sizer.lock().on_timeout();
                Err(Error::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a request as a chunked transfer and wait for its response
    pub fn request(
        &self,
        mut message: Value,
        segments: Vec<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let tasks = self.conn.tasks();
        let task = tasks.add_task(true, timeout);
        set_task_uid(&mut message, task.id())?;
        if let Err(e) = self.send_chunked(task.id(), message, segments) {
            tasks.forget(task.id());
            return Err(e);
        }
        let result = tasks.await_result(&task, timeout, None);
        tasks.forget(task.id());
        result
    }
}
