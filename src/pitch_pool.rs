// src/pitch_pool.rs

//! Fixed pool of worker threads for offline pitch jobs. Jobs are cancelled
//! cooperatively: the worker re-checks a shared flag between channels and
//! every 32 hops and acknowledges with a `Cancelled` message. The pool never
//! blocks the engine; results come back over a channel the engine drains.

use crate::buffer::AudioBuffer;
use crate::pitch;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub const PROGRESS_SCALER: f32 = 1_000_000.0;

#[derive(Debug)]
pub enum PoolMessage {
    Progress { job: u64, track: usize, pct: f32 },
    Done { job: u64, track: usize, buffer: AudioBuffer },
    Cancelled { job: u64, track: usize },
    Failed { job: u64, track: usize, message: String },
}

struct JobRequest {
    id: u64,
    track: usize,
    input: AudioBuffer,
    semitones: f32,
    grain: usize,
    hop_ratio: f32,
    cancel: Arc<AtomicBool>,
    progress: Arc<AtomicU32>,
}

/// Handle to an in-flight job. The input buffer is retained so the timeout
/// path can rerun the same pass inline.
pub struct PitchJob {
    pub id: u64,
    pub track: usize,
    pub semitones: f32,
    pub submitted_at: Instant,
    pub input: AudioBuffer,
    cancel: Arc<AtomicBool>,
    progress: Arc<AtomicU32>,
}

impl PitchJob {
    /// Idempotent; the worker acknowledges with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> f32 {
        self.progress.load(Ordering::Relaxed) as f32 / PROGRESS_SCALER
    }
}

struct Worker {
    tx: Sender<JobRequest>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub struct PitchPool {
    workers: Vec<Worker>,
    msg_tx: Sender<PoolMessage>,
    msg_rx: Receiver<PoolMessage>,
    next_id: u64,
}

impl PitchPool {
    pub fn new() -> Self {
        let parallelism = thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_workers(parallelism.saturating_sub(1).max(1))
    }

    pub fn with_workers(count: usize) -> Self {
        let (msg_tx, msg_rx) = unbounded();
        let workers = (0..count.max(1))
            .map(|index| {
                let (tx, rx) = unbounded::<JobRequest>();
                let busy = Arc::new(AtomicBool::new(false));
                let worker_busy = busy.clone();
                let worker_msg_tx = msg_tx.clone();
                let handle = thread::Builder::new()
                    .name(format!("pitch-worker-{}", index))
                    .spawn(move || worker_loop(rx, worker_busy, worker_msg_tx))
                    .expect("spawn pitch worker");
                Worker {
                    tx,
                    busy,
                    handle: Some(handle),
                }
            })
            .collect();
        Self {
            workers,
            msg_tx,
            msg_rx,
            next_id: 0,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn messages(&self) -> &Receiver<PoolMessage> {
        &self.msg_rx
    }

    /// Dispatch to an idle worker, or queue on the first worker when all are
    /// busy. Returns a handle the caller keeps for cancel/timeout handling.
    pub fn submit(
        &mut self,
        track: usize,
        input: AudioBuffer,
        semitones: f32,
        grain: usize,
        hop_ratio: f32,
    ) -> PitchJob {
        self.next_id += 1;
        let id = self.next_id;
        let cancel = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicU32::new(0));

        let request = JobRequest {
            id,
            track,
            input: input.clone(),
            semitones,
            grain,
            hop_ratio,
            cancel: cancel.clone(),
            progress: progress.clone(),
        };

        let slot = self
            .workers
            .iter()
            .position(|w| !w.busy.load(Ordering::Relaxed))
            .unwrap_or(0);
        if self.workers[slot].tx.send(request).is_err() {
            // Worker died; surface as a failure rather than losing the job.
            let _ = self.msg_tx.send(PoolMessage::Failed {
                job: id,
                track,
                message: "pitch worker unavailable".into(),
            });
        }

        PitchJob {
            id,
            track,
            semitones,
            submitted_at: Instant::now(),
            input,
            cancel,
            progress,
        }
    }
}

impl Default for PitchPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PitchPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            // Closing the channel ends the worker loop.
            let (tx, _) = unbounded();
            worker.tx = tx;
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(rx: Receiver<JobRequest>, busy: Arc<AtomicBool>, msg_tx: Sender<PoolMessage>) {
    while let Ok(job) = rx.recv() {
        busy.store(true, Ordering::Relaxed);
        run_job(job, &msg_tx);
        busy.store(false, Ordering::Relaxed);
    }
}

fn run_job(job: JobRequest, msg_tx: &Sender<PoolMessage>) {
    let JobRequest {
        id,
        track,
        input,
        semitones,
        grain,
        hop_ratio,
        cancel,
        progress,
    } = job;

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pitch::shift_pitch(&input, semitones, grain, hop_ratio, &mut |pct| {
            progress.store((pct * PROGRESS_SCALER) as u32, Ordering::Relaxed);
            let _ = msg_tx.send(PoolMessage::Progress {
                job: id,
                track,
                pct,
            });
            !cancel.load(Ordering::Relaxed)
        })
    }));

    let message = match result {
        Ok(Some(buffer)) => PoolMessage::Done {
            job: id,
            track,
            buffer,
        },
        Ok(None) => PoolMessage::Cancelled { job: id, track },
        Err(_) => PoolMessage::Failed {
            job: id,
            track,
            message: "pitch pass panicked".into(),
        },
    };
    let _ = msg_tx.send(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn short_sine() -> AudioBuffer {
        let samples: Vec<f32> = (0..8192)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44_100.0).sin())
            .collect();
        AudioBuffer::from_mono(samples, 44_100).unwrap()
    }

    fn wait_for_terminal(pool: &PitchPool, job: u64) -> PoolMessage {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match pool.messages().recv_timeout(Duration::from_millis(100)) {
                Ok(PoolMessage::Progress { .. }) => continue,
                Ok(msg) => {
                    let id = match &msg {
                        PoolMessage::Done { job, .. }
                        | PoolMessage::Cancelled { job, .. }
                        | PoolMessage::Failed { job, .. } => *job,
                        PoolMessage::Progress { .. } => unreachable!(),
                    };
                    if id == job {
                        return msg;
                    }
                }
                Err(_) => {
                    if Instant::now() > deadline {
                        panic!("no terminal message for job {}", job);
                    }
                }
            }
        }
    }

    #[test]
    fn test_job_completes_with_same_length() {
        let mut pool = PitchPool::with_workers(1);
        let input = short_sine();
        let frames = input.frames();
        let job = pool.submit(2, input, 5.0, 2048, 0.25);
        match wait_for_terminal(&pool, job.id) {
            PoolMessage::Done { buffer, track, .. } => {
                assert_eq!(track, 2);
                assert_eq!(buffer.frames(), frames);
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_cancel_is_acknowledged() {
        let mut pool = PitchPool::with_workers(1);
        let job = pool.submit(0, short_sine(), -7.0, 1024, 0.25);
        job.cancel();
        job.cancel(); // idempotent
        match wait_for_terminal(&pool, job.id) {
            PoolMessage::Cancelled { track, .. } => assert_eq!(track, 0),
            PoolMessage::Done { .. } => {} // raced past the flag; allowed
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_single_worker_runs_jobs_in_order() {
        let mut pool = PitchPool::with_workers(1);
        let first = pool.submit(0, short_sine(), 3.0, 1024, 0.25);
        let second = pool.submit(1, short_sine(), 3.0, 1024, 0.25);
        let mut finished = Vec::new();
        for _ in 0..2 {
            let done = loop {
                match pool.messages().recv_timeout(Duration::from_secs(10)).unwrap() {
                    PoolMessage::Done { job, .. } => break job,
                    PoolMessage::Progress { .. } => continue,
                    other => panic!("unexpected {:?}", other),
                }
            };
            finished.push(done);
        }
        assert_eq!(finished, vec![first.id, second.id]);
    }

    #[test]
    fn test_pool_sizes_at_least_one_worker() {
        let pool = PitchPool::with_workers(0);
        assert_eq!(pool.worker_count(), 1);
    }
}
