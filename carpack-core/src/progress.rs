use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(5);

/// Batch counters, optionally reported on the log from a background thread.
#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    pub jobs_done: Arc<AtomicUsize>,
    pub jobs_total: Arc<AtomicUsize>,
    pub bytes_done: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            jobs_done: Arc::new(AtomicUsize::new(0)),
            jobs_total: Arc::new(AtomicUsize::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_jobs_total(&self, n: usize) {
        self.jobs_total.store(n, Ordering::Relaxed);
    }

    /// One archive finished with `bytes` payload.
    pub fn job_done(&self, bytes: u64) {
        self.jobs_done.fetch_add(1, Ordering::Relaxed);
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn jobs_done(&self) -> usize {
        self.jobs_done.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let this = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while this.running.load(Ordering::Relaxed) {
                thread::sleep(TICK);
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }
                tracing::info!(
                    elapsed_s = t0.elapsed().as_secs(),
                    jobs = this.jobs_done(),
                    of = this.jobs_total.load(Ordering::Relaxed),
                    bytes = this.bytes_done.load(Ordering::Relaxed),
                    "progress"
                );
            }
        });
    }

    pub fn stop(&self) {
        if self.enabled {
            self.running.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_clones() {
        let p = Progress::new(false);
        p.set_jobs_total(3);
        let q = p.clone();
        q.job_done(10);
        p.job_done(5);
        assert_eq!(p.jobs_done(), 2);
        assert_eq!(q.bytes_done.load(Ordering::Relaxed), 15);
    }
}
