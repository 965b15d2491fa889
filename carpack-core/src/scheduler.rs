//! Bounded worker pool running one job per manifest.
//!
//! A dispatcher thread feeds manifests through a rendezvous channel, so it
//! only gets ahead of the workers by the one manifest it is holding. Results
//! flow back over a second channel to the calling thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::config::BatchConfig;
use crate::error::{Error, Result};
use crate::job::{run_job, JobResult};
use crate::manifest::Manifest;
use crate::progress::Progress;

/// Shared stop flag. Once cancelled it stays cancelled.
///
/// Checked between jobs only: a job that has started runs to completion.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Scheduler {
    cfg: Arc<BatchConfig>,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(cfg: BatchConfig) -> Self {
        Self { cfg: Arc::new(cfg), cancel: CancelToken::new() }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.cfg
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run every manifest and collect the results in completion order.
    pub fn run<I>(&self, manifests: I) -> Result<Vec<JobResult>>
    where
        I: IntoIterator<Item = Manifest>,
        I::IntoIter: Send,
    {
        let mut out = Vec::new();
        self.run_with(manifests, |r| out.push(r))?;
        Ok(out)
    }

    /// Run every manifest, handing each result to `on_result` as soon as it
    /// arrives. Returns how many jobs completed.
    ///
    /// The first failing job stops dispatch; jobs already running finish
    /// (their results are still delivered) and then that first error is
    /// returned.
    pub fn run_with<I, F>(&self, manifests: I, mut on_result: F) -> Result<usize>
    where
        I: IntoIterator<Item = Manifest>,
        I::IntoIter: Send,
        F: FnMut(JobResult),
    {
        self.cfg.validate()?;
        let workers = self.cfg.workers.max(1);
        let manifests = manifests.into_iter();
        let progress = Progress::new(self.cfg.progress);
        progress.set_jobs_total(manifests.size_hint().0);
        progress.start();
        tracing::debug!(workers, "starting batch");

        let (job_tx, job_rx) = bounded::<(usize, Manifest)>(0);
        let (res_tx, res_rx) = unbounded::<Result<JobResult>>();
        let mut first_err: Option<Error> = None;
        let mut done = 0usize;

        thread::scope(|s| {
            let cancel = self.cancel.clone();
            s.spawn(move || dispatch(manifests, job_tx, cancel));
            for worker in 0..workers {
                let rx = job_rx.clone();
                let tx = res_tx.clone();
                let cancel = self.cancel.clone();
                let cfg: &BatchConfig = &self.cfg;
                s.spawn(move || work(worker, cfg, rx, tx, cancel));
            }
            drop(job_rx);
            drop(res_tx);

            for res in res_rx.iter() {
                match res {
                    Ok(r) => {
                        done += 1;
                        progress.job_done(r.payload_bytes);
                        on_result(r);
                    }
                    Err(e) => {
                        self.cancel.cancel();
                        tracing::debug!(error = %e, "job failed; stopping dispatch");
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
        });
        progress.stop();

        match first_err {
            Some(e) => Err(e),
            None => {
                if self.cancel.is_cancelled() {
                    tracing::warn!(done, "batch cancelled before all manifests ran");
                }
                Ok(done)
            }
        }
    }
}

fn dispatch<I: Iterator<Item = Manifest>>(
    manifests: I,
    queue: Sender<(usize, Manifest)>,
    cancel: CancelToken,
) {
    for (seq, m) in manifests.enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        // Fails only once every worker has exited.
        if queue.send((seq, m)).is_err() {
            break;
        }
    }
}

fn work(
    worker: usize,
    cfg: &BatchConfig,
    queue: Receiver<(usize, Manifest)>,
    results: Sender<Result<JobResult>>,
    cancel: CancelToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Ok((seq, manifest)) = queue.recv() else {
            break;
        };
        if cancel.is_cancelled() {
            break;
        }
        let span = tracing::debug_span!("job", worker, seq);
        let res = span.in_scope(|| run_job(&manifest, cfg));
        if results.send(res).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_and_sticky() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
        a.cancel();
        assert!(a.is_cancelled());
    }
}
