//! The master job queue and worker pool.
//!
//! Units of work are database records (bucket, tessellation and photon
//! jobs) dispatched through the registry's `exec_job` callbacks.
//! Workers pull from a shared channel until it drains; an abort flag is
//! polled between jobs.

use crossbeam_channel::unbounded;
use ember_db::{Database, Tag};
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Detected worker count, overridable through the engine config.
pub fn detect_threads(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Runs every job to completion over `threads` workers. `worker_fn`
/// executes one job; it is shared by all workers.
pub fn run_jobs<F>(db: &Arc<Database>, jobs: Vec<Tag>, threads: usize, abort: &AtomicBool, worker_fn: F)
where
    F: Fn(&Database, Tag) + Send + Sync,
{
    let num_jobs = jobs.len();
    if num_jobs == 0 {
        return;
    }
    let threads = threads.max(1).min(num_jobs);
    if threads == 1 {
        for tag in jobs {
            if abort.load(Ordering::Relaxed) {
                info!("job queue aborted, {} jobs dropped", num_jobs);
                return;
            }
            worker_fn(db, tag);
        }
        return;
    }
    let (tx, rx) = unbounded::<Tag>();
    for tag in jobs {
        if tx.send(tag).is_err() {
            error!("job queue closed early");
            return;
        }
    }
    drop(tx);
    std::thread::scope(|scope| {
        for _ in 0..threads {
            let rx = rx.clone();
            let worker_fn = &worker_fn;
            let db = db.clone();
            scope.spawn(move || {
                while let Ok(tag) = rx.recv() {
                    if abort.load(Ordering::Relaxed) {
                        return;
                    }
                    worker_fn(&db, tag);
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_db::{Blob, DbFlags};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn all_jobs_execute_once() {
        let db = Arc::new(Database::open_in_temp(0).unwrap());
        let jobs: Vec<Tag> = (0..64)
            .map(|i| db.create(Blob(vec![i as u8]), DbFlags::empty()))
            .collect();
        let counter = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        run_jobs(&db, jobs, 4, &abort, |_db, _tag| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn abort_stops_single_threaded_queue() {
        let db = Arc::new(Database::open_in_temp(0).unwrap());
        let jobs: Vec<Tag> = (0..8)
            .map(|i| db.create(Blob(vec![i as u8]), DbFlags::empty()))
            .collect();
        let abort = AtomicBool::new(true);
        let counter = AtomicUsize::new(0);
        run_jobs(&db, jobs, 1, &abort, |_db, _tag| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
