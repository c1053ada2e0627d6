//! A fixed pool of worker threads with a shared FIFO task queue.
//!
//! Workers are numbered from 1; id 0 is whichever thread calls
//! [`wait_finish`](struct.WorkerPool.html#method.wait_finish) and helps drain
//! the queue. A worker is always in one of three states:
//!
//! - sleeping, while the pool is stopped or more workers are active than
//!   allowed;
//! - waiting for a task;
//! - executing one.
//!
//! One mutex guards the queue and the worker counters. Each distinct reason to
//! wait has its own condition variable.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// A unit of work, run once on some thread of the pool.
pub trait Task: Send {
    fn execute(self: Box<Self>, thread_id: usize);
}

impl<F: FnOnce(usize) + Send> Task for F {
    fn execute(self: Box<Self>, thread_id: usize) {
        (*self)(thread_id)
    }
}

struct Counters {
    queue: VecDeque<Box<dyn Task>>,
    /// Workers not sleeping.
    curr_active: usize,
    /// Workers waiting for a task.
    curr_waiting: usize,
    max_active: usize,
}

struct Shared {
    counters: Mutex<Counters>,
    running: AtomicBool,
    exit: AtomicBool,
    task_available: Condvar,
    thread_sleeping: Condvar,
    all_work_done: Condvar,
    all_stopped: Condvar,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn is_exited(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    fn worker_loop(&self, id: usize) {
        while !self.is_exited() {
            let task = {
                let mut c = self.counters.lock();
                // Every wakeup rechecks the active limit, so lowering it also
                // puts idle workers to sleep.
                loop {
                    if self.is_exited() {
                        break None;
                    }
                    if c.curr_active > c.max_active || !self.is_running() {
                        c.curr_active -= 1;
                        if c.curr_active == 0 {
                            self.all_stopped.notify_all();
                        }
                        self.thread_sleeping.wait(&mut c);
                        c.curr_active += 1;
                        continue;
                    }
                    if let Some(task) = c.queue.pop_front() {
                        break Some(task);
                    }
                    c.curr_waiting += 1;
                    if c.curr_waiting == c.max_active {
                        self.all_work_done.notify_all();
                    }
                    self.task_available.wait(&mut c);
                    c.curr_waiting -= 1;
                }
            };
            if let Some(task) = task {
                // A worker that unwinds would never be counted as stopped.
                if panic::catch_unwind(AssertUnwindSafe(|| task.execute(id))).is_err() {
                    log::error!("pool worker {} panicked in a task", id);
                    process::abort();
                }
            }
        }
        let mut c = self.counters.lock();
        c.curr_active -= 1;
        if c.curr_active == 0 {
            self.all_stopped.notify_all();
        }
    }
}

pub struct WorkerPool {
    name: String,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers, all sleeping. A worker that fails to spawn is
    /// logged and left out.
    pub fn new(name: &str, threads: usize) -> Self {
        let shared = Arc::new(Shared {
            counters: Mutex::new(Counters {
                queue: VecDeque::new(),
                curr_active: 0,
                curr_waiting: 0,
                max_active: 0,
            }),
            running: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            task_available: Condvar::new(),
            thread_sleeping: Condvar::new(),
            all_work_done: Condvar::new(),
            all_stopped: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let id = i + 1;
            {
                let mut c = shared.counters.lock();
                c.curr_active += 1;
                c.max_active += 1;
            }
            let worker = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-pool-{}", name, id))
                .spawn(move || worker.worker_loop(id));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    log::warn!("{}: spawning pool worker {} failed: {}", name, id, e);
                    let mut c = shared.counters.lock();
                    c.curr_active -= 1;
                    c.max_active -= 1;
                }
            }
        }

        let pool = WorkerPool {
            name: name.to_string(),
            shared,
            threads: handles,
        };
        pool.stop();
        log::debug!("{}: pool of {} workers ready", pool.name, pool.threads.len());
        pool
    }

    pub fn max_thread_num(&self) -> usize {
        self.threads.len()
    }

    pub fn max_active_thread_num(&self) -> usize {
        self.shared.counters.lock().max_active
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_exited(&self) -> bool {
        self.shared.is_exited()
    }

    /// Number of queued tasks not yet picked up.
    pub fn pending_tasks(&self) -> usize {
        self.shared.counters.lock().queue.len()
    }

    /// Limit how many workers may run at once, clamped to at least 1 and at
    /// most the pool size. 0 is ignored.
    pub fn set_max_active_thread_num(&self, num: usize) {
        let mut c = self.shared.counters.lock();
        let old = c.max_active;
        let max = self.threads.len();
        if num >= max {
            c.max_active = max;
        } else if num > 0 {
            c.max_active = num;
        } else {
            log::warn!("{}: ignoring a maximum of 0 active workers", self.name);
            return;
        }
        if c.max_active > old && self.is_running() {
            self.shared.thread_sleeping.notify_all();
        } else if c.max_active < old {
            self.shared.task_available.notify_all();
        }
    }

    /// Queue a task. Workers only pick it up once the pool is started.
    pub fn add_task<T: Task + 'static>(&self, task: T) {
        let mut c = self.shared.counters.lock();
        c.queue.push_back(Box::new(task));
        if self.is_running() && c.curr_waiting > 0 {
            self.shared.task_available.notify_one();
        }
    }

    /// Wake the workers.
    pub fn start(&self) {
        let _c = self.shared.counters.lock();
        self.shared.running.store(true, Ordering::Relaxed);
        self.shared.thread_sleeping.notify_all();
    }

    /// Put every worker to sleep, waiting until they all are.
    pub fn stop(&self) {
        let mut c = self.shared.counters.lock();
        self.shared.running.store(false, Ordering::Relaxed);
        self.shared.task_available.notify_all();
        while c.curr_active != 0 {
            self.shared.all_stopped.wait(&mut c);
        }
    }

    /// Wait until the queue is empty and every active worker is idle, then
    /// stop the pool. With `add_to_execute` the calling thread runs tasks too,
    /// as thread 0. Tasks still queued after the stop run on the caller.
    ///
    /// "Every active worker" means `max_active_thread_num` of them, so this
    /// only returns once that many workers are idle. Lowering the limit
    /// while the pool runs sends the extra workers to sleep first. A pool
    /// that lost workers it failed to spawn counts only those it has.
    pub fn wait_finish(&self, add_to_execute: bool) {
        if add_to_execute {
            while let Some(task) = self.pop_if_running() {
                task.execute(0);
            }
        }
        {
            let mut c = self.shared.counters.lock();
            while c.curr_waiting != c.max_active && self.is_running() && !self.is_exited() {
                self.shared.all_work_done.wait(&mut c);
            }
        }
        self.stop();
        self.drain_task_queue();
    }

    fn pop_if_running(&self) -> Option<Box<dyn Task>> {
        let mut c = self.shared.counters.lock();
        if self.is_running() && !self.is_exited() {
            c.queue.pop_front()
        } else {
            None
        }
    }

    /// Run whatever is queued on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the pool is running.
    pub fn drain_task_queue(&self) {
        if self.is_running() {
            panic!("{}: draining the task queue of a running pool", self.name);
        }
        loop {
            let task = self.shared.counters.lock().queue.pop_front();
            match task {
                Some(task) => task.execute(0),
                None => break,
            }
        }
    }

    /// Drop every queued task without running it.
    pub fn clear_all_tasks(&self) {
        self.shared.counters.lock().queue.clear();
    }

    /// Tell every worker to exit and release anyone waiting on the pool.
    pub fn exit(&self) {
        let _c = self.shared.counters.lock();
        self.shared.exit.store(true, Ordering::Relaxed);
        self.shared.task_available.notify_all();
        self.shared.thread_sleeping.notify_all();
        self.shared.all_work_done.notify_all();
        self.shared.all_stopped.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.exit();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("{}: a pool worker panicked", self.name);
            }
        }
        self.clear_all_tasks();
        log::debug!("{}: pool shut down", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use test_env_log::test;

    #[test]
    fn starts_stopped() {
        let pool = WorkerPool::new("test", 3);
        assert!(!pool.is_running());
        assert_eq!(pool.max_thread_num(), 3);
        assert_eq!(pool.max_active_thread_num(), 3);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pool.add_task(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(pool.pending_tasks(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // Stopped, so the caller runs it.
        pool.drain_task_queue();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn active_limit_is_clamped() {
        let pool = WorkerPool::new("test", 4);
        pool.set_max_active_thread_num(2);
        assert_eq!(pool.max_active_thread_num(), 2);
        pool.set_max_active_thread_num(0);
        assert_eq!(pool.max_active_thread_num(), 2);
        pool.set_max_active_thread_num(99);
        assert_eq!(pool.max_active_thread_num(), 4);
    }

    #[test]
    fn empty_pool_runs_on_caller() {
        let pool = WorkerPool::new("test", 0);
        let ids = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..5 {
            let ids = ids.clone();
            pool.add_task(move |id| ids.lock().push(id));
        }
        pool.start();
        pool.wait_finish(true);
        assert_eq!(*ids.lock(), vec![0; 5]);
        assert!(!pool.is_running());
    }
}
