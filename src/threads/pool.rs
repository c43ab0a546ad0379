use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use super::sem::Semaphore;
use super::{disable_async_cancel, disable_cancel, enable_async_cancel, enable_cancel};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    sem: Semaphore,
    queue: Mutex<VecDeque<Job>>,
}

/// A FIFO job queue drained by cooperating worker threads.
///
/// Submission posts one semaphore token per job; a worker's [`work`] takes
/// one token and runs one job. At rest the token count equals the queue
/// length. Jobs submitted from one thread run in submission order;
/// between submitters only the token handout orders anything.
///
/// Workers usually come from a [`ThreadGroup`] with an entry looping on
/// [`work`]: the wait is the one span with cancellation enabled, so
/// cancelling the group stops idle workers without ever interrupting a
/// running job.
///
/// [`work`]: ThreadPool::work
/// [`ThreadGroup`]: crate::threads::ThreadGroup
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// An empty pool. Workers are attached by handing clones of the pool
    /// to threads that call [`work`].
    ///
    /// [`work`]: ThreadPool::work
    pub fn new() -> io::Result<ThreadPool> {
        Ok(ThreadPool {
            shared: Arc::new(PoolShared {
                sem: Semaphore::new(0)?,
                queue: Mutex::new(VecDeque::new()),
            }),
        })
    }

    /// Queue a job and release one worker.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue.lock().unwrap().push_back(Box::new(job));
        self.shared.sem.post();
    }

    /// Queue a batch of jobs under one lock acquisition.
    pub fn submit_all<I, F>(&self, jobs: I)
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        let mut count = 0;
        {
            let mut queue = self.shared.queue.lock().unwrap();
            for job in jobs {
                queue.push_back(Box::new(job));
                count += 1;
            }
        }
        for _ in 0..count {
            self.shared.sem.post();
        }
    }

    /// Block until a job is available, then run it.
    ///
    /// Cancellation is enabled only across the semaphore wait and
    /// re-enabled (asynchronous) after the job finishes; the job itself
    /// always runs to completion.
    pub fn work(&self) {
        disable_async_cancel();
        enable_cancel();
        self.shared.sem.wait();
        disable_cancel();
        self.try_work();
        enable_cancel();
        enable_async_cancel();
    }

    /// Run one queued job if there is one, without blocking.
    pub fn try_work(&self) {
        let job = {
            let mut queue = self.shared.queue.lock().unwrap();
            let job = queue.pop_front();
            if queue.len() < queue.capacity() / 4 {
                let target = queue.len() * 2;
                queue.shrink_to(target);
            }
            job
        };
        // Run outside the lock so jobs may submit more work.
        if let Some(job) = job {
            job();
        }
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Returns `true` when no jobs are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The semaphore's token count; equals [`len`] while no submission or
    /// consumption is in flight.
    ///
    /// [`len`]: ThreadPool::len
    pub fn tokens(&self) -> i32 {
        self.shared.sem.value()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ThreadPool")
            .field("queued", &self.len())
            .finish()
    }
}
