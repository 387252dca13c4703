//! One pipeline stage: a bounded FIFO queue drained by a single dedicated
//! worker thread. Thread count is fixed per stage regardless of op volume, and
//! the bounded channel applies backpressure to the enqueuing thread instead of
//! buffering without limit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::future::{oneshot, Promise};
use crate::profiler::ProfilerAnalyzer;
use crate::task::DispatchTask;
use crate::{Error, Result};

enum QueueMessage {
    Task(DispatchTask),
    Flush(Promise<()>),
}

/// An ordered dispatch queue with its worker thread.
///
/// Tasks execute in strict FIFO enqueue order. A task failure is local: the
/// failure reaches that task's futures and the worker moves on to the next
/// task. `abort` flips the queue into teardown mode, where not-yet-executed
/// tasks take the `set_exception` path instead of running.
pub struct DispatchQueue {
    name: String,
    tx: Option<Sender<QueueMessage>>,
    aborted: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DispatchQueue {
    /// Spawn the stage worker. `capacity` bounds the queue depth; a full queue
    /// blocks the enqueuing thread until the worker catches up.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        profiler: Arc<ProfilerAnalyzer>,
    ) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = bounded(capacity);
        let aborted = Arc::new(AtomicBool::new(false));
        let worker = {
            let aborted = aborted.clone();
            let name = name.clone();
            thread::Builder::new()
                .name(format!("opstream-{name}"))
                .spawn(move || worker_loop(&name, rx, &profiler, &aborted))
                .map_err(|e| Error::msg(format!("spawning worker thread: {e}")))?
        };
        Ok(Self {
            name,
            tx: Some(tx),
            aborted,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a task. Blocks only when the queue is at capacity. After
    /// `abort` or drop the task is poisoned instead of accepted.
    pub fn enqueue(&self, task: impl Into<DispatchTask>) -> Result<()> {
        let task = task.into();
        if self.aborted.load(Ordering::Acquire) {
            task.set_exception(Error::QueueClosed(self.name.clone()));
            return Err(Error::QueueClosed(self.name.clone()));
        }
        let Some(tx) = &self.tx else {
            task.set_exception(Error::QueueClosed(self.name.clone()));
            return Err(Error::QueueClosed(self.name.clone()));
        };
        if let Err(send_err) = tx.send(QueueMessage::Task(task)) {
            if let QueueMessage::Task(task) = send_err.into_inner() {
                task.set_exception(Error::QueueClosed(self.name.clone()));
            }
            return Err(Error::QueueClosed(self.name.clone()));
        }
        Ok(())
    }

    /// Block until every task enqueued before this call has executed.
    pub fn flush(&self) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(Error::QueueClosed(self.name.clone()));
        };
        let (promise, future) = oneshot();
        tx.send(QueueMessage::Flush(promise))
            .map_err(|_| Error::QueueClosed(self.name.clone()))?;
        future.wait()
    }

    /// Switch into teardown mode: tasks not yet dequeued, and all future
    /// enqueues, take the exception path.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain whatever is queued (or
        // poison it, if aborted) and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("dispatch queue '{}' worker terminated abnormally", self.name);
            }
        }
    }
}

fn worker_loop(
    name: &str,
    rx: Receiver<QueueMessage>,
    profiler: &ProfilerAnalyzer,
    aborted: &AtomicBool,
) {
    while let Ok(message) = rx.recv() {
        match message {
            QueueMessage::Flush(promise) => promise.set_value(()),
            QueueMessage::Task(task) => {
                if aborted.load(Ordering::Acquire) {
                    task.set_exception(Error::QueueClosed(name.to_string()));
                    continue;
                }
                let kind = task.kind();
                // A panicking task must not take the worker down with it.
                // Promises the panic drops surface as disconnect errors on
                // the caller side, so nothing hangs.
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task.run(profiler))) {
                    log::error!(
                        "{kind} task on queue '{name}' panicked: {}",
                        panic_message(&panic)
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::stub_output;
    use crate::op::{AbstractValue, BackendKind, DTypeKind, OpRunInfo};
    use crate::task::FrontendTask;

    fn frontend(
        queue_value: u32,
        log: Arc<std::sync::Mutex<Vec<u32>>>,
    ) -> (FrontendTask, crate::future::ValueFuture<AbstractValue>) {
        let (stub, future) = stub_output();
        let info = OpRunInfo::new("Test", BackendKind::Cpu, vec![], stub);
        let task = FrontendTask::new(info, move |_| {
            log.lock().unwrap().push(queue_value);
            Ok(AbstractValue::new(vec![1], DTypeKind::F32))
        });
        (task, future)
    }

    #[test]
    fn flush_waits_for_prior_tasks() {
        let queue = DispatchQueue::new(
            "flush-test",
            16,
            Arc::new(ProfilerAnalyzer::disabled()),
        )
        .unwrap();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..8 {
            let (task, _future) = frontend(i, log.clone());
            queue.enqueue(task).unwrap();
        }
        queue.flush().unwrap();
        assert_eq!(log.lock().unwrap().len(), 8);
    }

    #[test]
    fn abort_poisons_pending_enqueue() {
        let queue = DispatchQueue::new(
            "abort-test",
            16,
            Arc::new(ProfilerAnalyzer::disabled()),
        )
        .unwrap();
        queue.abort();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (task, future) = frontend(0, log.clone());
        assert!(queue.enqueue(task).is_err());
        assert!(future.wait().is_err());
        assert!(log.lock().unwrap().is_empty());
    }
}
