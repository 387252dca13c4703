//! Device event primitives used by backend tasks to order asynchronous kernel
//! launches without blocking the dispatcher thread.
//!
//! An event is recorded on one stream and waited on by another; the preferred
//! path is stream-to-stream waiting ([`DeviceEvent::wait`]), which blocks the
//! waiting stream rather than the host. [`DeviceEvent::sync`] is the rare
//! host-blocking variant. One event tracks one outstanding record at a time:
//! `record` on an event that still needs a wait is an error.
//!
//! The host realization runs each "stream" as a FIFO executor thread, which
//! gives the same ordering semantics as a device stream and lets the whole
//! event lifecycle be exercised without a GPU.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{Error, Result};

/// Record/wait/query/elapsed-time primitive over a device stream.
///
/// Implementations normalize device-call failures into [`Error::Device`]
/// (uniform with the synchronizer contract).
pub trait DeviceEvent {
    type Stream;

    /// Mark "work up to this point" on `stream`. Transitions Idle → Recorded.
    fn record(&mut self, stream: &Self::Stream) -> Result<()>;

    /// Make `stream` wait for the recorded point, then reset to Idle. The
    /// host does not block. Fails if no record was issued.
    fn wait(&mut self, stream: &Self::Stream) -> Result<()>;

    /// Host-blocking wait until the recorded point is reached.
    fn sync(&self) -> Result<()>;

    /// Non-blocking poll: has the recorded point been reached?
    fn query(&self) -> Result<bool>;

    /// Device-reported milliseconds between this event's completion and
    /// `other`'s. Both must have fired on the same physical timeline.
    fn elapsed_time(&self, other: &Self) -> Result<f32>;

    /// Whether a recorded point is still outstanding (recorded, not waited).
    fn needs_wait(&self) -> bool;
}

enum StreamCommand {
    Exec(Box<dyn FnOnce() + Send>),
}

/// A host-side stand-in for a device stream: a FIFO executor thread. Work
/// submitted to it runs in submission order, one item at a time.
pub struct HostStream {
    id: usize,
    tx: Option<Sender<StreamCommand>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl HostStream {
    pub fn new(id: usize) -> Result<Self> {
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name(format!("opstream-stream-{id}"))
            .spawn(move || stream_loop(rx))
            .map_err(|e| Error::device(format!("spawning stream thread: {e}")))?;
        Ok(Self {
            id,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Append work to the stream. Returns an error once the stream is torn
    /// down.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(Error::device(format!("stream {} is shut down", self.id)));
        };
        tx.send(StreamCommand::Exec(Box::new(work)))
            .map_err(|_| Error::device(format!("stream {} is shut down", self.id)))
    }

    /// Host-blocking drain: returns once everything submitted so far ran.
    pub fn synchronize(&self) -> Result<()> {
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let done2 = done.clone();
        self.submit(move || {
            let (lock, cvar) = &*done2;
            *lock.lock().expect("stream sync lock poisoned") = true;
            cvar.notify_all();
        })?;
        let (lock, cvar) = &*done;
        let mut finished = lock.lock().expect("stream sync lock poisoned");
        while !*finished {
            finished = cvar.wait(finished).expect("stream sync lock poisoned");
        }
        Ok(())
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn stream_loop(rx: Receiver<StreamCommand>) {
    while let Ok(StreamCommand::Exec(work)) = rx.recv() {
        work();
    }
}

#[derive(Default)]
struct HostEventState {
    fired: bool,
    fired_at: Option<Instant>,
}

/// Host realization of [`DeviceEvent`] over a [`HostStream`].
pub struct HostEvent {
    state: Arc<(Mutex<HostEventState>, Condvar)>,
    recorded: bool,
    needs_wait: bool,
}

impl HostEvent {
    pub fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(HostEventState::default()), Condvar::new())),
            recorded: false,
            needs_wait: false,
        }
    }
}

impl Default for HostEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEvent for HostEvent {
    type Stream = HostStream;

    fn record(&mut self, stream: &HostStream) -> Result<()> {
        if self.needs_wait {
            return Err(Error::device(
                "event already has an outstanding record; wait for it first",
            ));
        }
        {
            let (lock, _) = &*self.state;
            let mut state = lock.lock().expect("event lock poisoned");
            state.fired = false;
            state.fired_at = None;
        }
        let shared = self.state.clone();
        stream.submit(move || {
            let (lock, cvar) = &*shared;
            let mut state = lock.lock().expect("event lock poisoned");
            state.fired = true;
            state.fired_at = Some(Instant::now());
            cvar.notify_all();
        })?;
        self.recorded = true;
        self.needs_wait = true;
        Ok(())
    }

    fn wait(&mut self, stream: &HostStream) -> Result<()> {
        if !self.recorded {
            return Err(Error::device("event wait issued without a prior record"));
        }
        let shared = self.state.clone();
        stream.submit(move || {
            let (lock, cvar) = &*shared;
            let mut state = lock.lock().expect("event lock poisoned");
            while !state.fired {
                state = cvar.wait(state).expect("event lock poisoned");
            }
        })?;
        self.needs_wait = false;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if !self.recorded {
            return Err(Error::device("event sync issued without a prior record"));
        }
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().expect("event lock poisoned");
        while !state.fired {
            state = cvar.wait(state).expect("event lock poisoned");
        }
        Ok(())
    }

    fn query(&self) -> Result<bool> {
        let (lock, _) = &*self.state;
        let state = lock.lock().expect("event lock poisoned");
        Ok(state.fired)
    }

    fn elapsed_time(&self, other: &Self) -> Result<f32> {
        let mine = {
            let (lock, _) = &*self.state;
            lock.lock().expect("event lock poisoned").fired_at
        };
        let theirs = {
            let (lock, _) = &*other.state;
            lock.lock().expect("event lock poisoned").fired_at
        };
        match (mine, theirs) {
            (Some(start), Some(end)) => {
                let delta = if end >= start {
                    end.duration_since(start)
                } else {
                    start.duration_since(end)
                };
                Ok(delta.as_secs_f32() * 1000.0)
            }
            _ => Err(Error::device(
                "elapsed time requires both events to have fired",
            )),
        }
    }

    fn needs_wait(&self) -> bool {
        self.needs_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_runs_in_fifo_order() {
        let stream = HostStream::new(0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            stream.submit(move || log.lock().unwrap().push(i)).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn record_twice_without_wait_is_rejected() {
        let stream = HostStream::new(0).unwrap();
        let mut event = HostEvent::new();
        event.record(&stream).unwrap();
        assert!(event.record(&stream).is_err());
    }
}
