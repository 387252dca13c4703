//! Promise/future pairs shared between the issuing thread and the stage
//! workers. The worker side must complete each promise with exactly one of
//! {value, exception} before the owning task is destroyed; the issuing side
//! blocks or polls on the future half.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::sync::Mutex;

use crate::op::{AbstractValue, DeviceAddress};
use crate::{Error, Result};

/// Create a connected promise/future pair.
pub fn oneshot<T>() -> (Promise<T>, ValueFuture<T>) {
    let (tx, rx) = bounded(1);
    (Promise { tx }, ValueFuture { rx })
}

/// The worker-held half. Consumed on completion, so a promise is structurally
/// completed at most once. Dropping an unfulfilled promise surfaces as
/// [`Error::Disconnected`] on the future side, which keeps a panicking task
/// from leaving its caller hanging forever.
pub struct Promise<T> {
    tx: Sender<Result<T>>,
}

impl<T> Promise<T> {
    pub fn set_value(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn set_exception(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }

    pub fn complete(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }
}

/// The caller-held half of a [`Promise`].
pub struct ValueFuture<T> {
    rx: Receiver<Result<T>>,
}

impl<T> ValueFuture<T> {
    /// Block until the producing task completes, then return its result.
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected(
                "producing task dropped before completion".to_string(),
            )),
        }
    }

    /// Non-blocking poll: `Ok(Some(..))` once the result arrived, `Ok(None)`
    /// while still pending.
    pub fn try_wait(&self) -> Result<Option<Result<T>>> {
        match self.rx.try_recv() {
            Ok(result) => Ok(Some(result)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected(
                "producing task dropped before completion".to_string(),
            )),
        }
    }
}

/// Promise for a device-resident output tensor's readiness. An op may hold
/// several, one per device output; each must be resolved individually,
/// including on failure.
pub type DeviceAddressPromise = Promise<DeviceAddress>;
/// Future for one device-resident output.
pub type DeviceAddressFuture = ValueFuture<DeviceAddress>;

/// Create a device-sync promise/future pair.
pub fn device_sync() -> (DeviceAddressPromise, DeviceAddressFuture) {
    oneshot()
}

/// The op's caller-visible output handle, stored inside the `OpRunInfo` that
/// travels with the task. Unlike [`Promise`] it is completed through a shared
/// reference because both the op closure (value path) and the task's exception
/// path reach it; the first completion wins and later ones report `false`.
pub struct StubOutput {
    tx: Mutex<Option<Sender<Result<AbstractValue>>>>,
}

/// Create a stub-output/future pair for one logical op. The stub is shared:
/// the frontend and backend payloads of one op reference the same handle.
pub fn stub_output() -> (std::sync::Arc<StubOutput>, ValueFuture<AbstractValue>) {
    let (tx, rx) = bounded(1);
    (
        std::sync::Arc::new(StubOutput {
            tx: Mutex::new(Some(tx)),
        }),
        ValueFuture { rx },
    )
}

impl StubOutput {
    /// Resolve with the inferred output value. Returns whether this call
    /// completed the stub.
    pub fn set_value(&self, value: AbstractValue) -> bool {
        self.complete(Ok(value))
    }

    /// Poison the stub with the failure of its producing op. Returns whether
    /// this call completed the stub.
    pub fn set_exception(&self, err: Error) -> bool {
        self.complete(Err(err))
    }

    pub fn is_completed(&self) -> bool {
        self.tx.lock().expect("stub output lock poisoned").is_none()
    }

    fn complete(&self, result: Result<AbstractValue>) -> bool {
        let tx = self.tx.lock().expect("stub output lock poisoned").take();
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::DTypeKind;

    #[test]
    fn promise_resolves_future() {
        let (p, f) = oneshot::<u32>();
        p.set_value(7);
        assert_eq!(f.wait().unwrap(), 7);
    }

    #[test]
    fn dropped_promise_disconnects() {
        let (p, f) = oneshot::<u32>();
        drop(p);
        assert!(matches!(f.wait(), Err(Error::Disconnected(_))));
    }

    #[test]
    fn stub_output_completes_once() {
        let (stub, f) = stub_output();
        assert!(stub.set_value(AbstractValue::new(vec![2, 2], DTypeKind::F32)));
        assert!(!stub.set_exception(Error::msg("late")));
        assert!(stub.is_completed());
        let value = f.wait().unwrap();
        assert_eq!(value.shape, vec![2, 2]);
    }
}
