//! Device/host memory transfer seam.
//!
//! [`DeviceSynchronizer`] is the narrow interface backend tasks use to move
//! tensor bytes across the device boundary; both directions take a stream id
//! so the transfer is ordered against the kernels already issued on that
//! stream. Failures are normalized into [`Error::Device`] so callers can treat
//! copy failures uniformly.
//!
//! [`HostSynchronizer`] backs the CPU path with a plain allocation table and
//! doubles as the test realization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::op::DeviceAddress;
use crate::{Error, Result};

pub trait DeviceSynchronizer {
    /// Copy `address`'s bytes into `dst`, ordered after work already issued on
    /// `stream_id`. `dst.len()` must equal the allocation size.
    fn sync_device_to_host(
        &self,
        dst: &mut [u8],
        address: &DeviceAddress,
        stream_id: usize,
    ) -> Result<()>;

    /// Copy `src` into `address`'s bytes, ordered after work already issued on
    /// `stream_id`. `src.len()` must equal the allocation size.
    fn sync_host_to_device(
        &self,
        address: &DeviceAddress,
        src: &[u8],
        stream_id: usize,
    ) -> Result<()>;
}

/// Host-memory realization of [`DeviceSynchronizer`]. "Device" allocations are
/// entries in a table keyed by address id; transfers are memcpys.
pub struct HostSynchronizer {
    memory: Mutex<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
}

impl HostSynchronizer {
    pub fn new() -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a zero-filled region and return its address.
    pub fn alloc(&self, size_in_bytes: usize) -> DeviceAddress {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.memory
            .lock()
            .expect("synchronizer lock poisoned")
            .insert(id, vec![0u8; size_in_bytes]);
        DeviceAddress { id, size_in_bytes }
    }

    pub fn free(&self, address: &DeviceAddress) -> Result<()> {
        self.memory
            .lock()
            .expect("synchronizer lock poisoned")
            .remove(&address.id)
            .map(|_| ())
            .ok_or_else(|| Error::device(format!("free of unknown address {}", address.id)))
    }
}

impl Default for HostSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSynchronizer for HostSynchronizer {
    fn sync_device_to_host(
        &self,
        dst: &mut [u8],
        address: &DeviceAddress,
        _stream_id: usize,
    ) -> Result<()> {
        let memory = self.memory.lock().expect("synchronizer lock poisoned");
        let Some(bytes) = memory.get(&address.id) else {
            return Err(Error::device(format!(
                "device-to-host copy from unknown address {}",
                address.id
            )));
        };
        if dst.len() != bytes.len() {
            return Err(Error::device(format!(
                "device-to-host size mismatch: host buffer is {} bytes, allocation is {}",
                dst.len(),
                bytes.len()
            )));
        }
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn sync_host_to_device(
        &self,
        address: &DeviceAddress,
        src: &[u8],
        _stream_id: usize,
    ) -> Result<()> {
        let mut memory = self.memory.lock().expect("synchronizer lock poisoned");
        let Some(bytes) = memory.get_mut(&address.id) else {
            return Err(Error::device(format!(
                "host-to-device copy to unknown address {}",
                address.id
            )));
        };
        if src.len() != bytes.len() {
            return Err(Error::device(format!(
                "host-to-device size mismatch: host buffer is {} bytes, allocation is {}",
                src.len(),
                bytes.len()
            )));
        }
        bytes.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_device_memory() {
        let sync = HostSynchronizer::new();
        let address = sync.alloc(4);
        sync.sync_host_to_device(&address, &[1, 2, 3, 4], 0).unwrap();
        let mut out = [0u8; 4];
        sync.sync_device_to_host(&mut out, &address, 0).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        sync.free(&address).unwrap();
    }

    #[test]
    fn size_mismatch_is_a_device_error() {
        let sync = HostSynchronizer::new();
        let address = sync.alloc(4);
        let mut short = [0u8; 2];
        let err = sync.sync_device_to_host(&mut short, &address, 0).unwrap_err();
        assert!(matches!(err, Error::Device(_)));
    }
}
