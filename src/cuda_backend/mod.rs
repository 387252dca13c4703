//! CUDA realizations of the device seams, over `cudarc`.
//!
//! A [`CudaDeviceContext`] owns the driver context and a small pool of
//! streams; backend task stream ids index into the pool. Events and the
//! synchronizer normalize every driver failure into
//! [`Error::Device`](crate::Error::Device).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaContext, CudaEvent, CudaSlice, CudaStream};

use crate::event::DeviceEvent;
use crate::op::DeviceAddress;
use crate::sync::DeviceSynchronizer;
use crate::{Error, Result};

pub(crate) mod error;

use error::WrapErr;

const STREAM_POOL_SIZE: usize = 8;

/// Driver context plus a fixed stream pool shared by events and the
/// synchronizer.
#[derive(Clone)]
pub struct CudaDeviceContext {
    context: Arc<CudaContext>,
    streams: Arc<Vec<Arc<CudaStream>>>,
}

impl CudaDeviceContext {
    pub fn new(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal).w()?;
        let mut pool = Vec::with_capacity(STREAM_POOL_SIZE);
        for _ in 0..STREAM_POOL_SIZE {
            pool.push(context.new_stream().w()?);
        }
        Ok(Self {
            context,
            streams: Arc::new(pool),
        })
    }

    pub fn stream(&self, stream_id: usize) -> &Arc<CudaStream> {
        &self.streams[stream_id % self.streams.len()]
    }

    pub fn new_event(&self) -> Result<CudaDeviceEvent> {
        Ok(CudaDeviceEvent {
            context: self.context.clone(),
            event: None,
            needs_wait: false,
        })
    }
}

/// CUDA realization of [`DeviceEvent`]. The driver event is created lazily on
/// each record, matching the driver's one-shot event lifecycle.
pub struct CudaDeviceEvent {
    context: Arc<CudaContext>,
    event: Option<CudaEvent>,
    needs_wait: bool,
}

impl DeviceEvent for CudaDeviceEvent {
    type Stream = Arc<CudaStream>;

    fn record(&mut self, stream: &Arc<CudaStream>) -> Result<()> {
        if self.needs_wait {
            return Err(Error::device(
                "event already has an outstanding record; wait for it first",
            ));
        }
        let event = self.context.new_event(None).w()?;
        event.record(stream).w()?;
        self.event = Some(event);
        self.needs_wait = true;
        Ok(())
    }

    fn wait(&mut self, stream: &Arc<CudaStream>) -> Result<()> {
        let Some(event) = &self.event else {
            return Err(Error::device("event wait issued without a prior record"));
        };
        stream.wait(event).w()?;
        self.needs_wait = false;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let Some(event) = &self.event else {
            return Err(Error::device("event sync issued without a prior record"));
        };
        event.synchronize().w()
    }

    fn query(&self) -> Result<bool> {
        // The driver wrapper exposes no non-blocking event poll.
        Err(Error::device(
            "event query is not exposed by the cuda driver wrapper",
        ))
    }

    fn elapsed_time(&self, other: &Self) -> Result<f32> {
        match (&self.event, &other.event) {
            (Some(start), Some(end)) => end.elapsed_ms(start).w(),
            _ => Err(Error::device(
                "elapsed time requires both events to have been recorded",
            )),
        }
    }

    fn needs_wait(&self) -> bool {
        self.needs_wait
    }
}

/// CUDA realization of [`DeviceSynchronizer`]. Allocations live in a table
/// keyed by address id, each backed by a device slice.
pub struct CudaSynchronizer {
    device: CudaDeviceContext,
    memory: Mutex<HashMap<u64, CudaSlice<u8>>>,
    next_id: AtomicU64,
}

impl CudaSynchronizer {
    pub fn new(device: CudaDeviceContext) -> Self {
        Self {
            device,
            memory: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, size_in_bytes: usize, stream_id: usize) -> Result<DeviceAddress> {
        let stream = self.device.stream(stream_id);
        let slice = stream.alloc_zeros::<u8>(size_in_bytes).w()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.memory
            .lock()
            .expect("cuda synchronizer lock poisoned")
            .insert(id, slice);
        Ok(DeviceAddress { id, size_in_bytes })
    }

    pub fn free(&self, address: &DeviceAddress) -> Result<()> {
        self.memory
            .lock()
            .expect("cuda synchronizer lock poisoned")
            .remove(&address.id)
            .map(|_| ())
            .ok_or_else(|| Error::device(format!("free of unknown address {}", address.id)))
    }
}

impl DeviceSynchronizer for CudaSynchronizer {
    fn sync_device_to_host(
        &self,
        dst: &mut [u8],
        address: &DeviceAddress,
        stream_id: usize,
    ) -> Result<()> {
        let memory = self.memory.lock().expect("cuda synchronizer lock poisoned");
        let Some(slice) = memory.get(&address.id) else {
            return Err(Error::device(format!(
                "device-to-host copy from unknown address {}",
                address.id
            )));
        };
        if dst.len() != address.size_in_bytes {
            return Err(Error::device(format!(
                "device-to-host size mismatch: host buffer is {} bytes, allocation is {}",
                dst.len(),
                address.size_in_bytes
            )));
        }
        let stream = self.device.stream(stream_id);
        let data = stream.memcpy_dtov(slice).w()?;
        dst.copy_from_slice(&data);
        Ok(())
    }

    fn sync_host_to_device(
        &self,
        address: &DeviceAddress,
        src: &[u8],
        stream_id: usize,
    ) -> Result<()> {
        let mut memory = self.memory.lock().expect("cuda synchronizer lock poisoned");
        let Some(slice) = memory.get_mut(&address.id) else {
            return Err(Error::device(format!(
                "host-to-device copy to unknown address {}",
                address.id
            )));
        };
        if src.len() != address.size_in_bytes {
            return Err(Error::device(format!(
                "host-to-device size mismatch: host buffer is {} bytes, allocation is {}",
                src.len(),
                address.size_in_bytes
            )));
        }
        let stream = self.device.stream(stream_id);
        stream.memcpy_htod(src, slice).w()?;
        Ok(())
    }
}
