//! Payload types describing one logical op invocation. The pipeline treats
//! these as opaque cargo: it moves them into tasks, hands them to the closures
//! that know what to do with them, and releases them as soon as the task has
//! run so device-memory-backing tensors are not retained past their logical
//! lifetime.

use std::fmt;
use std::sync::Arc;

use crate::future::{DeviceAddressPromise, StubOutput};

/// Element type of a tensor, as far as shape/type inference cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DTypeKind {
    F32,
    F64,
    I32,
    I64,
    U8,
    Bool,
}

impl DTypeKind {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::U8 | Self::Bool => 1,
        }
    }
}

/// Target backend for an op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Cpu,
    #[cfg(feature = "cuda")]
    Cuda(usize),
}

/// Result of frontend shape/type inference for one op output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbstractValue {
    pub shape: Vec<usize>,
    pub dtype: DTypeKind,
}

impl AbstractValue {
    pub fn new(shape: Vec<usize>, dtype: DTypeKind) -> Self {
        Self { shape, dtype }
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.elem_count() * self.dtype.size_in_bytes()
    }
}

/// Opaque handle to device-resident memory produced by a backend task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAddress {
    pub id: u64,
    pub size_in_bytes: usize,
}

/// Lightweight handle to an existing tensor, used by view-memory and
/// contiguous tasks that operate on an input's storage rather than producing
/// a fresh op output.
#[derive(Clone, Debug)]
pub struct TensorHandle {
    pub id: u64,
    pub shape: Vec<usize>,
    pub dtype: DTypeKind,
}

/// Everything the frontend stage needs for one logical op: the inputs, the
/// target backend and the caller-visible output stub. Owned exclusively by the
/// task that wraps it; moved (never copied) into the task at construction and
/// released right after the task runs.
pub struct OpRunInfo {
    pub op_name: String,
    pub backend: BackendKind,
    pub inputs: Vec<AbstractValue>,
    pub stub_output: Arc<StubOutput>,
}

impl OpRunInfo {
    pub fn new(
        op_name: impl Into<String>,
        backend: BackendKind,
        inputs: Vec<AbstractValue>,
        stub_output: Arc<StubOutput>,
    ) -> Self {
        Self {
            op_name: op_name.into(),
            backend,
            inputs,
            stub_output,
        }
    }
}

impl fmt::Debug for OpRunInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRunInfo")
            .field("op_name", &self.op_name)
            .field("backend", &self.backend)
            .field("inputs", &self.inputs.len())
            .field("stub_completed", &self.stub_output.is_completed())
            .finish()
    }
}

/// Backend-stage companion of [`OpRunInfo`]: the stream the kernels go to and
/// one device-sync promise per device-resident output.
pub struct BackendOpRunInfo {
    pub stream_id: usize,
    pub device_sync_promises: Vec<DeviceAddressPromise>,
}

impl BackendOpRunInfo {
    pub fn new(stream_id: usize, device_sync_promises: Vec<DeviceAddressPromise>) -> Self {
        Self {
            stream_id,
            device_sync_promises,
        }
    }
}

/// Kind of a view-related backend kernel task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelTaskType {
    Contiguous,
    Copy,
}
