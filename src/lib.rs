//! Opstream is an asynchronous op-dispatch pipeline for eager ("pynative")
//! tensor execution.
//!
//! Issuing an op returns immediately with future-backed handles while the work
//! flows through two serialized stages: a frontend stage for shape/type
//! inference and a backend stage for device kernel dispatch. Each stage runs
//! on its own worker thread behind a bounded queue, so ops overlap across
//! stages while keeping program order within each stage, and a full queue
//! applies backpressure to the issuing thread instead of buffering without
//! limit.
//!
//! Every handle resolves exactly once: a task either runs to completion or has
//! its failure transported into the caller-visible futures, so no caller is
//! left waiting forever. Dispatch timing can be recorded by the built-in
//! profiler ([`ProfilerAnalyzer`]), controlled through `OPSTREAM_PROFILE`.
//!
//! ## A quick guide
//! - Create a [`PynativePipeline`] with a [`ProfilerAnalyzer`] and
//!   [`PipelineOptions`].
//! - Issue ops with [`PynativePipeline::run_op`]: the frontend closure infers
//!   the output [`AbstractValue`], the backend closure launches kernels and
//!   resolves the op's device-sync promises.
//! - Block on the returned [`OpHandles`], or drain everything with
//!   [`PynativePipeline::wait_all`].
//!
//! ```
//! use std::sync::Arc;
//! use opstream::{
//!     AbstractValue, BackendKind, DTypeKind, OpRequest, PipelineOptions,
//!     ProfilerAnalyzer, PynativePipeline,
//! };
//!
//! let profiler = Arc::new(ProfilerAnalyzer::disabled());
//! let pipeline = PynativePipeline::new(profiler, PipelineOptions::default()).unwrap();
//!
//! let handles = pipeline
//!     .run_op(
//!         OpRequest {
//!             op_name: "Add".to_string(),
//!             backend: BackendKind::Cpu,
//!             inputs: vec![AbstractValue::new(vec![2, 3], DTypeKind::F32)],
//!             stream_id: 0,
//!             device_outputs: 0,
//!         },
//!         |info| Ok(info.inputs[0].clone()),
//!         |_info, _backend_info| Ok(()),
//!     )
//!     .unwrap();
//!
//! let out = handles.output.wait().unwrap();
//! assert_eq!(out.shape, vec![2, 3]);
//! pipeline.wait_all().unwrap();
//! ```

#[cfg(feature = "cuda")]
mod cuda_backend;
mod error;
mod event;
mod future;
mod kernel;
mod op;
mod pipeline;
mod profiler;
mod queue;
mod sync;
mod task;

#[cfg(feature = "cuda")]
pub use cuda_backend::{CudaDeviceContext, CudaDeviceEvent, CudaSynchronizer};
pub use error::{Context, Error, Result};
pub use event::{DeviceEvent, HostEvent, HostStream};
pub use future::{
    device_sync, oneshot, stub_output, DeviceAddressFuture, DeviceAddressPromise, Promise,
    StubOutput, ValueFuture,
};
pub use kernel::KernelExecutor;
pub use op::{
    AbstractValue, BackendKind, BackendOpRunInfo, DTypeKind, DeviceAddress, KernelTaskType,
    OpRunInfo, TensorHandle,
};
pub use pipeline::{OpHandles, OpRequest, PipelineOptions, PynativePipeline};
pub use profiler::{
    FsSink, NullSink, ProfilerAnalyzer, ProfilerConfig, ProfilerData, ProfilerEvent,
    ProfilerModule, ProfilerRecorder, ProfilerSink, ProfilerStage, ProfilerStageRecorder,
    ProfilerStatisticsInfo, NO_NAME,
};
pub use queue::DispatchQueue;
pub use sync::{DeviceSynchronizer, HostSynchronizer};
pub use task::{
    AllocViewMemBackendTask, BackendTask, ContiguousBackendTask, DispatchTask, FrontendTask,
    ViewKernelBackendTask,
};
