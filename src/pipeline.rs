//! The two-stage pynative execution pipeline.
//!
//! The frontend stage runs shape/type inference and book-keeping; the backend
//! stage launches device kernels. Each stage serializes internally (FIFO), so
//! operations issued against one pipeline keep program order, while the two
//! stages overlap across operations. Backend work for an op is enqueued by the
//! frontend worker only after the op's frontend stage succeeded, so a frontend
//! failure cancels the op's backend work by poisoning its futures instead of
//! executing it.

use std::sync::Arc;

use crate::future::{
    device_sync, stub_output, DeviceAddressFuture, Promise, ValueFuture,
};
use crate::op::{
    AbstractValue, BackendKind, BackendOpRunInfo, KernelTaskType, OpRunInfo, TensorHandle,
};
use crate::profiler::{ProfilerAnalyzer, ProfilerStage, ProfilerStageRecorder};
use crate::queue::DispatchQueue;
use crate::task::{
    AllocViewMemBackendTask, BackendTask, ContiguousBackendTask, DispatchTask, FrontendTask,
    ViewKernelBackendTask,
};
use crate::{Error, Result};

/// Pipeline construction options.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Depth bound of each stage queue. A full queue blocks the issuing
    /// thread (backpressure) instead of buffering without limit.
    pub queue_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Everything needed to issue one op through both stages.
pub struct OpRequest {
    pub op_name: String,
    pub backend: BackendKind,
    pub inputs: Vec<AbstractValue>,
    pub stream_id: usize,
    /// Number of device-resident outputs; one device-sync future is created
    /// per output.
    pub device_outputs: usize,
}

/// Caller-side handles for an issued op.
pub struct OpHandles {
    /// Resolves with the frontend inference result, or the op's failure.
    pub output: ValueFuture<AbstractValue>,
    /// One per device-resident output; each resolves independently, including
    /// on failure.
    pub device_outputs: Vec<DeviceAddressFuture>,
}

pub struct PynativePipeline {
    frontend: DispatchQueue,
    backend: Arc<DispatchQueue>,
    profiler: Arc<ProfilerAnalyzer>,
}

impl PynativePipeline {
    pub fn new(profiler: Arc<ProfilerAnalyzer>, options: PipelineOptions) -> Result<Self> {
        let frontend =
            DispatchQueue::new("frontend", options.queue_capacity, profiler.clone())?;
        let backend = Arc::new(DispatchQueue::new(
            "backend",
            options.queue_capacity,
            profiler.clone(),
        )?);
        Ok(Self {
            frontend,
            backend,
            profiler,
        })
    }

    pub fn profiler(&self) -> &Arc<ProfilerAnalyzer> {
        &self.profiler
    }

    /// Issue one logical op through both stages.
    ///
    /// The frontend closure runs first; on success its value resolves the
    /// op's output stub and the backend task is enqueued (enqueue after
    /// completion, preserving per-pipeline program order). On failure the
    /// backend task is never enqueued and every device-sync future observes
    /// the same failure.
    pub fn run_op<F, B>(&self, request: OpRequest, frontend_fn: F, backend_fn: B) -> Result<OpHandles>
    where
        F: FnOnce(&mut OpRunInfo) -> Result<AbstractValue> + Send + 'static,
        B: FnOnce(&mut OpRunInfo, &mut BackendOpRunInfo) -> Result<()> + Send + 'static,
    {
        let (stub, output) = stub_output();
        let mut promises = Vec::with_capacity(request.device_outputs);
        let mut device_outputs = Vec::with_capacity(request.device_outputs);
        for _ in 0..request.device_outputs {
            let (promise, future) = device_sync();
            promises.push(promise);
            device_outputs.push(future);
        }

        let frontend_info = OpRunInfo::new(
            request.op_name.clone(),
            request.backend.clone(),
            request.inputs.clone(),
            stub.clone(),
        );
        let backend_info = OpRunInfo::new(request.op_name, request.backend, request.inputs, stub);
        let backend_task = BackendTask::new(
            backend_info,
            BackendOpRunInfo::new(request.stream_id, promises),
            backend_fn,
        );

        let backend_queue = self.backend.clone();
        let task = FrontendTask::new(frontend_info, move |info| match frontend_fn(info) {
            Ok(value) => {
                // The queue poisons the task itself if it no longer accepts
                // work, so the device futures resolve either way.
                backend_queue.enqueue(backend_task)?;
                Ok(value)
            }
            Err(err) => {
                let shared = Arc::new(err);
                DispatchTask::from(backend_task)
                    .set_exception(Error::Wrapped(Box::new(shared.clone())));
                Err(Error::Wrapped(Box::new(shared)))
            }
        });
        self.frontend.enqueue(task)?;
        Ok(OpHandles {
            output,
            device_outputs,
        })
    }

    /// Enqueue a bare frontend task.
    pub fn dispatch_frontend<F>(&self, info: OpRunInfo, frontend_fn: F) -> Result<()>
    where
        F: FnOnce(&mut OpRunInfo) -> Result<AbstractValue> + Send + 'static,
    {
        self.frontend.enqueue(FrontendTask::new(info, frontend_fn))
    }

    /// Enqueue a bare backend task.
    pub fn dispatch_backend<B>(
        &self,
        info: OpRunInfo,
        backend_info: BackendOpRunInfo,
        backend_fn: B,
    ) -> Result<()>
    where
        B: FnOnce(&mut OpRunInfo, &mut BackendOpRunInfo) -> Result<()> + Send + 'static,
    {
        self.backend
            .enqueue(BackendTask::new(info, backend_info, backend_fn))
    }

    /// Enqueue view/alias memory allocation against an input tensor's storage.
    pub fn dispatch_alloc_view<F>(
        &self,
        info: OpRunInfo,
        input_tensor: TensorHandle,
        input_idx: usize,
        run_fn: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut OpRunInfo, &TensorHandle, usize) -> Result<AbstractValue> + Send + 'static,
    {
        self.backend.enqueue(AllocViewMemBackendTask::new(
            info,
            input_tensor,
            input_idx,
            run_fn,
        ))
    }

    /// Enqueue contiguous materialization of a view tensor. The returned
    /// promise's future resolves once the materialization ran (or failed).
    pub fn dispatch_contiguous<F>(
        &self,
        tensor: TensorHandle,
        done: Promise<()>,
        run_fn: F,
    ) -> Result<()>
    where
        F: FnOnce(&TensorHandle) -> Result<()> + Send + 'static,
    {
        self.backend
            .enqueue(ContiguousBackendTask::new(tensor, done, run_fn))
    }

    /// Enqueue a kernel that must first materialize view inputs.
    pub fn dispatch_view_kernel<F>(
        &self,
        info: OpRunInfo,
        task_type: KernelTaskType,
        run_fn: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut OpRunInfo, KernelTaskType) -> Result<AbstractValue> + Send + 'static,
    {
        self.backend
            .enqueue(ViewKernelBackendTask::new(info, task_type, run_fn))
    }

    /// Block until everything issued so far has executed, frontend first so
    /// backend tasks enqueued by frontend completions are covered too.
    pub fn wait_all(&self) -> Result<()> {
        let _stage =
            ProfilerStageRecorder::new(&self.profiler, ProfilerStage::WaitPipeline);
        self.frontend.flush()?;
        self.backend.flush()
    }

    /// Tear both stages down: tasks not yet executed are poisoned rather than
    /// run.
    pub fn abort(&self) {
        self.frontend.abort();
        self.backend.abort();
    }
}
