//! Units of deferred work flowing through the dispatch queues.
//!
//! Each task owns its op payload and the closure that executes it. A task is
//! consumed by exactly one of [`DispatchTask::run`] (normal execution) or
//! [`DispatchTask::set_exception`] (teardown or upstream failure); consuming
//! `self` makes a second completion unrepresentable. After either path the
//! owned payload is released so device-memory-backing tensors do not outlive
//! their logical lifetime.

use std::sync::Arc;

use crate::future::Promise;
use crate::op::{AbstractValue, BackendOpRunInfo, KernelTaskType, OpRunInfo, TensorHandle};
use crate::profiler::{
    ProfilerAnalyzer, ProfilerEvent, ProfilerModule, ProfilerRecorder, NO_NAME,
};
use crate::{Error, Result};

type FrontendFn = Box<dyn FnOnce(&mut OpRunInfo) -> Result<AbstractValue> + Send>;
type BackendFn = Box<dyn FnOnce(&mut OpRunInfo, &mut BackendOpRunInfo) -> Result<()> + Send>;
type AllocViewFn =
    Box<dyn FnOnce(&mut OpRunInfo, &TensorHandle, usize) -> Result<AbstractValue> + Send>;
type ContiguousFn = Box<dyn FnOnce(&TensorHandle) -> Result<()> + Send>;
type ViewKernelFn = Box<dyn FnOnce(&mut OpRunInfo, KernelTaskType) -> Result<AbstractValue> + Send>;

/// Share one failure across several promises without cloning the error.
fn shared_exception(err: Error) -> impl Fn() -> Error {
    let shared = Arc::new(err);
    move || Error::Wrapped(Box::new(shared.clone()))
}

/// Frontend op preparation: shape/type inference and book-keeping, no device
/// interaction. Failure poisons the op's stub output.
pub struct FrontendTask {
    run_func: FrontendFn,
    op_run_info: Option<OpRunInfo>,
}

impl FrontendTask {
    pub fn new(
        op_run_info: OpRunInfo,
        run_func: impl FnOnce(&mut OpRunInfo) -> Result<AbstractValue> + Send + 'static,
    ) -> Self {
        Self {
            run_func: Box::new(run_func),
            op_run_info: Some(op_run_info),
        }
    }

    fn run(mut self, profiler: &ProfilerAnalyzer) {
        let _prof = ProfilerRecorder::new(
            profiler,
            ProfilerModule::Pynative,
            ProfilerEvent::FrontendTask,
            NO_NAME,
            false,
        );
        let Some(mut info) = self.op_run_info.take() else {
            return;
        };
        match (self.run_func)(&mut info) {
            Ok(value) => {
                info.stub_output.set_value(value);
            }
            Err(err) => {
                info.stub_output.set_exception(err);
            }
        }
    }

    fn set_exception(mut self, err: Error) {
        if let Some(info) = self.op_run_info.take() {
            info.stub_output.set_exception(err);
        }
    }
}

/// Backend kernel dispatch. The closure launches device work and resolves the
/// op's device-sync promises on success; on failure every remaining promise is
/// resolved with the error so no output is left permanently unresolved.
pub struct BackendTask {
    run_func: BackendFn,
    op_run_info: Option<OpRunInfo>,
    backend_op_run_info: Option<BackendOpRunInfo>,
}

impl BackendTask {
    pub fn new(
        op_run_info: OpRunInfo,
        backend_op_run_info: BackendOpRunInfo,
        run_func: impl FnOnce(&mut OpRunInfo, &mut BackendOpRunInfo) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            run_func: Box::new(run_func),
            op_run_info: Some(op_run_info),
            backend_op_run_info: Some(backend_op_run_info),
        }
    }

    fn run(mut self, profiler: &ProfilerAnalyzer) {
        let _prof = ProfilerRecorder::new(
            profiler,
            ProfilerModule::Pynative,
            ProfilerEvent::BackendTask,
            NO_NAME,
            false,
        );
        let (Some(mut info), Some(mut backend_info)) =
            (self.op_run_info.take(), self.backend_op_run_info.take())
        else {
            return;
        };
        match (self.run_func)(&mut info, &mut backend_info) {
            Ok(()) => {
                if !backend_info.device_sync_promises.is_empty() {
                    log::warn!(
                        "backend op '{}' left {} device-sync promise(s) unresolved",
                        info.op_name,
                        backend_info.device_sync_promises.len()
                    );
                }
            }
            Err(err) => Self::poison(&mut backend_info, err),
        }
    }

    fn set_exception(mut self, err: Error) {
        if let Some(mut backend_info) = self.backend_op_run_info.take() {
            Self::poison(&mut backend_info, err);
        }
    }

    fn poison(backend_info: &mut BackendOpRunInfo, err: Error) {
        let make = shared_exception(err);
        for promise in backend_info.device_sync_promises.drain(..) {
            promise.set_exception(make());
        }
    }
}

/// View/alias memory allocation against an existing tensor's storage.
pub struct AllocViewMemBackendTask {
    run_func: AllocViewFn,
    op_run_info: Option<OpRunInfo>,
    input_tensor: TensorHandle,
    input_idx: usize,
}

impl AllocViewMemBackendTask {
    pub fn new(
        op_run_info: OpRunInfo,
        input_tensor: TensorHandle,
        input_idx: usize,
        run_func: impl FnOnce(&mut OpRunInfo, &TensorHandle, usize) -> Result<AbstractValue>
            + Send
            + 'static,
    ) -> Self {
        Self {
            run_func: Box::new(run_func),
            op_run_info: Some(op_run_info),
            input_tensor,
            input_idx,
        }
    }

    fn run(mut self, profiler: &ProfilerAnalyzer) {
        let _prof = ProfilerRecorder::new(
            profiler,
            ProfilerModule::Pynative,
            ProfilerEvent::BackendTask,
            "AllocView",
            false,
        );
        let Some(mut info) = self.op_run_info.take() else {
            return;
        };
        match (self.run_func)(&mut info, &self.input_tensor, self.input_idx) {
            Ok(value) => {
                info.stub_output.set_value(value);
            }
            Err(err) => {
                info.stub_output.set_exception(err);
            }
        }
    }

    fn set_exception(mut self, err: Error) {
        if let Some(info) = self.op_run_info.take() {
            info.stub_output.set_exception(err);
        }
    }
}

/// Forces a strided/view tensor into a contiguous physical layout. Carries an
/// explicit completion promise so a failed materialization reaches its caller
/// the same way every other task failure does.
pub struct ContiguousBackendTask {
    run_func: ContiguousFn,
    tensor: TensorHandle,
    done: Promise<()>,
}

impl ContiguousBackendTask {
    pub fn new(
        tensor: TensorHandle,
        done: Promise<()>,
        run_func: impl FnOnce(&TensorHandle) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            run_func: Box::new(run_func),
            tensor,
            done,
        }
    }

    fn run(self, profiler: &ProfilerAnalyzer) {
        let _prof = ProfilerRecorder::new(
            profiler,
            ProfilerModule::Pynative,
            ProfilerEvent::BackendTask,
            "Contiguous",
            false,
        );
        self.done.complete((self.run_func)(&self.tensor));
    }

    fn set_exception(self, err: Error) {
        self.done.set_exception(err);
    }
}

/// Dispatches a kernel that must first materialize view inputs.
pub struct ViewKernelBackendTask {
    run_func: ViewKernelFn,
    op_run_info: Option<OpRunInfo>,
    task_type: KernelTaskType,
}

impl ViewKernelBackendTask {
    pub fn new(
        op_run_info: OpRunInfo,
        task_type: KernelTaskType,
        run_func: impl FnOnce(&mut OpRunInfo, KernelTaskType) -> Result<AbstractValue>
            + Send
            + 'static,
    ) -> Self {
        Self {
            run_func: Box::new(run_func),
            op_run_info: Some(op_run_info),
            task_type,
        }
    }

    fn run(mut self, profiler: &ProfilerAnalyzer) {
        let _prof = ProfilerRecorder::new(
            profiler,
            ProfilerModule::Pynative,
            ProfilerEvent::BackendTask,
            "ViewKernel",
            false,
        );
        let Some(mut info) = self.op_run_info.take() else {
            return;
        };
        match (self.run_func)(&mut info, self.task_type) {
            Ok(value) => {
                info.stub_output.set_value(value);
            }
            Err(err) => {
                info.stub_output.set_exception(err);
            }
        }
    }

    fn set_exception(mut self, err: Error) {
        if let Some(info) = self.op_run_info.take() {
            info.stub_output.set_exception(err);
        }
    }
}

/// The closed set of task variants the pipeline dispatches.
pub enum DispatchTask {
    Frontend(FrontendTask),
    Backend(BackendTask),
    AllocViewMem(AllocViewMemBackendTask),
    Contiguous(ContiguousBackendTask),
    ViewKernel(ViewKernelBackendTask),
}

impl DispatchTask {
    /// Execute the task. Consumes `self`; the payload is released on return.
    pub(crate) fn run(self, profiler: &ProfilerAnalyzer) {
        match self {
            Self::Frontend(t) => t.run(profiler),
            Self::Backend(t) => t.run(profiler),
            Self::AllocViewMem(t) => t.run(profiler),
            Self::Contiguous(t) => t.run(profiler),
            Self::ViewKernel(t) => t.run(profiler),
        }
    }

    /// Transport a failure into the task's caller-visible future(s) without
    /// executing it.
    pub(crate) fn set_exception(self, err: Error) {
        match self {
            Self::Frontend(t) => t.set_exception(err),
            Self::Backend(t) => t.set_exception(err),
            Self::AllocViewMem(t) => t.set_exception(err),
            Self::Contiguous(t) => t.set_exception(err),
            Self::ViewKernel(t) => t.set_exception(err),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Frontend(_) => "frontend",
            Self::Backend(_) => "backend",
            Self::AllocViewMem(_) => "alloc_view_mem",
            Self::Contiguous(_) => "contiguous",
            Self::ViewKernel(_) => "view_kernel",
        }
    }
}

impl From<FrontendTask> for DispatchTask {
    fn from(t: FrontendTask) -> Self {
        Self::Frontend(t)
    }
}

impl From<BackendTask> for DispatchTask {
    fn from(t: BackendTask) -> Self {
        Self::Backend(t)
    }
}

impl From<AllocViewMemBackendTask> for DispatchTask {
    fn from(t: AllocViewMemBackendTask) -> Self {
        Self::AllocViewMem(t)
    }
}

impl From<ContiguousBackendTask> for DispatchTask {
    fn from(t: ContiguousBackendTask) -> Self {
        Self::Contiguous(t)
    }
}

impl From<ViewKernelBackendTask> for DispatchTask {
    fn from(t: ViewKernelBackendTask) -> Self {
        Self::ViewKernel(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::stub_output;
    use crate::op::{BackendKind, DTypeKind};

    fn info(stub: std::sync::Arc<crate::future::StubOutput>) -> OpRunInfo {
        OpRunInfo::new("Add", BackendKind::Cpu, vec![], stub)
    }

    #[test]
    fn frontend_run_resolves_stub() {
        let (stub, future) = stub_output();
        let task = FrontendTask::new(info(stub), |_| {
            Ok(AbstractValue::new(vec![4], DTypeKind::F32))
        });
        let profiler = ProfilerAnalyzer::disabled();
        DispatchTask::from(task).run(&profiler);
        assert_eq!(future.wait().unwrap().shape, vec![4]);
    }

    #[test]
    fn frontend_set_exception_poisons_stub() {
        let (stub, future) = stub_output();
        let task = FrontendTask::new(info(stub), |_| {
            Ok(AbstractValue::new(vec![4], DTypeKind::F32))
        });
        DispatchTask::from(task).set_exception(Error::msg("torn down"));
        assert!(future.wait().is_err());
    }
}
