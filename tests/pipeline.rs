use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use opstream::{
    oneshot, stub_output, AbstractValue, BackendKind, DTypeKind, DeviceAddress, Error, OpRequest,
    OpRunInfo, PipelineOptions, ProfilerAnalyzer, PynativePipeline, TensorHandle,
};

fn pipeline() -> PynativePipeline {
    PynativePipeline::new(
        Arc::new(ProfilerAnalyzer::disabled()),
        PipelineOptions::default(),
    )
    .unwrap()
}

fn request(op_name: &str, device_outputs: usize) -> OpRequest {
    OpRequest {
        op_name: op_name.to_string(),
        backend: BackendKind::Cpu,
        inputs: vec![AbstractValue::new(vec![2, 3], DTypeKind::F32)],
        stream_id: 0,
        device_outputs,
    }
}

#[test]
fn op_flows_through_both_stages() {
    let pipeline = pipeline();
    let handles = pipeline
        .run_op(
            request("Add", 1),
            |info| Ok(info.inputs[0].clone()),
            |info, backend_info| {
                let size = info.inputs[0].size_in_bytes();
                for promise in backend_info.device_sync_promises.drain(..) {
                    promise.set_value(DeviceAddress {
                        id: 1,
                        size_in_bytes: size,
                    });
                }
                Ok(())
            },
        )
        .unwrap();

    let out = handles.output.wait().unwrap();
    assert_eq!(out.shape, vec![2, 3]);
    let addresses: Vec<_> = handles
        .device_outputs
        .into_iter()
        .map(|f| f.wait().unwrap())
        .collect();
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].size_in_bytes, 24);
    pipeline.wait_all().unwrap();
}

#[test]
fn frontend_failure_poisons_every_handle() {
    for device_outputs in [0usize, 1, 3] {
        let pipeline = pipeline();
        let ran_backend = Arc::new(AtomicUsize::new(0));
        let ran = ran_backend.clone();
        let handles = pipeline
            .run_op(
                request("Mul", device_outputs),
                |_| Err(Error::msg("shape inference failed")),
                move |_, _| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .unwrap();

        let err = handles.output.wait().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("shape inference failed"), "got: {msg}");
        for future in handles.device_outputs {
            let err = future.wait().unwrap_err();
            assert!(
                err.to_string().contains("shape inference failed"),
                "device future saw a different failure"
            );
        }
        pipeline.wait_all().unwrap();
        // The backend closure never executed for the failed op.
        assert_eq!(ran_backend.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn backend_failure_poisons_remaining_device_futures() {
    let pipeline = pipeline();
    let handles = pipeline
        .run_op(
            request("MatMul", 2),
            |info| Ok(info.inputs[0].clone()),
            |_, _| Err(Error::device("kernel launch failed")),
        )
        .unwrap();

    // Frontend succeeded, so the op output carries the inferred value.
    assert!(handles.output.wait().is_ok());
    for future in handles.device_outputs {
        assert!(future.wait().is_err());
    }
    pipeline.wait_all().unwrap();
}

#[test]
fn failure_is_local_to_its_op() {
    let pipeline = pipeline();
    let bad = pipeline
        .run_op(request("Bad", 0), |_| Err(Error::msg("bad op")), |_, _| Ok(()))
        .unwrap();
    let good = pipeline
        .run_op(request("Good", 0), |info| Ok(info.inputs[0].clone()), |_, _| Ok(()))
        .unwrap();

    assert!(bad.output.wait().is_err());
    assert!(good.output.wait().is_ok());
    pipeline.wait_all().unwrap();
}

#[test]
fn tiny_queue_capacity_still_completes_everything() {
    let pipeline = PynativePipeline::new(
        Arc::new(ProfilerAnalyzer::disabled()),
        PipelineOptions { queue_capacity: 1 },
    )
    .unwrap();
    let mut outputs = Vec::new();
    for i in 0..64 {
        let handles = pipeline
            .run_op(
                request(&format!("Op{i}"), 0),
                |info| Ok(info.inputs[0].clone()),
                |_, _| Ok(()),
            )
            .unwrap();
        outputs.push(handles.output);
    }
    for output in outputs {
        output.wait().unwrap();
    }
    pipeline.wait_all().unwrap();
}

#[test]
fn abort_poisons_instead_of_running() {
    let pipeline = pipeline();
    pipeline.abort();
    let result = pipeline.run_op(
        request("Late", 1),
        |info| Ok(info.inputs[0].clone()),
        |_, _| Ok(()),
    );
    assert!(result.is_err());
}

#[test]
fn contiguous_task_reports_through_its_promise() {
    let pipeline = pipeline();
    let tensor = TensorHandle {
        id: 3,
        shape: vec![4, 4],
        dtype: DTypeKind::F32,
    };

    let (done, done_future) = oneshot();
    pipeline
        .dispatch_contiguous(tensor.clone(), done, |_| Ok(()))
        .unwrap();
    done_future.wait().unwrap();

    let (done, done_future) = oneshot();
    pipeline
        .dispatch_contiguous(tensor, done, |_| {
            Err(Error::device("copy kernel launch failed"))
        })
        .unwrap();
    assert!(done_future.wait().is_err());
}

#[test]
fn alloc_view_resolves_its_stub() {
    let pipeline = pipeline();
    let (stub, future) = stub_output();
    let info = OpRunInfo::new("Reshape", BackendKind::Cpu, vec![], stub);
    let tensor = TensorHandle {
        id: 9,
        shape: vec![2, 8],
        dtype: DTypeKind::F32,
    };
    pipeline
        .dispatch_alloc_view(info, tensor, 0, |_, input, _| {
            Ok(AbstractValue::new(input.shape.clone(), input.dtype))
        })
        .unwrap();
    assert_eq!(future.wait().unwrap().shape, vec![2, 8]);
}

#[test]
fn view_kernel_resolves_its_stub() {
    use opstream::KernelTaskType;

    let pipeline = pipeline();
    let (stub, future) = stub_output();
    let info = OpRunInfo::new(
        "Slice",
        BackendKind::Cpu,
        vec![AbstractValue::new(vec![8], DTypeKind::I64)],
        stub,
    );
    pipeline
        .dispatch_view_kernel(info, KernelTaskType::Copy, |info, task_type| {
            assert_eq!(task_type, KernelTaskType::Copy);
            Ok(info.inputs[0].clone())
        })
        .unwrap();
    assert_eq!(future.wait().unwrap().dtype, DTypeKind::I64);
}
