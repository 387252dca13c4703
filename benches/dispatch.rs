use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use opstream::{
    AbstractValue, BackendKind, DTypeKind, OpRequest, PipelineOptions, ProfilerAnalyzer,
    PynativePipeline,
};

fn request(op_name: &str) -> OpRequest {
    OpRequest {
        op_name: op_name.to_string(),
        backend: BackendKind::Cpu,
        inputs: vec![AbstractValue::new(vec![64, 64], DTypeKind::F32)],
        stream_id: 0,
        device_outputs: 0,
    }
}

fn bench_dispatch_wait_single(c: &mut Criterion) {
    let pipeline = PynativePipeline::new(
        Arc::new(ProfilerAnalyzer::disabled()),
        PipelineOptions::default(),
    )
    .unwrap();
    c.bench_function("dispatch_wait_single_op", |bencher| {
        bencher.iter(|| {
            let handles = pipeline
                .run_op(
                    request("Add"),
                    |info| Ok(info.inputs[0].clone()),
                    |_, _| Ok(()),
                )
                .unwrap();
            handles.output.wait().unwrap()
        });
    });
}

fn bench_dispatch_burst_256(c: &mut Criterion) {
    let pipeline = PynativePipeline::new(
        Arc::new(ProfilerAnalyzer::disabled()),
        PipelineOptions::default(),
    )
    .unwrap();
    c.bench_function("dispatch_burst_256_ops", |bencher| {
        bencher.iter(|| {
            let mut outputs = Vec::with_capacity(256);
            for _ in 0..256 {
                let handles = pipeline
                    .run_op(
                        request("Add"),
                        |info| Ok(info.inputs[0].clone()),
                        |_, _| Ok(()),
                    )
                    .unwrap();
                outputs.push(handles.output);
            }
            for output in outputs {
                output.wait().unwrap();
            }
        });
    });
}

fn bench_dispatch_with_profiler(c: &mut Criterion) {
    let config = opstream::ProfilerConfig {
        enable: true,
        show_top_num: 10,
        output_dir: std::env::temp_dir().join("opstream-bench"),
    };
    let analyzer = Arc::new(ProfilerAnalyzer::from_config(&config));
    let pipeline = PynativePipeline::new(analyzer, PipelineOptions::default()).unwrap();
    c.bench_function("dispatch_wait_single_op_profiled", |bencher| {
        bencher.iter(|| {
            let handles = pipeline
                .run_op(
                    request("Add"),
                    |info| Ok(info.inputs[0].clone()),
                    |_, _| Ok(()),
                )
                .unwrap();
            handles.output.wait().unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_dispatch_wait_single,
    bench_dispatch_burst_256,
    bench_dispatch_with_profiler
);
criterion_main!(benches);
