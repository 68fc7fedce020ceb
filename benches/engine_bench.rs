//! Benchmarks for engine execution.

use batchflow::dispatcher::BatchDispatcher;
use batchflow::source::{FnProcessor, VecBatchSource};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn dispatcher_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .build()
        .expect("runtime");

    c.bench_function("dispatch_1000_trivial", |b| {
        b.iter(|| {
            let dispatcher = BatchDispatcher::new(8).expect("valid concurrency");
            let mut source = VecBatchSource::new(vec![(0..1000u32).collect()]);
            let processor = FnProcessor::new(|item: &u32| Ok(item * 2));
            let report = runtime.block_on(dispatcher.run(&mut source, processor));
            black_box(report.successful_tasks)
        })
    });
}

criterion_group!(benches, dispatcher_benchmark);
criterion_main!(benches);
