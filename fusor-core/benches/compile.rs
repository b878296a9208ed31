use criterion::{criterion_group, criterion_main, Criterion};

use fusor_core::{
    dialect_for, expander, float4_folding, folder, graph_rewrite, linearize, order_uops, render,
    schedule, CompileContext, DType, Device, GraphTensor, LazyGraph,
};

fn compile_matmul(n: i64) {
    let g = LazyGraph::new();
    let a = GraphTensor::ones(&g, Device::OpenCl, DType::F32, &[n, n]);
    let b = GraphTensor::ones(&g, Device::OpenCl, DType::F32, &[n, n]);
    let mm = a.matmul(&b).unwrap();
    let ctx = CompileContext::new();
    g.with(|graph| {
        for k in schedule(graph, &[mm.id()]).unwrap() {
            let target = k.device.target();
            let lowered = linearize(&k.ast, &target, &ctx).unwrap();
            let f = folder().concat(float4_folding());
            let sink = graph_rewrite(&lowered.sink, &f, &lowered.graph);
            let sink = graph_rewrite(&sink, &folder().concat(expander()), &lowered.graph);
            let uops = order_uops(&sink, &lowered.graph).unwrap();
            let _ = render(&lowered.name_base, &uops, dialect_for(k.device)).unwrap();
        }
    });
}

fn bench_pipeline(c: &mut Criterion) {
    c.bench_function("compile matmul 64", |b| b.iter(|| compile_matmul(64)));
    c.bench_function("compile matmul 256", |b| b.iter(|| compile_matmul(256)));
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
