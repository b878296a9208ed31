use fusor_core::{
    dialect_for, expander, float4_folding, folder, graph_rewrite, image_folding, linearize,
    order_uops, render, schedule, AluOp, Buffer, CompileContext, DType, Device, Graph,
    GraphTensor, LazyGraph, UOpRef,
};

fn compile(t: &GraphTensor, no_opt: bool) -> Vec<(Vec<UOpRef>, String, Vec<i64>, Vec<i64>)> {
    let ctx = if no_opt {
        CompileContext::new().without_opts()
    } else {
        CompileContext::new()
    };
    t.graph().with(|g| compile_graph(g, t.id(), &ctx))
}

fn compile_graph(
    g: &Graph,
    id: fusor_core::NodeId,
    ctx: &CompileContext,
) -> Vec<(Vec<UOpRef>, String, Vec<i64>, Vec<i64>)> {
    let kernels = schedule(g, &[id]).unwrap();
    kernels
        .iter()
        .map(|k| {
            let target = k.device.target();
            let lowered = linearize(&k.ast, &target, ctx).unwrap();
            let mut f = folder();
            if target.supports_float4 {
                f = f.concat(float4_folding());
            }
            if target.has_image {
                f = f.concat(image_folding());
            }
            let sink = graph_rewrite(&lowered.sink, &f, &lowered.graph);
            let sink = graph_rewrite(&sink, &folder().concat(expander()), &lowered.graph);
            let uops = order_uops(&sink, &lowered.graph).unwrap();
            let (src, gsz, lsz) =
                render(&lowered.name_base, &uops, dialect_for(k.device)).unwrap();
            (uops, src, gsz, lsz)
        })
        .collect()
}

fn ew_add(device: Device, n: i64) -> GraphTensor {
    let g = LazyGraph::new();
    let a = GraphTensor::from_slice(
        &g,
        device,
        DType::F32,
        &[n],
        &(0..n).map(|i| i as f64).collect::<Vec<_>>(),
    )
    .unwrap();
    let b = GraphTensor::ones(&g, device, DType::F32, &[n]);
    a + b
}

#[test]
fn rendering_is_deterministic() {
    let t = ew_add(Device::OpenCl, 64);
    let a = compile(&t, false);
    let b = compile(&t, false);
    assert_eq!(a[0].1, b[0].1);
    assert_eq!(a[0].2, b[0].2);
    assert_eq!(a[0].3, b[0].3);
}

#[test]
fn opencl_dialect_markers() {
    let out = compile(&ew_add(Device::OpenCl, 64), false);
    let src = &out[0].1;
    assert!(src.contains("__kernel void"), "{src}");
    assert!(src.contains("__global"), "{src}");
    assert!(src.contains("get_group_id(0)"), "{src}");
}

#[test]
fn float4_fires_on_aligned_elementwise() {
    let out = compile(&ew_add(Device::OpenCl, 64), false);
    let src = &out[0].1;
    assert!(src.contains("float4"), "{src}");
}

#[test]
fn cuda_dialect_markers() {
    let out = compile(&ew_add(Device::Cuda, 64), false);
    let src = &out[0].1;
    assert!(src.contains("extern \"C\" __global__ void"), "{src}");
    assert!(src.contains("blockIdx.x"), "{src}");
}

#[test]
fn cpu_matmul_renders_nested_loops() {
    let g = LazyGraph::new();
    let a = GraphTensor::ones(&g, Device::Cpu, DType::F32, &[4, 4]);
    let b = GraphTensor::ones(&g, Device::Cpu, DType::F32, &[4, 4]);
    let mm = a.matmul(&b).unwrap();
    let out = compile(&mm, true);
    let src = &out[0].1;
    assert!(src.contains("for (int idx0"), "{src}");
    assert!(src.contains("for (int ridx2"), "{src}");
    assert!(src.contains("acc0"), "{src}");
    // reduce kernels carry the re_ prefix and the full shape
    assert!(src.contains("re_4_4_4"), "{src}");
}

#[test]
fn elementwise_kernels_carry_the_ew_prefix() {
    let out = compile(&ew_add(Device::Cpu, 16), true);
    assert!(out[0].1.contains("ew_16"), "{}", out[0].1);
}

#[test]
fn group_for_reduce_renders_local_memory_and_barrier() {
    let g = LazyGraph::new();
    let a = GraphTensor::ones(&g, Device::OpenCl, DType::F32, &[256]);
    let s = a.sum(&[0]).unwrap();
    let out = compile(&s, false);
    let src = &out[0].1;
    assert!(src.contains("__local float temp0[256];"), "{src}");
    assert!(src.contains("barrier(CLK_LOCAL_MEM_FENCE);"), "{src}");
    assert!(src.contains("get_local_id(0)"), "{src}");
}

#[test]
fn metal_matmul_uses_simdgroup_mma() {
    let g = LazyGraph::new();
    let a = GraphTensor::ones(&g, Device::Metal, DType::F32, &[8, 8]);
    let b = GraphTensor::ones(&g, Device::Metal, DType::F32, &[8, 8]);
    let mm = a.matmul(&b).unwrap();
    let out = compile(&mm, false);
    let src = &out[0].1;
    assert!(src.contains("simdgroup_multiply_accumulate"), "{src}");
    assert!(src.contains("threadgroup_position_in_grid"), "{src}");
}

#[test]
fn image_buffers_read_through_the_sampler() {
    let ctx = CompileContext::new().without_opts();
    let mut g = Graph::new();
    let img = g.buffer(
        Device::OpenCl,
        DType::image(4, 4),
        &[4, 16],
        Some(Buffer::zeroed(DType::F32, 64)),
    );
    let one = g.fill(
        Device::OpenCl,
        DType::F32,
        &[4, 16],
        fusor_core::ConstVal::Float(1.0),
    );
    let out_node = g.elementwise(AluOp::Add, &[one, img]).unwrap();
    let out = compile_graph(&g, out_node, &ctx);
    let src = &out[0].1;
    assert!(src.contains("read_imagef"), "{src}");
    assert!(src.contains("sampler_t"), "{src}");
    assert!(src.contains("image2d_t"), "{src}");
}

#[test]
fn name_collisions_get_a_suffix() {
    let ctx = CompileContext::new();
    assert_eq!(ctx.kernel_name("ew_4", 1), "ew_4");
    assert_eq!(ctx.kernel_name("ew_4", 1), "ew_4");
    assert_eq!(ctx.kernel_name("ew_4", 2), "ew_4n1");
    assert_eq!(ctx.kernel_name("ew_4", 2), "ew_4n1");
    assert_eq!(ctx.kernel_name("ew_4", 3), "ew_4n2");
}

#[test]
fn launch_dims_come_from_special_axes() {
    let out = compile(&ew_add(Device::OpenCl, 64), false);
    let (_, _, gsz, _) = &out[0];
    // 64 elements, float4-upcast: 16 groups on one axis
    assert_eq!(gsz, &vec![16]);
}
