use fusor_core::{
    dialect_for, expander, float4_folding, folder, graph_rewrite, image_folding, linearize,
    order_uops, render, schedule, CompileContext, DType, Device, GraphTensor, LazyGraph, UOpArg,
    UOpKind, UOpRef,
};

/// Run the compile pipeline (schedule → lower → rewrite → order) for one
/// tensor and return the ordered programs plus rendered source.
fn compile(t: &GraphTensor, no_opt: bool) -> Vec<(Vec<UOpRef>, String, Vec<i64>, Vec<i64>)> {
    let ctx = if no_opt {
        CompileContext::new().without_opts()
    } else {
        CompileContext::new()
    };
    t.graph().with(|g| {
        let kernels = schedule(g, &[t.id()]).unwrap();
        kernels
            .iter()
            .map(|k| {
                let target = k.device.target();
                let lowered = linearize(&k.ast, &target, &ctx).unwrap();
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
    })
}

fn matmul_on(device: Device, n: i64) -> GraphTensor {
    let g = LazyGraph::new();
    let a = GraphTensor::from_slice(
        &g,
        device,
        DType::F32,
        &[n, n],
        &(0..n * n).map(|i| i as f64).collect::<Vec<_>>(),
    )
    .unwrap();
    let b = GraphTensor::from_slice(
        &g,
        device,
        DType::F32,
        &[n, n],
        &(0..n * n).map(|i| (i % 3) as f64).collect::<Vec<_>>(),
    )
    .unwrap();
    a.matmul(&b).unwrap()
}

#[test]
fn ranges_nest_and_close() {
    let out = compile(&matmul_on(Device::Cpu, 4), true);
    let (uops, _, _, _) = &out[0];
    let opens = uops.iter().filter(|u| u.op == UOpKind::Range).count();
    let closes = uops.iter().filter(|u| u.op == UOpKind::EndRange).count();
    assert_eq!(opens, 3);
    assert_eq!(closes, 3);
}

#[test]
fn matmul_classifies_two_globals_one_reduce() {
    let out = compile(&matmul_on(Device::Cpu, 4), true);
    let (uops, _, _, _) = &out[0];
    let mut normal = 0;
    let mut reduce = 0;
    for u in uops {
        if let (UOpKind::Range, UOpArg::Range { is_reduce, .. }) = (&u.op, &u.arg) {
            if *is_reduce {
                reduce += 1;
            } else {
                normal += 1;
            }
        }
    }
    assert_eq!(normal, 2);
    assert_eq!(reduce, 1);
}

#[test]
fn accumulator_sits_above_its_reduce_loop() {
    let out = compile(&matmul_on(Device::Cpu, 4), true);
    let (uops, _, _, _) = &out[0];
    let acc_pos = uops
        .iter()
        .position(|u| u.op == UOpKind::DefineAcc)
        .expect("no accumulator");
    let reduce_range_pos = uops
        .iter()
        .position(|u| matches!(&u.arg, UOpArg::Range { is_reduce: true, .. }))
        .expect("no reduce range");
    assert!(acc_pos < reduce_range_pos);
    // and a PHI joins it back at loop end
    assert!(uops.iter().any(|u| u.op == UOpKind::Phi));
}

#[test]
fn store_lands_outside_the_reduce_loop() {
    let out = compile(&matmul_on(Device::Cpu, 4), true);
    let (uops, _, _, _) = &out[0];
    let store = uops.iter().position(|u| u.op == UOpKind::Store).unwrap();
    let end_reduce = uops
        .iter()
        .enumerate()
        .filter(|(_, u)| u.op == UOpKind::EndRange)
        .map(|(i, _)| i)
        .min()
        .unwrap();
    assert!(store > end_reduce);
}

#[test]
fn no_forbidden_ops_after_rewriting() {
    for t in [
        matmul_on(Device::Cpu, 4),
        matmul_on(Device::OpenCl, 8),
        matmul_on(Device::Metal, 8),
    ] {
        for (uops, _, _, _) in compile(&t, false) {
            for u in &uops {
                assert!(
                    !matches!(
                        u.op,
                        UOpKind::Expand | UOpKind::Contract | UOpKind::Reduce | UOpKind::View
                    ),
                    "forbidden {:?} survived",
                    u.op
                );
            }
        }
    }
}

#[test]
fn padded_input_loads_are_gated() {
    let g = LazyGraph::new();
    let a = GraphTensor::from_slice(&g, Device::Cpu, DType::F32, &[3], &[1.0, 2.0, 3.0]).unwrap();
    let padded = a.pad(&[(1, 1)]).unwrap();
    let out = compile(&padded, true);
    let (uops, _, _, _) = &out[0];
    // the load carries an alternative value and a gate
    assert!(uops
        .iter()
        .any(|u| u.op == UOpKind::Load && u.src.len() == 4));
}

#[test]
fn group_for_reduce_uses_local_memory() {
    let g = LazyGraph::new();
    let a = GraphTensor::from_slice(
        &g,
        Device::OpenCl,
        DType::F32,
        &[256],
        &(0..256).map(|i| i as f64).collect::<Vec<_>>(),
    )
    .unwrap();
    let s = a.sum(&[0]).unwrap();
    let out = compile(&s, false);
    let (uops, _, _, lsz) = &out[0];
    assert!(uops.iter().any(|u| u.op == UOpKind::DefineLocal));
    assert!(uops.iter().any(|u| u.op == UOpKind::Barrier));
    assert!(uops
        .iter()
        .any(|u| matches!(&u.arg, UOpArg::Special { name, .. } if name.starts_with("lidx"))));
    assert_eq!(lsz, &vec![256]);
    // the final store only happens on lane zero
    let store = uops.iter().find(|u| u.op == UOpKind::Store
        && u.src[0].op == UOpKind::DefineGlobal).unwrap();
    assert_eq!(store.src.len(), 4);
}

#[test]
fn elementwise_kernel_has_no_accumulator() {
    let g = LazyGraph::new();
    let a = GraphTensor::ones(&g, Device::Cpu, DType::F32, &[8]);
    let b = GraphTensor::ones(&g, Device::Cpu, DType::F32, &[8]);
    let out = compile(&(a + b), true);
    let (uops, _, _, _) = &out[0];
    assert!(!uops.iter().any(|u| u.op == UOpKind::DefineAcc));
    assert!(!uops.iter().any(|u| u.op == UOpKind::Phi));
}

#[test]
fn verification_catches_bad_programs() {
    use fusor_core::{verify, UOpGraph};
    let g = UOpGraph::new();
    // a RANGE with no ENDRANGE and no SINK must be rejected
    let r = g.add(
        UOpKind::Range,
        Some(DType::I32),
        vec![g.cint(0), g.cint(4)],
        UOpArg::Range {
            id: 0,
            is_reduce: false,
        },
    );
    assert!(verify(&[r]).is_err());
}
