use fusor_core::{
    schedule, AluOp, ConstVal, DType, Device, Graph, Movement, NodeId, ReduceKind, UOpKind,
};

fn fill(g: &mut Graph, shape: &[i64], v: f64) -> NodeId {
    g.fill(Device::Cpu, DType::F32, shape, ConstVal::Float(v))
}

#[test]
fn construction_schedules_nothing() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[4], 1.0);
    let b = fill(&mut g, &[4], 2.0);
    let _c = g.elementwise(AluOp::Add, &[a, b]).unwrap();
    // no targets, no kernels
    assert!(schedule(&g, &[]).unwrap().is_empty());
}

#[test]
fn fused_chain_is_one_kernel() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[4], 1.0);
    let b = fill(&mut g, &[4], 2.0);
    let c = g.elementwise(AluOp::Add, &[a, b]).unwrap();
    let d = g.elementwise(AluOp::Mul, &[c, b]).unwrap();
    let e = g.elementwise(AluOp::Neg, &[d]).unwrap();
    let kernels = schedule(&g, &[e]).unwrap();
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].outputs, vec![e]);
}

#[test]
fn shared_compute_gets_its_own_kernel() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[4], 1.0);
    let b = fill(&mut g, &[4], 2.0);
    let shared = g.elementwise(AluOp::Add, &[a, b]).unwrap();
    let user = g.elementwise(AluOp::Mul, &[shared, shared]).unwrap();
    let kernels = schedule(&g, &[user]).unwrap();
    assert_eq!(kernels.len(), 2);
    // the shared node realises first and feeds the second kernel
    assert_eq!(kernels[0].outputs, vec![shared]);
    assert!(kernels[1].inputs.contains(&shared));
}

#[test]
fn reduce_feeding_reduce_cuts() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[4, 4], 1.0);
    let r1 = g.reduce(ReduceKind::Sum, a, &[1]).unwrap();
    let r2 = g.reduce(ReduceKind::Sum, r1, &[0]).unwrap();
    let kernels = schedule(&g, &[r2]).unwrap();
    assert_eq!(kernels.len(), 2);
    assert_eq!(kernels[0].outputs, vec![r1]);
    assert_eq!(kernels[1].outputs, vec![r2]);
}

#[test]
fn reduce_behind_a_view_cuts() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[4, 4], 1.0);
    let r = g.reduce(ReduceKind::Sum, a, &[1]).unwrap();
    // a slice of the reduction result cannot fuse over it
    let p = g
        .movement(Movement::Shrink(vec![(0, 2), (0, 1)]), r)
        .unwrap();
    let kernels = schedule(&g, &[p]).unwrap();
    assert_eq!(kernels.len(), 2);
    assert_eq!(kernels[0].outputs, vec![r]);
    assert_eq!(kernels[1].outputs, vec![p]);
}

#[test]
fn contiguous_reshape_target_reuses_the_root_kernel() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[4, 4], 1.0);
    let r = g.reduce(ReduceKind::Sum, a, &[1]).unwrap();
    let reshaped = g.movement(Movement::Reshape(vec![4]), r).unwrap();
    let kernels = schedule(&g, &[reshaped]).unwrap();
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].outputs, vec![r]);
}

#[test]
fn ast_shape_is_sink_store_loads() {
    let mut g = Graph::new();
    let a = g.buffer(
        Device::Cpu,
        DType::F32,
        &[4],
        Some(fusor_core::Buffer::from_f64s(DType::F32, &[1.0, 2.0, 3.0, 4.0])),
    );
    let b = fill(&mut g, &[4], 1.0);
    let c = g.elementwise(AluOp::Add, &[a, b]).unwrap();
    let kernels = schedule(&g, &[c]).unwrap();
    let ast = &kernels[0].ast;
    assert_eq!(ast.op, UOpKind::Sink);
    assert_eq!(ast.src.len(), 1);
    let store = &ast.src[0];
    assert_eq!(store.op, UOpKind::Store);
    // realised input shows up as a LOAD with a view, the fill as a CONST
    let parents = store.parents();
    assert!(parents
        .iter()
        .any(|u| u.op == UOpKind::Load && u.src[0].op == UOpKind::DefineGlobal));
    assert!(parents.iter().any(|u| u.op == UOpKind::Const));
    assert_eq!(kernels[0].inputs, vec![a]);
}

#[test]
fn sibling_reductions_split_deterministically() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[4, 4], 1.0);
    let b = fill(&mut g, &[4, 4], 2.0);
    let r1 = g.reduce(ReduceKind::Sum, a, &[1]).unwrap();
    let r2 = g.reduce(ReduceKind::Max, b, &[1]).unwrap();
    let both = g.elementwise(AluOp::Add, &[r1, r2]).unwrap();
    let k1 = schedule(&g, &[both]).unwrap();
    // one reduction fuses into the final kernel, the other realises first
    assert_eq!(k1.len(), 2);
    let k2 = schedule(&g, &[both]).unwrap();
    let o1: Vec<_> = k1.iter().map(|k| k.outputs.clone()).collect();
    let o2: Vec<_> = k2.iter().map(|k| k.outputs.clone()).collect();
    assert_eq!(o1, o2);
}
