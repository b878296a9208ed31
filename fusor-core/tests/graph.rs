use std::cmp::Ordering;

use fusor_core::{AluOp, ConstVal, DType, Device, Graph, Movement, Op, OpKind, ReduceKind};

fn fill(g: &mut Graph, shape: &[i64], v: f64) -> fusor_core::NodeId {
    g.fill(Device::Cpu, DType::F32, shape, ConstVal::Float(v))
}

#[test]
fn movement_pushes_into_elementwise() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[2, 3], 1.0);
    let b = fill(&mut g, &[2, 3], 2.0);
    let c = g.elementwise(AluOp::Add, &[a, b]).unwrap();
    let r = g.movement(Movement::Reshape(vec![6]), c).unwrap();
    // the reshape lands on the operands; the result is still elementwise
    let node = g.node(r);
    assert_eq!(node.kind, OpKind::Binary);
    assert_eq!(node.shape(), &[6]);
}

#[test]
fn movement_chains_merge_into_one_node() {
    let mut g = Graph::new();
    let x = fill(&mut g, &[4, 4], 0.0);
    let m1 = g.movement(Movement::Permute(vec![1, 0]), x).unwrap();
    let m2 = g.movement(Movement::Shrink(vec![(0, 2), (0, 2)]), m1).unwrap();
    // one movement node pointing straight at the root
    match &g.node(m2).op {
        Op::Movement(_, src) => assert_eq!(*src, x),
        other => panic!("expected a movement node, got {other:?}"),
    }
}

#[test]
fn movement_that_cancels_returns_the_root() {
    let mut g = Graph::new();
    let x = fill(&mut g, &[4], 0.0);
    let r1 = g.movement(Movement::Reshape(vec![2, 2]), x).unwrap();
    let r2 = g.movement(Movement::Reshape(vec![4]), r1).unwrap();
    assert_eq!(r2, x);

    // a permute and its inverse compose to the same view
    let p1 = g.movement(Movement::Permute(vec![1, 0]), r1).unwrap();
    let p2 = g.movement(Movement::Permute(vec![1, 0]), p1).unwrap();
    assert_eq!(g.node(p2).st, g.node(r1).st);
}

#[test]
fn identical_recipes_share_a_node() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[8], 3.0);
    let b = fill(&mut g, &[8], 3.0);
    assert_eq!(a, b);

    let x = fill(&mut g, &[2, 2], 1.0);
    let y = fill(&mut g, &[2, 2], 2.0);
    let c1 = g.contract(x, y).unwrap();
    let c2 = g.contract(x, y).unwrap();
    assert_eq!(c1, c2);
}

#[test]
fn contract_builds_a_tagged_reduction() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[2, 3], 1.0);
    let b = fill(&mut g, &[3, 4], 1.0);
    let c = g.contract(a, b).unwrap();
    assert_eq!(g.node(c).shape(), &[2, 4]);
    // the reduce node underneath carries the contract tag
    let mut found = false;
    let mut stack = vec![c];
    let mut seen = std::collections::HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if g.node(id).kind == OpKind::Contract {
            found = true;
        }
        stack.extend(g.node(id).op.srcs());
    }
    assert!(found);
}

#[test]
fn reduce_keeps_rank() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[2, 3, 4], 1.0);
    let r = g.reduce(ReduceKind::Sum, a, &[1]).unwrap();
    assert_eq!(g.node(r).shape(), &[2, 1, 4]);
}

#[test]
fn comparator_is_deterministic_and_antisymmetric() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[4], 1.0);
    let b = fill(&mut g, &[4], 2.0);
    let c = g.elementwise(AluOp::Add, &[a, b]).unwrap();
    assert_eq!(g.cmp(c, a), g.cmp(c, a));
    match g.cmp(c, a) {
        Ordering::Less => assert_eq!(g.cmp(a, c), Ordering::Greater),
        Ordering::Greater => assert_eq!(g.cmp(a, c), Ordering::Less),
        Ordering::Equal => panic!("distinct nodes must order"),
    }
}

#[test]
fn elementwise_rejects_mismatched_shapes() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[2, 3], 1.0);
    let b = fill(&mut g, &[3, 2], 1.0);
    assert!(g.elementwise(AluOp::Add, &[a, b]).is_err());
}

#[test]
fn comparison_ops_produce_bool() {
    let mut g = Graph::new();
    let a = fill(&mut g, &[4], 1.0);
    let b = fill(&mut g, &[4], 2.0);
    let c = g.elementwise(AluOp::CmpLt, &[a, b]).unwrap();
    assert_eq!(g.node(c).dtype, DType::BOOL);
}
