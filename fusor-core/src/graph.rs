use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::cell::RefCell;

use crate::buffer::{Buffer, BufferHandle};
use crate::device::Device;
use crate::dtype::{ConstVal, DType};
use crate::error::{Error, Result};
use crate::shapetracker::ShapeTracker;
use crate::uop::{AluOp, ReduceKind};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(usize);

impl NodeId {
    pub fn get(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OpKind {
    Unary,
    Binary,
    Ternary,
    Reduce,
    Movement,
    Load,
    Contract,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Movement {
    Reshape(Vec<i64>),
    Permute(Vec<usize>),
    Expand(Vec<i64>),
    Pad(Vec<(i64, i64)>),
    Shrink(Vec<(i64, i64)>),
    Stride(Vec<i64>),
}

/// The deferred operation behind a lazy node. `Buffer` leaves either carry
/// data already or get it when their producing kernel realises them.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Op {
    Buffer,
    Fill(ConstVal),
    Arange { start: ConstVal, step: ConstVal },
    Contiguous(NodeId),
    Cast(NodeId),
    Unary(AluOp, NodeId),
    Binary(AluOp, NodeId, NodeId),
    Ternary(AluOp, NodeId, NodeId, NodeId),
    Reduce(ReduceKind, NodeId, Vec<usize>),
    Movement(Movement, NodeId),
}

impl Op {
    pub fn srcs(&self) -> Vec<NodeId> {
        match self {
            Op::Buffer | Op::Fill(_) | Op::Arange { .. } => vec![],
            Op::Contiguous(a) | Op::Cast(a) | Op::Unary(_, a) | Op::Movement(_, a) => {
                vec![*a]
            }
            Op::Binary(_, a, b) => vec![*a, *b],
            Op::Ternary(_, a, b, c) => vec![*a, *b, *c],
            Op::Reduce(_, a, _) => vec![*a],
        }
    }
}

pub struct LazyNode {
    pub op: Op,
    pub kind: OpKind,
    pub st: ShapeTracker,
    pub dtype: DType,
    pub device: Device,
    /// Set exactly once, by the scheduler, after the producing kernel ran.
    /// Once set the op graph behind this node is dead.
    pub realized: Option<BufferHandle>,
}

impl LazyNode {
    pub fn shape(&self) -> &[i64] {
        self.st.shape()
    }

    pub fn is_realized(&self) -> bool {
        self.realized.is_some()
    }
}

#[derive(PartialEq, Eq, Hash)]
struct NodeKey {
    op: Op,
    st: ShapeTracker,
    dtype: DType,
    device: Device,
}

/// Arena of lazy nodes. Construction never executes anything; fusion
/// decisions are local rewrites on what gets appended.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<LazyNode>,
    // structural dedup: identical recipes share one node, which is also what
    // makes repeated identical contractions collapse
    interned: HashMap<NodeKey, NodeId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &LazyNode {
        &self.nodes[id.0]
    }

    pub fn set_realized(&mut self, id: NodeId, buf: BufferHandle) {
        let node = &mut self.nodes[id.0];
        assert!(node.realized.is_none(), "node realized twice");
        node.realized = Some(buf);
        // release the recipe; nothing may look at it anymore. The buffer
        // holds the node's logical order, so the view resets with it.
        node.op = Op::Buffer;
        node.kind = OpKind::Load;
        node.st = ShapeTracker::from_shape(&node.st.shape().to_vec());
    }

    fn push(&mut self, op: Op, kind: OpKind, st: ShapeTracker, dtype: DType, device: Device) -> NodeId {
        let key = NodeKey {
            op: op.clone(),
            st: st.clone(),
            dtype,
            device,
        };
        if let Some(found) = self.interned.get(&key) {
            return *found;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(LazyNode {
            op,
            kind,
            st,
            dtype,
            device,
            realized: None,
        });
        self.interned.insert(key, id);
        id
    }

    // ---- leaves ----

    pub fn buffer(
        &mut self,
        device: Device,
        dtype: DType,
        shape: &[i64],
        data: Option<Buffer>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        // buffer leaves are identities of their own; never interned
        self.nodes.push(LazyNode {
            op: Op::Buffer,
            kind: OpKind::Load,
            st: ShapeTracker::from_shape(shape),
            dtype,
            device,
            realized: data.map(|b| Rc::new(RefCell::new(b))),
        });
        id
    }

    pub fn fill(&mut self, device: Device, dtype: DType, shape: &[i64], v: ConstVal) -> NodeId {
        self.push(
            Op::Fill(v),
            OpKind::Load,
            ShapeTracker::from_shape(shape),
            dtype,
            device,
        )
    }

    pub fn arange(
        &mut self,
        device: Device,
        dtype: DType,
        n: i64,
        start: ConstVal,
        step: ConstVal,
    ) -> NodeId {
        self.push(
            Op::Arange { start, step },
            OpKind::Load,
            ShapeTracker::from_shape(&[n]),
            dtype,
            device,
        )
    }

    /// Force a realisation boundary: downstream consumers read this through
    /// a fresh contiguous buffer.
    pub fn contiguous(&mut self, x: NodeId) -> NodeId {
        let n = self.node(x);
        if n.st.contiguous() {
            return x;
        }
        let (st, dtype, device) = (
            ShapeTracker::from_shape(n.shape()),
            n.dtype,
            n.device,
        );
        self.push(Op::Contiguous(x), OpKind::Load, st, dtype, device)
    }

    // ---- elementwise ----

    pub fn elementwise(&mut self, alu: AluOp, srcs: &[NodeId]) -> Result<NodeId> {
        debug_assert_eq!(srcs.len(), alu.arity());
        let shape = self.node(srcs[0]).shape().to_vec();
        let device = self.node(srcs[0]).device;
        for &s in &srcs[1..] {
            if self.node(s).shape() != shape {
                return Err(Error::ShapeMismatch {
                    op: "elementwise",
                    shape,
                    msg: format!("operand shape {:?} differs", self.node(s).shape()),
                });
            }
        }
        let dtype = match alu {
            AluOp::CmpLt | AluOp::CmpNe => DType::BOOL,
            AluOp::Where => self.node(srcs[1]).dtype,
            _ => self.node(srcs[0]).dtype,
        };
        let op = match srcs {
            [a] => Op::Unary(alu, *a),
            [a, b] => Op::Binary(alu, *a, *b),
            [a, b, c] => Op::Ternary(alu, *a, *b, *c),
            _ => unreachable!(),
        };
        let kind = match srcs.len() {
            1 => OpKind::Unary,
            2 => OpKind::Binary,
            _ => OpKind::Ternary,
        };
        Ok(self.push(op, kind, ShapeTracker::from_shape(&shape), dtype, device))
    }

    pub fn cast(&mut self, x: NodeId, dtype: DType) -> NodeId {
        let n = self.node(x);
        if n.dtype == dtype {
            return x;
        }
        let (st, device) = (ShapeTracker::from_shape(n.shape()), n.device);
        self.push(Op::Cast(x), OpKind::Unary, st, dtype, device)
    }

    // ---- reduce ----

    pub fn reduce(&mut self, kind: ReduceKind, x: NodeId, axes: &[usize]) -> Result<NodeId> {
        let n = self.node(x);
        let shape = n.shape();
        if axes.iter().any(|a| *a >= shape.len()) {
            return Err(Error::ShapeMismatch {
                op: "reduce",
                shape: shape.to_vec(),
                msg: format!("axes {axes:?} out of range"),
            });
        }
        let new_shape: Vec<i64> = shape
            .iter()
            .enumerate()
            .map(|(i, s)| if axes.contains(&i) { 1 } else { *s })
            .collect();
        let (dtype, device) = (n.dtype, n.device);
        let mut axes = axes.to_vec();
        axes.sort_unstable();
        Ok(self.push(
            Op::Reduce(kind, x, axes),
            OpKind::Reduce,
            ShapeTracker::from_shape(&new_shape),
            dtype,
            device,
        ))
    }

    /// Matmul-style contraction `(M,K)·(K,N) -> (M,N)`, built as a broadcast
    /// multiply plus a sum over the shared axis. The reduce node is tagged
    /// `Contract` so the lowering heuristics can find it.
    pub fn contract(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        let (ashape, bshape) = (
            self.node(a).shape().to_vec(),
            self.node(b).shape().to_vec(),
        );
        if ashape.len() != 2 || bshape.len() != 2 || ashape[1] != bshape[0] {
            return Err(Error::ShapeMismatch {
                op: "contract",
                shape: ashape,
                msg: format!("cannot contract with {bshape:?}"),
            });
        }
        let (m, k, n) = (ashape[0], ashape[1], bshape[1]);
        let ax = self.movement(Movement::Reshape(vec![m, 1, k]), a)?;
        let ax = self.movement(Movement::Expand(vec![m, n, k]), ax)?;
        let bx = self.movement(Movement::Permute(vec![1, 0]), b)?;
        let bx = self.movement(Movement::Reshape(vec![1, n, k]), bx)?;
        let bx = self.movement(Movement::Expand(vec![m, n, k]), bx)?;
        let mul = self.elementwise(AluOp::Mul, &[ax, bx])?;
        let red = self.reduce(ReduceKind::Sum, mul, &[2])?;
        self.nodes[red.0].kind = OpKind::Contract;
        self.movement(Movement::Reshape(vec![m, n]), red)
    }

    // ---- movement ----

    fn apply_movement(st: &ShapeTracker, m: &Movement) -> Result<ShapeTracker> {
        match m {
            Movement::Reshape(s) => st.reshape(s),
            Movement::Permute(p) => st.permute(p),
            Movement::Expand(s) => st.expand(s),
            Movement::Pad(p) => st.pad(p),
            Movement::Shrink(s) => st.shrink(s),
            Movement::Stride(s) => st.stride(s),
        }
    }

    pub fn movement(&mut self, m: Movement, x: NodeId) -> Result<NodeId> {
        let node = self.node(x);
        // view changes distribute over pointwise maps: push the movement
        // into the children of an unrealised elementwise node
        if !node.is_realized()
            && matches!(
                node.kind,
                OpKind::Unary | OpKind::Binary | OpKind::Ternary
            )
        {
            let op = node.op.clone();
            return match op {
                Op::Cast(a) => {
                    let dtype = self.node(x).dtype;
                    let a2 = self.movement(m, a)?;
                    Ok(self.cast(a2, dtype))
                }
                Op::Unary(alu, a) => {
                    let a2 = self.movement(m, a)?;
                    self.elementwise(alu, &[a2])
                }
                Op::Binary(alu, a, b) => {
                    let a2 = self.movement(m.clone(), a)?;
                    let b2 = self.movement(m, b)?;
                    self.elementwise(alu, &[a2, b2])
                }
                Op::Ternary(alu, a, b, c) => {
                    let a2 = self.movement(m.clone(), a)?;
                    let b2 = self.movement(m.clone(), b)?;
                    let c2 = self.movement(m, c)?;
                    self.elementwise(alu, &[a2, b2, c2])
                }
                _ => unreachable!(),
            };
        }

        // movement over movement composes into one view stack
        let (root, base_st) = if !node.is_realized() && node.kind == OpKind::Movement {
            let Op::Movement(_, src) = &node.op else {
                unreachable!()
            };
            (*src, node.st.clone())
        } else {
            (x, ShapeTracker::from_shape(node.shape()))
        };
        let new_st = Self::apply_movement(&base_st, &m)?;

        // a composition that collapses back to the root is the root
        let simplified = new_st.simplify();
        if simplified.contiguous() && simplified.shape() == self.node(root).shape() {
            return Ok(root);
        }

        let (dtype, device) = (self.node(root).dtype, self.node(root).device);
        Ok(self.push(
            Op::Movement(m, root),
            OpKind::Movement,
            simplified,
            dtype,
            device,
        ))
    }

    // ---- ordering ----

    /// Cycle-safe "which side is deeper" comparator: BFS-expand both
    /// dependency frontiers in lockstep; the side that contains the other is
    /// `Less` ("earlier"). Exhausted ties break on node id.
    pub fn cmp(&self, a: NodeId, b: NodeId) -> Ordering {
        let mut explore1 = VecDeque::from([a]);
        let mut explore2 = VecDeque::from([b]);
        let mut expanded1: HashSet<NodeId> = HashSet::new();
        let mut expanded2: HashSet<NodeId> = HashSet::new();
        while !explore1.is_empty() && !explore2.is_empty() {
            if explore1.contains(&b) {
                return Ordering::Less;
            }
            if explore2.contains(&a) {
                return Ordering::Greater;
            }
            let x1 = explore1.pop_front().unwrap();
            let x2 = explore2.pop_front().unwrap();
            if expanded2.contains(&x1) || expanded1.contains(&x2) {
                break;
            }
            if expanded1.insert(x1) && !self.node(x1).is_realized() {
                explore1.extend(self.node(x1).op.srcs());
            }
            if expanded2.insert(x2) && !self.node(x2).is_realized() {
                explore2.extend(self.node(x2).op.srcs());
            }
        }
        a.0.cmp(&b.0)
    }
}
