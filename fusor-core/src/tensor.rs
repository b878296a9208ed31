use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::buffer::{Buffer, BufferHandle};
use crate::context::CompileContext;
use crate::device::{Device, DeviceRegistry};
use crate::dtype::{ConstVal, DType};
use crate::error::{Error, Result};
use crate::graph::{Graph, Movement, NodeId};
use crate::schedule;
use crate::uop::{AluOp, ReduceKind};

/// Shared handle to a lazy op arena. Clones reference the same graph, like
/// the tensors created on it.
#[derive(Clone, Default)]
pub struct LazyGraph {
    inner: Rc<RefCell<Graph>>,
}

impl LazyGraph {
    pub fn new() -> LazyGraph {
        LazyGraph::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&Graph) -> R) -> R {
        f(&self.inner.borrow())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Graph) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }
}

/// A deferred tensor: an id into the shared graph. Operations only append
/// nodes; nothing runs until [`GraphTensor::realize`].
#[derive(Clone)]
pub struct GraphTensor {
    graph: LazyGraph,
    id: NodeId,
}

impl GraphTensor {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn graph(&self) -> &LazyGraph {
        &self.graph
    }

    pub fn shape(&self) -> Vec<i64> {
        self.graph.with(|g| g.node(self.id).shape().to_vec())
    }

    pub fn dtype(&self) -> DType {
        self.graph.with(|g| g.node(self.id).dtype)
    }

    pub fn device(&self) -> Device {
        self.graph.with(|g| g.node(self.id).device)
    }

    fn wrap(&self, id: NodeId) -> GraphTensor {
        GraphTensor {
            graph: self.graph.clone(),
            id,
        }
    }

    // ---- constructors ----

    #[must_use]
    pub fn fill(
        graph: &LazyGraph,
        device: Device,
        dtype: DType,
        shape: &[i64],
        v: f64,
    ) -> GraphTensor {
        let id = graph.with_mut(|g| g.fill(device, dtype, shape, ConstVal::of(dtype, v)));
        GraphTensor {
            graph: graph.clone(),
            id,
        }
    }

    #[must_use]
    pub fn zeros(graph: &LazyGraph, device: Device, dtype: DType, shape: &[i64]) -> GraphTensor {
        Self::fill(graph, device, dtype, shape, 0.0)
    }

    #[must_use]
    pub fn ones(graph: &LazyGraph, device: Device, dtype: DType, shape: &[i64]) -> GraphTensor {
        Self::fill(graph, device, dtype, shape, 1.0)
    }

    /// `n` values starting at `start`, stepping by `step`.
    #[must_use]
    pub fn arange(
        graph: &LazyGraph,
        device: Device,
        dtype: DType,
        start: f64,
        step: f64,
        n: i64,
    ) -> GraphTensor {
        let id = graph.with_mut(|g| {
            g.arange(
                device,
                dtype,
                n,
                ConstVal::of(dtype, start),
                ConstVal::of(dtype, step),
            )
        });
        GraphTensor {
            graph: graph.clone(),
            id,
        }
    }

    pub fn from_slice(
        graph: &LazyGraph,
        device: Device,
        dtype: DType,
        shape: &[i64],
        data: &[f64],
    ) -> Result<GraphTensor> {
        if shape.iter().product::<i64>() != data.len() as i64 {
            return Err(Error::ShapeMismatch {
                op: "from_slice",
                shape: shape.to_vec(),
                msg: format!("{} elements supplied", data.len()),
            });
        }
        let buf = Buffer::from_f64s(dtype, data);
        let id = graph.with_mut(|g| g.buffer(device, dtype, shape, Some(buf)));
        Ok(GraphTensor {
            graph: graph.clone(),
            id,
        })
    }

    /// Uniform samples in `[0, 1)`.
    #[must_use]
    pub fn rand(graph: &LazyGraph, device: Device, dtype: DType, shape: &[i64]) -> GraphTensor {
        let n = shape.iter().product::<i64>() as usize;
        let mut rng = rand::rng();
        let data: Vec<f64> = (0..n).map(|_| rng.random_range(0.0..1.0)).collect();
        Self::from_slice(graph, device, dtype, shape, &data)
            .expect("rand shape is self-consistent")
    }

    /// Standard-normal samples.
    #[must_use]
    pub fn randn(graph: &LazyGraph, device: Device, dtype: DType, shape: &[i64]) -> GraphTensor {
        let n = shape.iter().product::<i64>() as usize;
        let mut rng = rand::rng();
        let data: Vec<f64> = (0..n).map(|_| StandardNormal.sample(&mut rng)).collect();
        Self::from_slice(graph, device, dtype, shape, &data)
            .expect("randn shape is self-consistent")
    }

    // ---- elementwise ----

    fn unary(&self, alu: AluOp) -> GraphTensor {
        let id = self
            .graph
            .with_mut(|g| g.elementwise(alu, &[self.id]))
            .unwrap_or_else(|e| panic!("{e}"));
        self.wrap(id)
    }

    fn binary(&self, alu: AluOp, rhs: &GraphTensor) -> Result<GraphTensor> {
        let (a, b) = self.broadcast_with(rhs)?;
        let id = self.graph.with_mut(|g| g.elementwise(alu, &[a, b]))?;
        Ok(self.wrap(id))
    }

    pub fn sqrt(&self) -> GraphTensor {
        self.unary(AluOp::Sqrt)
    }

    pub fn exp2(&self) -> GraphTensor {
        self.unary(AluOp::Exp2)
    }

    pub fn log2(&self) -> GraphTensor {
        self.unary(AluOp::Log2)
    }

    pub fn sin(&self) -> GraphTensor {
        self.unary(AluOp::Sin)
    }

    pub fn recip(&self) -> GraphTensor {
        self.unary(AluOp::Recip)
    }

    pub fn maximum(&self, rhs: &GraphTensor) -> Result<GraphTensor> {
        self.binary(AluOp::Max, rhs)
    }

    /// Elementwise `self < rhs`, as a bool tensor.
    pub fn lt(&self, rhs: &GraphTensor) -> Result<GraphTensor> {
        self.binary(AluOp::CmpLt, rhs)
    }

    /// `cond ? self : other`, broadcasting all three.
    pub fn where_of(cond: &GraphTensor, a: &GraphTensor, b: &GraphTensor) -> Result<GraphTensor> {
        let (c, a2) = cond.broadcast_with(a)?;
        let cond2 = cond.wrap(c);
        let (c, b2) = cond2.broadcast_with(b)?;
        let id = cond
            .graph
            .with_mut(|g| g.elementwise(AluOp::Where, &[c, a2, b2]))?;
        Ok(cond.wrap(id))
    }

    pub fn cast(&self, dtype: DType) -> GraphTensor {
        let id = self.graph.with_mut(|g| g.cast(self.id, dtype));
        self.wrap(id)
    }

    // ---- broadcasting ----

    /// Numpy-style: ranks align right, unit axes stretch.
    fn broadcast_with(&self, rhs: &GraphTensor) -> Result<(NodeId, NodeId)> {
        let (sa, sb) = (self.shape(), rhs.shape());
        if sa == sb {
            return Ok((self.id, rhs.id));
        }
        let rank = sa.len().max(sb.len());
        let pad_left = |s: &[i64]| -> Vec<i64> {
            let mut out = vec![1; rank - s.len()];
            out.extend(s);
            out
        };
        let (pa, pb) = (pad_left(&sa), pad_left(&sb));
        let mut common = Vec::with_capacity(rank);
        for (x, y) in pa.iter().zip(&pb) {
            let dim = match (*x, *y) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(Error::ShapeMismatch {
                        op: "broadcast",
                        shape: sa.clone(),
                        msg: format!("cannot broadcast with {sb:?}"),
                    })
                }
            };
            common.push(dim);
        }
        let a = self.graph.with_mut(|g| -> Result<NodeId> {
            let mut id = self.id;
            if sa.len() != rank {
                id = g.movement(Movement::Reshape(pa.clone()), id)?;
            }
            if pa != common {
                id = g.movement(Movement::Expand(common.clone()), id)?;
            }
            Ok(id)
        })?;
        let b = self.graph.with_mut(|g| -> Result<NodeId> {
            let mut id = rhs.id;
            if sb.len() != rank {
                id = g.movement(Movement::Reshape(pb.clone()), id)?;
            }
            if pb != common {
                id = g.movement(Movement::Expand(common.clone()), id)?;
            }
            Ok(id)
        })?;
        Ok((a, b))
    }

    // ---- movement ----

    pub fn reshape(&self, shape: &[i64]) -> Result<GraphTensor> {
        let id = self
            .graph
            .with_mut(|g| g.movement(Movement::Reshape(shape.to_vec()), self.id))?;
        Ok(self.wrap(id))
    }

    pub fn permute(&self, perm: &[usize]) -> Result<GraphTensor> {
        let id = self
            .graph
            .with_mut(|g| g.movement(Movement::Permute(perm.to_vec()), self.id))?;
        Ok(self.wrap(id))
    }

    pub fn expand(&self, shape: &[i64]) -> Result<GraphTensor> {
        let id = self
            .graph
            .with_mut(|g| g.movement(Movement::Expand(shape.to_vec()), self.id))?;
        Ok(self.wrap(id))
    }

    pub fn pad(&self, widths: &[(i64, i64)]) -> Result<GraphTensor> {
        let id = self
            .graph
            .with_mut(|g| g.movement(Movement::Pad(widths.to_vec()), self.id))?;
        Ok(self.wrap(id))
    }

    pub fn shrink(&self, bounds: &[(i64, i64)]) -> Result<GraphTensor> {
        let id = self
            .graph
            .with_mut(|g| g.movement(Movement::Shrink(bounds.to_vec()), self.id))?;
        Ok(self.wrap(id))
    }

    pub fn stride(&self, steps: &[i64]) -> Result<GraphTensor> {
        let id = self
            .graph
            .with_mut(|g| g.movement(Movement::Stride(steps.to_vec()), self.id))?;
        Ok(self.wrap(id))
    }

    /// Reverse one axis.
    pub fn flip(&self, axis: usize) -> Result<GraphTensor> {
        let mut steps = vec![1i64; self.shape().len()];
        steps[axis] = -1;
        self.stride(&steps)
    }

    // ---- reductions ----

    /// Sum over `axes`, keeping them as size 1.
    pub fn sum(&self, axes: &[usize]) -> Result<GraphTensor> {
        let this = if self.dtype() == DType::BOOL {
            self.cast(DType::I32)
        } else {
            self.clone()
        };
        let id = this
            .graph
            .with_mut(|g| g.reduce(ReduceKind::Sum, this.id, axes))?;
        Ok(self.wrap(id))
    }

    /// Sum everything down to a single element.
    pub fn sum_all(&self) -> Result<GraphTensor> {
        let axes: Vec<usize> = (0..self.shape().len()).collect();
        let summed = self.sum(&axes)?;
        summed.reshape(&[1])
    }

    pub fn max_reduce(&self, axes: &[usize]) -> Result<GraphTensor> {
        let id = self
            .graph
            .with_mut(|g| g.reduce(ReduceKind::Max, self.id, axes))?;
        Ok(self.wrap(id))
    }

    /// 2-D matrix multiply.
    pub fn matmul(&self, rhs: &GraphTensor) -> Result<GraphTensor> {
        let id = self.graph.with_mut(|g| g.contract(self.id, rhs.id))?;
        Ok(self.wrap(id))
    }

    // ---- realisation ----

    /// Compile and run everything this tensor depends on, on the built-in
    /// drivers with a default context.
    pub fn realize(&self) -> Result<Tensor> {
        self.realize_with(&DeviceRegistry::with_defaults(), &CompileContext::new())
    }

    pub fn realize_with(
        &self,
        registry: &DeviceRegistry,
        ctx: &CompileContext,
    ) -> Result<Tensor> {
        self.graph
            .with_mut(|g| schedule::realize(g, &[self.id], registry, ctx))?;
        self.graph.with(|g| {
            let node = g.node(self.id);
            let handle = node.realized.clone().expect("realize left target pending");
            Ok(Tensor {
                shape: node.shape().to_vec(),
                dtype: node.dtype,
                buffer: materialize(&node.st, handle, node.dtype),
            })
        })
    }
}

/// Copy realised storage out in logical order. An aliased view reads
/// through its tracker; plain outputs are already contiguous.
fn materialize(
    st: &crate::shapetracker::ShapeTracker,
    handle: BufferHandle,
    dtype: DType,
) -> BufferHandle {
    if st.contiguous() {
        return handle;
    }
    let src = handle.borrow();
    let shape = st.shape().to_vec();
    let n = st.size() as usize;
    let mut out = Buffer::zeroed(dtype, n);
    let (idx_expr, valid_expr) = st.expr_node();
    let mut env: HashMap<String, i64> = HashMap::new();
    let mut counter = vec![0i64; shape.len()];
    for flat in 0..n {
        for (k, c) in counter.iter().enumerate() {
            env.insert(format!("idx{k}"), *c);
        }
        if valid_expr.eval(&env) != 0 {
            out.set(flat, src.get(idx_expr.eval(&env) as usize));
        }
        // odometer step
        for k in (0..counter.len()).rev() {
            counter[k] += 1;
            if counter[k] < shape[k] {
                break;
            }
            counter[k] = 0;
        }
    }
    Rc::new(RefCell::new(out))
}

/// A realised tensor: shape plus concrete storage.
pub struct Tensor {
    pub shape: Vec<i64>,
    pub dtype: DType,
    buffer: BufferHandle,
}

impl Tensor {
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.buffer.borrow().to_f64_vec()
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.buffer.borrow().to_f32_vec()
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.buffer.borrow().to_i64_vec()
    }

    pub fn cast(&self, dtype: DType) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            dtype,
            buffer: Rc::new(RefCell::new(self.buffer.borrow().cast(dtype))),
        }
    }
}

macro_rules! graphtensor_binop {
    ($trait:ident, $fn_name:ident, $alu:expr) => {
        impl $trait for GraphTensor {
            type Output = GraphTensor;
            /// Append an elementwise operation to the graph.
            fn $fn_name(self, rhs: Self) -> Self::Output {
                self.binary($alu, &rhs).unwrap_or_else(|e| panic!("{e}"))
            }
        }

        impl $trait for &GraphTensor {
            type Output = GraphTensor;
            fn $fn_name(self, rhs: Self) -> Self::Output {
                self.binary($alu, rhs).unwrap_or_else(|e| panic!("{e}"))
            }
        }
    };
}

graphtensor_binop!(Add, add, AluOp::Add);
graphtensor_binop!(Sub, sub, AluOp::Sub);
graphtensor_binop!(Mul, mul, AluOp::Mul);
graphtensor_binop!(Div, div, AluOp::Div);

impl Neg for GraphTensor {
    type Output = GraphTensor;
    fn neg(self) -> Self::Output {
        self.unary(AluOp::Neg)
    }
}

impl Add<f64> for GraphTensor {
    type Output = GraphTensor;
    /// Adding a scalar broadcasts a fill of it.
    fn add(self, rhs: f64) -> Self::Output {
        let c = GraphTensor::fill(&self.graph, self.device(), self.dtype(), &self.shape(), rhs);
        self + c
    }
}

impl Mul<f64> for GraphTensor {
    type Output = GraphTensor;
    fn mul(self, rhs: f64) -> Self::Output {
        let c = GraphTensor::fill(&self.graph, self.device(), self.dtype(), &self.shape(), rhs);
        self * c
    }
}
