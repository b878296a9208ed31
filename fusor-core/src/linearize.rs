use std::collections::HashMap;

use tracing::debug;

use crate::context::CompileContext;
use crate::device::TargetSpec;
use crate::dtype::{ConstVal, DType};
use crate::error::{Error, Result};
use crate::shapetracker::ShapeTracker;
use crate::symbolic::Node;
use crate::uop::{AluOp, ReduceKind, UOpArg, UOpGraph, UOpKind, UOpRef, WmmaArg};

/// One kernel AST lowered to a SINK-rooted UOp graph, before rewriting.
pub struct Lowered {
    pub graph: UOpGraph,
    pub sink: UOpRef,
    pub name_base: String,
}

/// Axis classes, in layout order:
/// `[global][local][group-for-reduce][reduce][upcast]`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AxisClass {
    Global,
    Local,
    GroupReduce,
    Reduce,
    Upcast,
}

pub struct Kernel<'a> {
    target: &'a TargetSpec,
    ast: UOpRef,
    /// Per-site shape trackers; index 0 is the output store. All sites share
    /// one rank and get reshaped/permuted together.
    sts: Vec<ShapeTracker>,
    site_of: HashMap<u64, usize>,
    has_reduce: bool,
    group_for_reduce: Vec<i64>,
    upcasted: usize,
    local_dims: usize,
    tc: Option<WmmaArg>,
}

impl<'a> Kernel<'a> {
    pub fn new(ast: &UOpRef, target: &'a TargetSpec) -> Result<Kernel<'a>> {
        if ast.op != UOpKind::Sink || ast.src.len() != 1 {
            return Err(Error::IrViolation {
                msg: "kernel ast must be a single-store SINK".into(),
                uops: format!("{:?}", ast.op),
            });
        }
        let mut sts = Vec::new();
        let mut site_of = HashMap::new();
        let store = &ast.src[0];
        let store_st = store
            .src
            .iter()
            .find_map(|s| s.view())
            .ok_or_else(|| Error::IrViolation {
                msg: "store without view".into(),
                uops: String::new(),
            })?;
        sts.push(store_st.simplify());
        site_of.insert(store.id, 0);
        let mut has_reduce = false;
        for u in ast.parents() {
            match u.op {
                UOpKind::Load | UOpKind::Const => {
                    if let Some(st) = u.src.iter().find_map(|s| s.view()) {
                        site_of.insert(u.id, sts.len());
                        sts.push(st.simplify());
                    }
                }
                UOpKind::Reduce => has_reduce = true,
                _ => {}
            }
        }
        let rank = sts[0].shape().len();
        if sts.iter().any(|st| st.shape().len() != rank) {
            return Err(Error::IrViolation {
                msg: "ast views disagree on rank".into(),
                uops: format!("{:?}", sts.iter().map(|s| s.shape()).collect::<Vec<_>>()),
            });
        }
        let mut k = Kernel {
            target,
            ast: ast.clone(),
            sts,
            site_of,
            has_reduce,
            group_for_reduce: vec![],
            upcasted: 0,
            local_dims: 0,
            tc: None,
        };
        // move all reduce axes behind the output axes
        let full = k.full_shape();
        let out = k.sts[0].shape().to_vec();
        let mut perm: Vec<usize> = (0..rank).filter(|&i| out[i] == full[i]).collect();
        perm.extend((0..rank).filter(|&i| out[i] != full[i]));
        k.reshape_and_permute(None, Some(&perm))?;
        k.simplify_ones()?;
        k.simplify_merge_adjacent()?;
        Ok(k)
    }

    fn shape_len(&self) -> usize {
        self.sts[0].shape().len()
    }

    fn full_shape(&self) -> Vec<i64> {
        let rank = self.shape_len();
        (0..rank)
            .map(|i| self.sts.iter().map(|st| st.shape()[i]).max().unwrap())
            .collect()
    }

    fn first_reduce(&self) -> usize {
        let full = self.full_shape();
        let out = self.sts[0].shape();
        (0..self.shape_len())
            .find(|&i| out[i] != full[i])
            .unwrap_or(self.shape_len())
    }

    fn classes(&self) -> Vec<AxisClass> {
        let len = self.shape_len();
        let first_upcast = len - self.upcasted;
        let first_reduce = self.first_reduce().min(first_upcast);
        let group = self.group_for_reduce.len();
        (0..len)
            .map(|i| {
                if i >= first_upcast {
                    AxisClass::Upcast
                } else if i < first_reduce.saturating_sub(self.local_dims) {
                    AxisClass::Global
                } else if i < first_reduce {
                    AxisClass::Local
                } else if i < first_reduce + group {
                    AxisClass::GroupReduce
                } else {
                    AxisClass::Reduce
                }
            })
            .collect()
    }

    fn reshape_and_permute(
        &mut self,
        new_shape: Option<&dyn Fn(&[i64]) -> Vec<i64>>,
        perm: Option<&[usize]>,
    ) -> Result<()> {
        for st in &mut self.sts {
            if let Some(f) = new_shape {
                *st = st.reshape(&f(st.shape()))?;
            }
            if let Some(p) = perm {
                *st = st.permute(p)?;
            }
        }
        Ok(())
    }

    /// Drop axes that are 1 in every view, keeping at least one axis.
    fn simplify_ones(&mut self) -> Result<()> {
        let len = self.shape_len();
        if len == 0 {
            return Ok(());
        }
        let full = self.full_shape();
        let mut ones: Vec<bool> = full.iter().map(|s| *s == 1).collect();
        if ones.iter().all(|o| *o) {
            ones[len - 1] = false;
        }
        if !ones.iter().any(|o| *o) {
            return Ok(());
        }
        self.reshape_and_permute(
            Some(&|shape: &[i64]| {
                shape
                    .iter()
                    .zip(&ones)
                    .filter(|(_, o)| !**o)
                    .map(|(s, _)| *s)
                    .collect()
            }),
            None,
        )
    }

    /// Collapse neighbouring axes whose strides compose consistently in
    /// every view. Never merges across the reduce boundary.
    fn simplify_merge_adjacent(&mut self) -> Result<()> {
        let len = self.shape_len();
        if len <= 1 {
            return Ok(());
        }
        let first_reduce = self.first_reduce();
        let shapes: Vec<Vec<i64>> = self.sts.iter().map(|st| st.shape().to_vec()).collect();
        let strides: Vec<Vec<i64>> = self
            .sts
            .iter()
            .map(|st| st.top_strides().to_vec())
            .collect();
        // grouped (shape, stride) runs per view
        let mut rets: Vec<Vec<(i64, i64)>> = shapes
            .iter()
            .zip(&strides)
            .map(|(sh, st)| vec![(sh[0], st[0])])
            .collect();
        for i in 1..len {
            let mergeable = i != first_reduce
                && self.sts.iter().all(|st| st.views.len() == 1)
                && (0..self.sts.len()).all(|j| {
                    let (ps, pst) = *rets[j].last().unwrap();
                    let (s, st) = (shapes[j][i], strides[j][i]);
                    (st != 0 && pst == s * st) || (st == 0 && pst == 0) || (ps == 1 && pst == 0)
                });
            for (j, ret) in rets.iter_mut().enumerate() {
                let (s, st) = (shapes[j][i], strides[j][i]);
                if mergeable {
                    let last = ret.last_mut().unwrap();
                    *last = (last.0 * s, st);
                } else {
                    ret.push((s, st));
                }
            }
        }
        if rets[0].len() == len {
            return Ok(());
        }
        for (st, ret) in self.sts.iter_mut().zip(&rets) {
            let shape: Vec<i64> = ret.iter().map(|(s, _)| *s).collect();
            *st = st.reshape(&shape)?;
        }
        Ok(())
    }

    /// Split `axis` by `amount` and move the new axis to `insert_before`
    /// (defaults to the end). `top` keeps the `amount` part at the original
    /// position.
    fn shift_to(
        &mut self,
        axis: usize,
        amount: i64,
        top: bool,
        insert_before: Option<usize>,
    ) -> Result<()> {
        let len = self.shape_len();
        let mut insert_before = insert_before.unwrap_or(len);
        let move_axis = if top { axis } else { axis + 1 };
        if move_axis < insert_before {
            insert_before += 1;
        }
        let mut perm: Vec<usize> = (0..insert_before).filter(|i| *i != move_axis).collect();
        perm.push(move_axis);
        perm.extend((insert_before..len + 1).filter(|i| *i != move_axis));
        self.reshape_and_permute(
            Some(&|shape: &[i64]| {
                let mut out = shape[..axis].to_vec();
                if shape[axis] > 1 {
                    if top {
                        out.extend([amount, shape[axis] / amount]);
                    } else {
                        out.extend([shape[axis] / amount, amount]);
                    }
                } else {
                    out.extend([1, 1]);
                }
                out.extend(&shape[axis + 1..]);
                out
            }),
            Some(&perm),
        )
    }

    fn upcast(&mut self) -> Result<()> {
        if self.full_shape()[self.shape_len() - 1] == 1 {
            return Err(Error::IrViolation {
                msg: "cannot upcast a unit axis".into(),
                uops: String::new(),
            });
        }
        self.upcasted += 1;
        Ok(())
    }

    /// The optional lowering heuristics: reduction grouping, tensor cores,
    /// float4 output upcasting, small-reduce unrolling, local assignment.
    pub fn hand_coded_optimizations(&mut self) -> Result<()> {
        if self.try_tensor_cores()? {
            return Ok(());
        }

        // group-for-reduce: split the reduction across workgroup lanes when
        // the output is small enough that one thread per output would idle
        // the device
        let first_reduce = self.first_reduce();
        if self.target.has_local && self.has_reduce && first_reduce <= 2 {
            let out_elems: i64 = self.full_shape()[..first_reduce].iter().product();
            if out_elems <= 2048 {
                let candidates: &[i64] = if out_elems <= 32 { &[256, 16] } else { &[16] };
                for &sz in candidates {
                    let ok = self.full_shape()[first_reduce] % sz == 0
                        && self
                            .sts
                            .iter()
                            .all(|st| st.shape()[first_reduce] % sz == 0 || st.shape()[first_reduce] == 1);
                    if ok {
                        self.shift_to(first_reduce, sz, true, Some(first_reduce))?;
                        self.group_for_reduce.push(sz);
                        break;
                    }
                }
            }
        }

        // unroll a short trailing reduction
        if self.has_reduce && self.group_for_reduce.is_empty() {
            let last = self.shape_len() - self.upcasted - 1;
            if last >= self.first_reduce() + self.group_for_reduce.len()
                && self.full_shape()[last] <= 5
            {
                self.upcast()?;
            }
        }

        // float4 on the output axis for pure elementwise kernels
        if self.target.supports_float4 && !self.has_reduce && self.group_for_reduce.is_empty() {
            let last = self.shape_len() - self.upcasted - 1;
            let ok = self.full_shape()[last] % 4 == 0
                && self.sts.iter().all(|st| {
                    st.views.len() == 1 && matches!(st.top_strides()[last], 0 | 1)
                })
                && self.sts.iter().all(|st| !st.needs_valid());
            if ok {
                self.shift_to(last, 4, false, None)?;
                self.upcast()?;
            }
        }

        // one trailing local axis for elementwise kernels
        if self.target.has_local && !self.has_reduce && self.group_for_reduce.is_empty() {
            let first_upcast = self.shape_len() - self.upcasted;
            if first_upcast >= 2 && self.full_shape()[first_upcast - 1] <= 256 {
                self.local_dims = 1;
            }
        }
        Ok(())
    }

    /// Tensor-core detection: a sum over `k` of a multiply whose operands
    /// have the right dtype, with dims divisible by the tc shape. Restructures
    /// the shape so the `n` and `k` tiles become upcast axes the WMMA
    /// contraction consumes.
    fn try_tensor_cores(&mut self) -> Result<bool> {
        let Some(tc) = self.target.tensor_cores.first().cloned() else {
            return Ok(false);
        };
        if !self.has_reduce || !self.group_for_reduce.is_empty() {
            return Ok(false);
        }
        // the reduce source must be exactly a mul at the right dtype
        let store = &self.ast.src[0];
        let mut red = None;
        for u in store.parents() {
            if u.op == UOpKind::Reduce {
                red = Some(u);
            }
        }
        let Some(red) = red else { return Ok(false) };
        if red.arg != UOpArg::Reduce(ReduceKind::Sum)
            && !matches!(red.arg, UOpArg::ReduceAxis(ReduceKind::Sum, _))
        {
            return Ok(false);
        }
        let body = &red.src[0];
        if body.alu_op() != Some(AluOp::Mul) || body.dtype != Some(tc.dtype_in) {
            return Ok(false);
        }
        let first_reduce = self.first_reduce();
        let len = self.shape_len();
        if first_reduce < 2 || len - first_reduce != 1 {
            return Ok(false);
        }
        let full = self.full_shape();
        let (m_ax, n_ax, k_ax) = (first_reduce - 2, first_reduce - 1, first_reduce);
        if full[m_ax] % tc.dims.0 != 0 || full[n_ax] % tc.dims.1 != 0 || full[k_ax] % tc.dims.2 != 0
        {
            return Ok(false);
        }
        // the n tile becomes an upcast axis; its lanes ride through the
        // contraction as one thread slice
        self.shift_to(n_ax, tc.dims.1, false, None)?;
        self.upcast()?;
        self.tc = Some(WmmaArg {
            name: format!("wmma_{}x{}x{}", tc.dims.0, tc.dims.1, tc.dims.2),
            dims: tc.dims,
            dtype_in: tc.dtype_in,
            dtype_out: tc.dtype_out,
        });
        Ok(true)
    }

    pub fn name_base(&self) -> String {
        let prefix = if self.has_reduce { "re_" } else { "ew_" };
        let dims: Vec<String> = self.full_shape().iter().map(|s| s.to_string()).collect();
        format!("{prefix}{}", dims.join("_"))
    }

    /// Lower the AST to a SINK-rooted UOp graph.
    pub fn lower(mut self) -> Result<Lowered> {
        let g = UOpGraph::new();
        let classes = self.classes();
        let full = self.full_shape();
        let len = self.shape_len();

        // per-axis index uops
        let mut idxs: Vec<UOpRef> = Vec::with_capacity(len);
        let (mut n_g, mut n_l) = (0usize, 0usize);
        for i in 0..len {
            let size = full[i];
            let u = match classes[i] {
                AxisClass::Global => {
                    if self.target.has_local {
                        n_g += 1;
                        g.add(
                            UOpKind::Special,
                            Some(DType::I32),
                            vec![],
                            UOpArg::Special {
                                name: format!("gidx{}", n_g - 1),
                                size,
                            },
                        )
                    } else {
                        g.add(
                            UOpKind::Range,
                            Some(DType::I32),
                            vec![g.cint(0), g.cint(size)],
                            UOpArg::Range {
                                id: i,
                                is_reduce: false,
                            },
                        )
                    }
                }
                AxisClass::Local | AxisClass::GroupReduce => {
                    n_l += 1;
                    g.add(
                        UOpKind::Special,
                        Some(DType::I32),
                        vec![],
                        UOpArg::Special {
                            name: format!("lidx{}", n_l - 1),
                            size,
                        },
                    )
                }
                AxisClass::Reduce => g.add(
                    UOpKind::Range,
                    Some(DType::I32),
                    vec![g.cint(0), g.cint(size)],
                    UOpArg::Range {
                        id: i,
                        is_reduce: true,
                    },
                ),
                AxisClass::Upcast => {
                    let lanes: Vec<UOpRef> = (0..size).map(|j| g.cint(j)).collect();
                    g.add(
                        UOpKind::Expand,
                        Some(DType::I32),
                        lanes,
                        UOpArg::Axes(vec![(i, size)]),
                    )
                }
            };
            idxs.push(u);
        }

        let mut lower = Lowering {
            k: &self,
            g: &g,
            classes: &classes,
            full: &full,
            idxs: &idxs,
            cache: HashMap::new(),
            local_count: 0,
        };
        let store = self.ast.src[0].clone();
        let stored = lower.lower_store(&store)?;
        let sink = g.sink(vec![stored]);
        debug!(name = %self.name_base(), "lowered kernel");
        Ok(Lowered {
            name_base: self.name_base(),
            graph: g,
            sink,
        })
    }
}

struct Lowering<'a, 'b> {
    k: &'a Kernel<'b>,
    g: &'a UOpGraph,
    classes: &'a [AxisClass],
    full: &'a [i64],
    idxs: &'a [UOpRef],
    cache: HashMap<u64, UOpRef>,
    local_count: usize,
}

impl<'a, 'b> Lowering<'a, 'b> {
    /// Symbolic index/valid for a site's tracker over the given index uops.
    fn st_to_uops(&self, st: &ShapeTracker, idxs: &[UOpRef]) -> (UOpRef, UOpRef) {
        let shape = st.shape();
        let vars: Vec<Node> = shape
            .iter()
            .enumerate()
            .map(|(i, s)| Node::var(format!("i{i}"), 0, s - 1))
            .collect();
        let (idx, valid) = st.expr_idxs(&vars);
        let env: HashMap<String, UOpRef> = (0..shape.len())
            .map(|i| (format!("i{i}"), idxs[i].clone()))
            .collect();
        (self.node_to_uop(&idx, &env), self.node_to_bool(&valid, &env))
    }

    fn node_to_uop(&self, n: &Node, env: &HashMap<String, UOpRef>) -> UOpRef {
        let g = self.g;
        match n {
            Node::Num(v) => g.cint(*v),
            Node::Var { name, .. } => env[name].clone(),
            Node::Sum(parts) => {
                let mut it = parts.iter();
                let first = self.node_to_uop(it.next().unwrap(), env);
                it.fold(first, |acc, p| g.iadd(acc, self.node_to_uop(p, env)))
            }
            Node::Mul(a, k) => {
                let au = self.node_to_uop(a, env);
                g.imul(au, g.cint(*k))
            }
            Node::Div(a, b) => {
                let au = self.node_to_uop(a, env);
                g.idiv(au, g.cint(*b))
            }
            Node::Mod(a, b) => {
                let au = self.node_to_uop(a, env);
                g.imod(au, g.cint(*b))
            }
            Node::Lt(a, b) => {
                let au = self.node_to_uop(a, env);
                g.alu(AluOp::CmpLt, DType::BOOL, vec![au, g.cint(*b)])
            }
            // a >= b  <=>  b-1 < a  on integers
            Node::Ge(a, b) => {
                let au = self.node_to_uop(a, env);
                g.alu(AluOp::CmpLt, DType::BOOL, vec![g.cint(*b - 1), au])
            }
            Node::And(parts) => {
                let mut it = parts.iter();
                let first = self.node_to_uop(it.next().unwrap(), env);
                it.fold(first, |acc, p| {
                    let pu = self.node_to_uop(p, env);
                    g.alu(AluOp::Mul, DType::BOOL, vec![acc, pu])
                })
            }
        }
    }

    fn node_to_bool(&self, n: &Node, env: &HashMap<String, UOpRef>) -> UOpRef {
        match n {
            Node::Num(v) => self.g.cbool(*v != 0),
            Node::Lt(..) | Node::Ge(..) | Node::And(..) => self.node_to_uop(n, env),
            other => {
                let u = self.node_to_uop(other, env);
                self.g
                    .alu(AluOp::CmpLt, DType::BOOL, vec![self.g.cint(0), u])
            }
        }
    }

    fn site_st(&self, u: &UOpRef) -> &ShapeTracker {
        &self.k.sts[self.k.site_of[&u.id]]
    }

    fn is_true(u: &UOpRef) -> bool {
        u.const_val().is_some_and(|c| c.as_bool())
    }

    /// Gated value: `valid ? v : 0`.
    fn gate_value(&self, v: UOpRef, valid: UOpRef, dtype: DType) -> UOpRef {
        if Self::is_true(&valid) {
            return v;
        }
        let zero = self.g.cnst(dtype, ConstVal::of(dtype, 0.0));
        self.g.alu(AluOp::Where, dtype, vec![valid, v, zero])
    }

    fn lower_store(&mut self, store: &UOpRef) -> Result<UOpRef> {
        let g = self.g;
        let buf = store.src[0].clone();
        debug_assert_eq!(buf.op, UOpKind::DefineGlobal);
        let out_buf = g.add(buf.op, buf.dtype, vec![], buf.arg.clone());
        let value_ast = store.src.last().unwrap().clone();
        let value = self.lower_value(&value_ast)?;
        let st = self.site_st(store).clone();
        let (idx, valid) = self.st_to_uops(&st, self.idxs);
        // under group-for-reduce only lane zero holds the final value
        let mut gate = valid;
        if let Some(gg) = self.group_store_gate() {
            gate = if Self::is_true(&gate) {
                gg
            } else {
                g.alu(AluOp::Mul, DType::BOOL, vec![gate, gg])
            };
        }
        let mut srcs = vec![out_buf, idx, value];
        if !Self::is_true(&gate) {
            srcs.push(gate);
        }
        Ok(g.add(UOpKind::Store, None, srcs, UOpArg::None))
    }

    /// Lowers the value tree under a store: everything above (and including)
    /// the at-most-one reduction per output path.
    fn lower_value(&mut self, u: &UOpRef) -> Result<UOpRef> {
        if let Some(hit) = self.cache.get(&u.id) {
            return Ok(hit.clone());
        }
        let out = match u.op {
            UOpKind::Reduce => self.lower_reduce(u)?,
            UOpKind::Alu | UOpKind::Cast => {
                let srcs = u
                    .src
                    .iter()
                    .map(|s| self.lower_value(s))
                    .collect::<Result<Vec<_>>>()?;
                self.rebuild(u, srcs)?
            }
            _ => self.lower_leaf(u, self.idxs)?,
        };
        self.cache.insert(u.id, out.clone());
        Ok(out)
    }

    fn rebuild(&mut self, u: &UOpRef, srcs: Vec<UOpRef>) -> Result<UOpRef> {
        let g = self.g;
        match u.op {
            UOpKind::Alu => Ok(g.add(UOpKind::Alu, u.dtype, srcs, u.arg.clone())),
            UOpKind::Cast => {
                let src = srcs.into_iter().next().unwrap();
                let dtype = u.dtype.unwrap();
                if src.dtype == Some(dtype) {
                    return Ok(src);
                }
                // bool sources widen through a select, not a C cast
                if src.dtype == Some(DType::BOOL) {
                    let one = g.cnst(dtype, ConstVal::of(dtype, 1.0));
                    let zero = g.cnst(dtype, ConstVal::of(dtype, 0.0));
                    return Ok(g.alu(AluOp::Where, dtype, vec![src, one, zero]));
                }
                Ok(g.cast(src, dtype))
            }
            _ => unreachable!(),
        }
    }

    /// Plain tree walk for subtrees that sit under a reduce (no grouping
    /// bookkeeping needed) or contain no reduce at all.
    fn lower_tree(&mut self, u: &UOpRef, idxs: &[UOpRef]) -> Result<UOpRef> {
        if let Some(hit) = self.cache.get(&u.id) {
            return Ok(hit.clone());
        }
        let out = match u.op {
            UOpKind::Alu | UOpKind::Cast => {
                let srcs = u
                    .src
                    .iter()
                    .map(|s| self.lower_tree(s, idxs))
                    .collect::<Result<Vec<_>>>()?;
                self.rebuild(u, srcs)?
            }
            _ => self.lower_leaf(u, idxs)?,
        };
        self.cache.insert(u.id, out.clone());
        Ok(out)
    }

    fn lower_leaf(&mut self, u: &UOpRef, idxs: &[UOpRef]) -> Result<UOpRef> {
        let g = self.g;
        match (&u.op, &u.arg) {
            (UOpKind::Const, UOpArg::Const(c)) => {
                let dtype = u.dtype.unwrap();
                let st = self.site_st(u).clone();
                let (_, valid) = self.st_to_uops(&st, idxs);
                Ok(self.gate_value(g.cnst(dtype, *c), valid, dtype))
            }
            (UOpKind::Load, UOpArg::Arange { start, step }) => {
                let dtype = u.dtype.unwrap();
                let st = self.site_st(u).clone();
                let (idx, valid) = self.st_to_uops(&st, idxs);
                let base = if dtype == DType::I32 {
                    idx
                } else {
                    g.cast(idx, dtype)
                };
                let stepped = g.alu(
                    AluOp::Mul,
                    dtype,
                    vec![base, g.cnst(dtype, *step)],
                );
                let val = g.alu(
                    AluOp::Add,
                    dtype,
                    vec![stepped, g.cnst(dtype, *start)],
                );
                Ok(self.gate_value(val, valid, dtype))
            }
            (UOpKind::Load, _) => {
                let dtype = u.dtype.unwrap();
                let buf_ast = &u.src[0];
                let buf = g.add(buf_ast.op, buf_ast.dtype, vec![], buf_ast.arg.clone());
                let st = self.site_st(u).clone();
                let (idx, valid) = self.st_to_uops(&st, idxs);
                let idx = if buf_ast.dtype.is_some_and(|d| d.is_image()) {
                    self.image_index(idx, buf_ast.dtype.unwrap())
                } else {
                    idx
                };
                let mut srcs = vec![buf, idx];
                if !Self::is_true(&valid) {
                    srcs.push(g.cnst(dtype, ConstVal::of(dtype, 0.0)));
                    srcs.push(valid);
                }
                Ok(g.add(UOpKind::Load, Some(dtype), srcs, UOpArg::None))
            }
            _ => Err(Error::IrViolation {
                msg: format!("unexpected ast node {:?} during lowering", u.op),
                uops: String::new(),
            }),
        }
    }

    /// Image buffers address as `(x, y, component)`; the rewriter collapses
    /// the triple into one 4-wide texel read.
    fn image_index(&self, idx: UOpRef, dtype: DType) -> UOpRef {
        let g = self.g;
        let (_, w) = dtype.image.unwrap();
        let texel = g.idiv(idx.clone(), g.cint(4));
        let x = g.imod(texel.clone(), g.cint(w as i64));
        let y = g.idiv(texel, g.cint(w as i64));
        let c = g.imod(idx, g.cint(4));
        g.add(
            UOpKind::Vectorize,
            Some(DType::I32.vec(3)),
            vec![x, y, c],
            UOpArg::None,
        )
    }

    fn reduce_axis_uops(&self, late: bool) -> Vec<UOpRef> {
        let mut out = Vec::new();
        for (i, class) in self.classes.iter().enumerate() {
            match class {
                AxisClass::Reduce => out.push(self.idxs[i].clone()),
                AxisClass::GroupReduce if late => out.push(self.idxs[i].clone()),
                AxisClass::Upcast => {
                    // unrolled reduce axes take part too
                    if self.k.sts[0].shape()[i] != self.full[i] {
                        out.push(self.idxs[i].clone());
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn group_store_gate(&self) -> Option<UOpRef> {
        let g = self.g;
        let mut gate: Option<UOpRef> = None;
        for (i, class) in self.classes.iter().enumerate() {
            if *class == AxisClass::GroupReduce {
                let is_zero = g.alu(
                    AluOp::CmpLt,
                    DType::BOOL,
                    vec![self.idxs[i].clone(), g.cint(1)],
                );
                gate = Some(match gate {
                    None => is_zero,
                    Some(prev) => g.alu(AluOp::Mul, DType::BOOL, vec![prev, is_zero]),
                });
            }
        }
        gate
    }

    fn lower_reduce(&mut self, u: &UOpRef) -> Result<UOpRef> {
        let g = self.g;
        let (kind, dtype) = match (&u.arg, u.dtype) {
            (UOpArg::ReduceAxis(kind, _), Some(d)) | (UOpArg::Reduce(kind), Some(d)) => {
                (*kind, d)
            }
            _ => {
                return Err(Error::IrViolation {
                    msg: "reduce without kind".into(),
                    uops: String::new(),
                })
            }
        };
        let body = self.lower_tree(&u.src[0], self.idxs)?;

        // tensor-core contraction path
        if let Some(tc) = self.k.tc.clone() {
            if let Some(w) = self.lower_wmma(&tc, &body, dtype)? {
                return Ok(w);
            }
        }

        let ranges = self.reduce_axis_uops(false);
        let first = g.add(
            UOpKind::Reduce,
            Some(dtype),
            std::iter::once(body).chain(ranges).collect(),
            UOpArg::Reduce(kind),
        );
        if self.k.group_for_reduce.is_empty() {
            return Ok(first);
        }

        // grouped reduction: park partials in local memory, fence, then one
        // lane re-reduces across the group
        let group_axes: Vec<usize> = self
            .classes
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == AxisClass::GroupReduce)
            .map(|(i, _)| i)
            .collect();
        let local_shape: Vec<i64> = (0..self.classes.len())
            .map(|i| {
                if group_axes.contains(&i) {
                    self.full[i]
                } else {
                    1
                }
            })
            .collect();
        let local_st = ShapeTracker::from_shape(&local_shape);
        let size: i64 = local_shape.iter().product();
        let name = format!("temp{}", self.local_count);
        self.local_count += 1;
        let deflocal = g.add(
            UOpKind::DefineLocal,
            Some(dtype),
            vec![],
            UOpArg::Local { name, size },
        );
        let (lidx, _) = self.st_to_uops(&local_st, self.idxs);
        let lstore = g.add(
            UOpKind::Store,
            None,
            vec![deflocal.clone(), lidx, first],
            UOpArg::None,
        );
        let barrier = g.add(UOpKind::Barrier, None, vec![lstore], UOpArg::None);

        let mut late_idxs = self.idxs.to_vec();
        for &a in &group_axes {
            late_idxs[a] = g.add(
                UOpKind::Range,
                Some(DType::I32),
                vec![g.cint(0), g.cint(self.full[a])],
                UOpArg::Range {
                    id: 1000 + a,
                    is_reduce: true,
                },
            );
        }
        let (late_lidx, _) = self.st_to_uops(&local_st, &late_idxs);
        let lload = g.add(
            UOpKind::Load,
            Some(dtype),
            vec![deflocal, late_lidx, barrier],
            UOpArg::None,
        );
        let late_ranges: Vec<UOpRef> = group_axes.iter().map(|a| late_idxs[*a].clone()).collect();
        Ok(g.add(
            UOpKind::Reduce,
            Some(dtype),
            std::iter::once(lload).chain(late_ranges).collect(),
            UOpArg::Reduce(kind),
        ))
    }

    /// Emit a WMMA for a reduce-of-mul whose n tile was upcast by
    /// `try_tensor_cores`. Both operands contract over the n lanes (the
    /// stationary side broadcasts); the result lanes come back as an EXPAND
    /// of GEPs and accumulate across the k loop.
    fn lower_wmma(&mut self, tc: &WmmaArg, body: &UOpRef, dtype: DType) -> Result<Option<UOpRef>> {
        let g = self.g;
        if body.alu_op() != Some(AluOp::Mul) {
            return Ok(None);
        }
        let n_lanes = tc.dims.1 as u8;
        let n_ax = self.classes.len() - 1;
        if self.classes[n_ax] != AxisClass::Upcast {
            return Ok(None);
        }
        let axes = UOpArg::Axes(vec![(n_ax, tc.dims.1)]);
        let a_c = g.add(
            UOpKind::Contract,
            Some(tc.dtype_in.vec(n_lanes)),
            vec![body.src[0].clone()],
            axes.clone(),
        );
        let b_c = g.add(
            UOpKind::Contract,
            Some(tc.dtype_in.vec(n_lanes)),
            vec![body.src[1].clone()],
            axes.clone(),
        );
        let zero = g.cnst(tc.dtype_out, ConstVal::of(tc.dtype_out, 0.0));
        let acc = g.add(
            UOpKind::Vectorize,
            Some(tc.dtype_out.vec(n_lanes)),
            vec![zero; n_lanes as usize],
            UOpArg::None,
        );
        let wmma = g.add(
            UOpKind::Wmma,
            Some(tc.dtype_out.vec(n_lanes)),
            vec![a_c, b_c, acc],
            UOpArg::Wmma(tc.clone()),
        );
        let lanes: Vec<UOpRef> = (0..n_lanes as usize).map(|i| g.gep(wmma.clone(), i)).collect();
        let ex = g.add(UOpKind::Expand, Some(dtype), lanes, axes);
        let ranges: Vec<UOpRef> = self
            .reduce_axis_uops(false)
            .into_iter()
            .filter(|r| r.op == UOpKind::Range)
            .collect();
        if ranges.is_empty() {
            return Ok(Some(ex));
        }
        Ok(Some(g.add(
            UOpKind::Reduce,
            Some(dtype),
            std::iter::once(ex).chain(ranges).collect(),
            UOpArg::Reduce(ReduceKind::Sum),
        )))
    }
}

/// Lower one scheduled AST for a target down to a UOp graph.
pub fn linearize(ast: &UOpRef, target: &TargetSpec, ctx: &CompileContext) -> Result<Lowered> {
    let mut kernel = Kernel::new(ast, target)?;
    if !ctx.no_opt {
        kernel.hand_coded_optimizations()?;
    }
    kernel.lower()
}
