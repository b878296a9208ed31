use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::dtype::{ConstVal, DType, Scalar};
use crate::shapetracker::ShapeTracker;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum UOpKind {
    DefineGlobal,
    DefineLocal,
    DefineAcc,
    Const,
    Special,
    Range,
    EndRange,
    Load,
    Store,
    Alu,
    Reduce,
    Gep,
    Vectorize,
    Cast,
    Bitcast,
    Wmma,
    If,
    EndIf,
    Barrier,
    Phi,
    Noop,
    Sink,
    // pre-render only
    View,
    Expand,
    Contract,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AluOp {
    // unary
    Neg,
    Recip,
    Sqrt,
    Exp2,
    Log2,
    Sin,
    // binary
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Max,
    Min,
    CmpLt,
    CmpNe,
    // ternary
    Where,
    MulAcc,
}

impl AluOp {
    pub fn arity(&self) -> usize {
        match self {
            AluOp::Neg | AluOp::Recip | AluOp::Sqrt | AluOp::Exp2 | AluOp::Log2 | AluOp::Sin => 1,
            AluOp::Where | AluOp::MulAcc => 3,
            _ => 2,
        }
    }

    /// Operand order doesn't matter; patterns may match these unordered.
    pub fn commutative(&self) -> bool {
        matches!(
            self,
            AluOp::Add | AluOp::Mul | AluOp::Max | AluOp::Min | AluOp::CmpNe
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ReduceKind {
    Sum,
    Max,
}

impl ReduceKind {
    pub fn alu(&self) -> AluOp {
        match self {
            ReduceKind::Sum => AluOp::Add,
            ReduceKind::Max => AluOp::Max,
        }
    }

    pub fn identity(&self, dtype: DType) -> ConstVal {
        match self {
            ReduceKind::Sum => ConstVal::of(dtype, 0.0),
            ReduceKind::Max => dtype.min_value(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct WmmaArg {
    pub name: String,
    pub dims: (i64, i64, i64),
    pub dtype_in: DType,
    pub dtype_out: DType,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum UOpArg {
    None,
    Const(ConstVal),
    Alu(AluOp),
    /// Post-linearize REDUCE: the loop RANGEs ride in `src[1..]`.
    Reduce(ReduceKind),
    /// AST-level reduction over named axes of the full shape.
    ReduceAxis(ReduceKind, Vec<usize>),
    /// Kernel argument slot; `writable` marks outputs.
    Buffer { index: usize, writable: bool },
    Local { name: String, size: i64 },
    Acc(usize),
    Special { name: String, size: i64 },
    Range { id: usize, is_reduce: bool },
    Arange { start: ConstVal, step: ConstVal },
    Gep(usize),
    /// Unrolled axes as (axis id, extent) pairs, sorted by axis id.
    Axes(Vec<(usize, i64)>),
    View(ShapeTracker),
    Wmma(WmmaArg),
}

/// One node of the typed micro-op DAG. Nodes are interned per [`UOpGraph`],
/// so within a graph structural equality is pointer equality and `id` gives
/// a stable creation order.
#[derive(Debug)]
pub struct UOp {
    pub op: UOpKind,
    pub dtype: Option<DType>,
    pub src: Vec<UOpRef>,
    pub arg: UOpArg,
    pub id: u64,
}

pub type UOpRef = Rc<UOp>;

impl UOp {
    pub fn const_val(&self) -> Option<ConstVal> {
        match (&self.op, &self.arg) {
            (UOpKind::Const, UOpArg::Const(c)) => Some(*c),
            _ => None,
        }
    }

    pub fn alu_op(&self) -> Option<AluOp> {
        match (&self.op, &self.arg) {
            (UOpKind::Alu, UOpArg::Alu(a)) => Some(*a),
            _ => None,
        }
    }

    pub fn view(&self) -> Option<&ShapeTracker> {
        match (&self.op, &self.arg) {
            (UOpKind::View, UOpArg::View(st)) => Some(st),
            _ => None,
        }
    }

    /// Conservative integer interval, when one can be derived. Drives the
    /// comparison-folding and max-folding rewrite rules.
    pub fn int_bounds(&self) -> Option<(i64, i64)> {
        match (&self.op, &self.arg) {
            (UOpKind::Const, UOpArg::Const(ConstVal::Int(n))) => Some((*n, *n)),
            (UOpKind::Const, UOpArg::Const(ConstVal::Bool(b))) => {
                Some((*b as i64, *b as i64))
            }
            (UOpKind::Special, UOpArg::Special { size, .. }) => Some((0, size - 1)),
            (UOpKind::Range, _) => {
                let lo = self.src[0].const_val()?.as_i64();
                let hi = self.src[1].const_val()?.as_i64();
                Some((lo, hi - 1))
            }
            (UOpKind::Alu, UOpArg::Alu(op)) => {
                let a = self.src[0].int_bounds()?;
                match op {
                    AluOp::Add => {
                        let b = self.src[1].int_bounds()?;
                        Some((a.0 + b.0, a.1 + b.1))
                    }
                    AluOp::Sub => {
                        let b = self.src[1].int_bounds()?;
                        Some((a.0 - b.1, a.1 - b.0))
                    }
                    AluOp::Mul => {
                        let b = self.src[1].int_bounds()?;
                        let c = [a.0 * b.0, a.0 * b.1, a.1 * b.0, a.1 * b.1];
                        Some((*c.iter().min().unwrap(), *c.iter().max().unwrap()))
                    }
                    AluOp::Div => {
                        let b = self.src[1].const_val()?.as_i64();
                        if b > 0 {
                            Some((a.0 / b, a.1 / b))
                        } else {
                            None
                        }
                    }
                    AluOp::Mod => {
                        let b = self.src[1].const_val()?.as_i64();
                        if b > 0 {
                            let lo = if a.0 >= 0 { 0 } else { a.0.max(-(b - 1)) };
                            Some((lo, a.1.min(b - 1)))
                        } else {
                            None
                        }
                    }
                    AluOp::Max => {
                        let b = self.src[1].int_bounds()?;
                        Some((a.0.max(b.0), a.1.max(b.1)))
                    }
                    AluOp::Min => {
                        let b = self.src[1].int_bounds()?;
                        Some((a.0.min(b.0), a.1.min(b.1)))
                    }
                    AluOp::CmpLt | AluOp::CmpNe => Some((0, 1)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Post-order walk of this node's dependency closure, each node once.
    pub fn parents(self: &UOpRef) -> Vec<UOpRef> {
        let mut seen: HashMap<u64, ()> = HashMap::new();
        let mut out = Vec::new();
        let mut stack: Vec<(UOpRef, bool)> = vec![(self.clone(), false)];
        while let Some((u, expanded)) = stack.pop() {
            if expanded {
                out.push(u);
                continue;
            }
            if seen.insert(u.id, ()).is_some() {
                continue;
            }
            stack.push((u.clone(), true));
            for s in u.src.iter().rev() {
                stack.push((s.clone(), false));
            }
        }
        out
    }
}

#[derive(PartialEq, Eq, Hash)]
struct UOpKey {
    op: UOpKind,
    dtype: Option<DType>,
    src: Vec<u64>,
    arg: UOpArg,
}

/// Owns every UOp of one kernel's lowering: a single intern table, released
/// when the graph drops.
pub struct UOpGraph {
    table: RefCell<HashMap<UOpKey, UOpRef>>,
    next_id: Cell<u64>,
}

impl Default for UOpGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl UOpGraph {
    pub fn new() -> UOpGraph {
        UOpGraph {
            table: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        }
    }

    pub fn add(
        &self,
        op: UOpKind,
        dtype: Option<DType>,
        src: Vec<UOpRef>,
        arg: UOpArg,
    ) -> UOpRef {
        let key = UOpKey {
            op,
            dtype,
            src: src.iter().map(|s| s.id).collect(),
            arg: arg.clone(),
        };
        if let Some(found) = self.table.borrow().get(&key) {
            return found.clone();
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let node = Rc::new(UOp {
            op,
            dtype,
            src,
            arg,
            id,
        });
        self.table.borrow_mut().insert(key, node.clone());
        node
    }

    pub fn cnst(&self, dtype: DType, v: ConstVal) -> UOpRef {
        self.add(UOpKind::Const, Some(dtype), vec![], UOpArg::Const(v))
    }

    pub fn cint(&self, v: i64) -> UOpRef {
        self.cnst(DType::I32, ConstVal::Int(v))
    }

    pub fn cbool(&self, v: bool) -> UOpRef {
        self.cnst(DType::BOOL, ConstVal::Bool(v))
    }

    pub fn alu(&self, op: AluOp, dtype: DType, src: Vec<UOpRef>) -> UOpRef {
        debug_assert_eq!(src.len(), op.arity());
        self.add(UOpKind::Alu, Some(dtype), src, UOpArg::Alu(op))
    }

    pub fn gep(&self, src: UOpRef, i: usize) -> UOpRef {
        let dtype = src.dtype.map(|d| d.scalar());
        self.add(UOpKind::Gep, dtype, vec![src], UOpArg::Gep(i))
    }

    pub fn cast(&self, src: UOpRef, dtype: DType) -> UOpRef {
        self.add(UOpKind::Cast, Some(dtype), vec![src], UOpArg::None)
    }

    pub fn sink(&self, stores: Vec<UOpRef>) -> UOpRef {
        self.add(UOpKind::Sink, None, stores, UOpArg::None)
    }

    // integer expression helpers used by index materialisation
    pub fn iadd(&self, a: UOpRef, b: UOpRef) -> UOpRef {
        self.alu(AluOp::Add, DType::I32, vec![a, b])
    }

    pub fn imul(&self, a: UOpRef, b: UOpRef) -> UOpRef {
        self.alu(AluOp::Mul, DType::I32, vec![a, b])
    }

    pub fn idiv(&self, a: UOpRef, b: UOpRef) -> UOpRef {
        self.alu(AluOp::Div, DType::I32, vec![a, b])
    }

    pub fn imod(&self, a: UOpRef, b: UOpRef) -> UOpRef {
        self.alu(AluOp::Mod, DType::I32, vec![a, b])
    }
}

/// Evaluate an ALU op over constant operands under `dtype` semantics.
/// Integer division and remainder truncate, exactly like the emitted C.
pub fn exec_alu(op: AluOp, dtype: DType, vals: &[ConstVal]) -> ConstVal {
    // comparisons look at the operands, not the (bool) result dtype
    if matches!(op, AluOp::CmpLt | AluOp::CmpNe) {
        if vals.iter().all(|v| v.is_intish()) {
            let (a, b) = (vals[0].as_i64(), vals[1].as_i64());
            return ConstVal::Bool(match op {
                AluOp::CmpLt => a < b,
                _ => a != b,
            });
        }
        let (a, b) = (vals[0].as_f64(), vals[1].as_f64());
        return ConstVal::Bool(match op {
            AluOp::CmpLt => a < b,
            _ => a != b,
        });
    }
    if dtype.base == Scalar::Bool {
        let b: Vec<bool> = vals.iter().map(ConstVal::as_bool).collect();
        let out = match op {
            AluOp::Add => b[0] | b[1],
            AluOp::Mul => b[0] & b[1],
            AluOp::Max => b[0] | b[1],
            AluOp::Min => b[0] & b[1],
            AluOp::Where => {
                if b[0] {
                    b[1]
                } else {
                    b[2]
                }
            }
            AluOp::Neg => !b[0],
            _ => panic!("bad bool alu {op:?}"),
        };
        return ConstVal::Bool(out);
    }
    if dtype.is_int() {
        let v: Vec<i64> = vals.iter().map(ConstVal::as_i64).collect();
        let out = match op {
            AluOp::Neg => -v[0],
            AluOp::Recip => {
                if v[0] != 0 {
                    1 / v[0]
                } else {
                    0
                }
            }
            AluOp::Sqrt => (v[0] as f64).sqrt() as i64,
            AluOp::Exp2 => (v[0] as f64).exp2() as i64,
            AluOp::Log2 => (v[0] as f64).log2() as i64,
            AluOp::Sin => (v[0] as f64).sin() as i64,
            AluOp::Add => v[0].wrapping_add(v[1]),
            AluOp::Sub => v[0].wrapping_sub(v[1]),
            AluOp::Mul => v[0].wrapping_mul(v[1]),
            AluOp::Div => {
                if v[1] != 0 {
                    v[0] / v[1]
                } else {
                    0
                }
            }
            AluOp::Mod => {
                if v[1] != 0 {
                    v[0] % v[1]
                } else {
                    0
                }
            }
            AluOp::Max => v[0].max(v[1]),
            AluOp::Min => v[0].min(v[1]),
            AluOp::CmpLt => return ConstVal::Bool(v[0] < v[1]),
            AluOp::CmpNe => return ConstVal::Bool(v[0] != v[1]),
            AluOp::Where => {
                if vals[0].as_bool() {
                    v[1]
                } else {
                    v[2]
                }
            }
            AluOp::MulAcc => v[0].wrapping_mul(v[1]).wrapping_add(v[2]),
        };
        return ConstVal::of_int(dtype, out);
    }
    let v: Vec<f64> = vals.iter().map(ConstVal::as_f64).collect();
    let out = match op {
        AluOp::Neg => -v[0],
        AluOp::Recip => 1.0 / v[0],
        AluOp::Sqrt => v[0].sqrt(),
        AluOp::Exp2 => v[0].exp2(),
        AluOp::Log2 => v[0].log2(),
        AluOp::Sin => v[0].sin(),
        AluOp::Add => v[0] + v[1],
        AluOp::Sub => v[0] - v[1],
        AluOp::Mul => v[0] * v[1],
        AluOp::Div => v[0] / v[1],
        AluOp::Mod => v[0] % v[1],
        AluOp::Max => v[0].max(v[1]),
        AluOp::Min => v[0].min(v[1]),
        AluOp::CmpLt => return ConstVal::Bool(v[0] < v[1]),
        AluOp::CmpNe => return ConstVal::Bool(v[0] != v[1]),
        AluOp::Where => {
            if vals[0].as_bool() {
                v[1]
            } else {
                v[2]
            }
        }
        AluOp::MulAcc => v[0] * v[1] + v[2],
    };
    ConstVal::of(dtype, out)
}

impl ConstVal {
    fn is_intish(&self) -> bool {
        matches!(self, ConstVal::Int(_) | ConstVal::Bool(_))
    }
}
