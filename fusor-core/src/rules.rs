use crate::dtype::{ConstVal, DType};
use crate::pattern::{Bindings, Builder, Pat, PatternMatcher, SrcPat};
use crate::uop::{exec_alu, AluOp, ReduceKind, UOpArg, UOpGraph, UOpKind, UOpRef};

fn alu_pat(op: AluOp, srcs: Vec<Pat>) -> Pat {
    let sp = if op.commutative() {
        SrcPat::Unordered(srcs)
    } else {
        SrcPat::Exact(srcs)
    };
    Pat::op(UOpKind::Alu).arg(UOpArg::Alu(op)).src(sp).pat()
}

fn alu_named(op: AluOp, srcs: Vec<Pat>, name: &'static str) -> Pat {
    let sp = if op.commutative() {
        SrcPat::Unordered(srcs)
    } else {
        SrcPat::Exact(srcs)
    };
    Pat::op(UOpKind::Alu)
        .arg(UOpArg::Alu(op))
        .src(sp)
        .named(name)
        .pat()
}

fn b(f: impl Fn(&Bindings, &UOpGraph) -> Option<UOpRef> + 'static) -> Builder {
    Box::new(f)
}

fn cval(u: &UOpRef) -> ConstVal {
    u.const_val().unwrap()
}

/// `u` divided exactly by `n`, if provable.
fn divides(u: &UOpRef, n: i64, g: &UOpGraph) -> Option<UOpRef> {
    if let Some(c) = u.const_val() {
        let v = c.as_i64();
        return (v % n == 0).then(|| g.cint(v / n));
    }
    match (u.alu_op(), u.src.as_slice()) {
        (Some(AluOp::Add), [a, bb]) => {
            let da = divides(a, n, g)?;
            let db = divides(bb, n, g)?;
            Some(g.iadd(da, db))
        }
        (Some(AluOp::Mul), [a, bb]) => {
            if let Some(c) = bb.const_val() {
                if c.as_i64() % n == 0 {
                    return Some(g.imul(a.clone(), g.cint(c.as_i64() / n)));
                }
            }
            if let Some(c) = a.const_val() {
                if c.as_i64() % n == 0 {
                    return Some(g.imul(bb.clone(), g.cint(c.as_i64() / n)));
                }
            }
            None
        }
        _ => None,
    }
}

fn contains(u: &UOpRef, needle: &UOpRef) -> bool {
    u.parents().iter().any(|p| p.id == needle.id)
}

/// Linear decomposition of an integer expression against one RANGE:
/// `expr = idx + m * rng`. Fails if the range occurs non-linearly.
fn split_linear(expr: &UOpRef, rng: &UOpRef, g: &UOpGraph) -> Option<(UOpRef, i64)> {
    if expr.id == rng.id {
        return Some((g.cint(0), 1));
    }
    if !contains(expr, rng) {
        return Some((expr.clone(), 0));
    }
    match (expr.alu_op(), expr.src.as_slice()) {
        (Some(AluOp::Add), [a, bb]) => {
            let (ia, ma) = split_linear(a, rng, g)?;
            let (ib, mb) = split_linear(bb, rng, g)?;
            if ma != 0 && mb != 0 {
                return None;
            }
            Some((g.iadd(ia, ib), ma + mb))
        }
        (Some(AluOp::Mul), [a, bb]) => {
            let c = bb.const_val().or_else(|| a.const_val())?.as_i64();
            let other = if bb.const_val().is_some() { a } else { bb };
            let (i, m) = split_linear(other, rng, g)?;
            if !matches!(i.const_val(), Some(c0) if c0.as_i64() == 0) {
                return None;
            }
            Some((g.cint(0), m * c))
        }
        _ => None,
    }
}

/// The arange pattern: a sum-reduction of `(idx + m*loop < c) ? mult : 0`
/// has the closed form `min(end, max(0, ceil((c - idx') / m'))) * mult`.
fn loop_collapse(root: &UOpRef, g: &UOpGraph) -> Option<UOpRef> {
    if root.arg != UOpArg::Reduce(ReduceKind::Sum) {
        return None;
    }
    let body = &root.src[0];
    if body.alu_op() != Some(AluOp::Where) {
        return None;
    }
    let (gate, mult, zero) = (&body.src[0], &body.src[1], &body.src[2]);
    if !zero.const_val().is_some_and(|c| c.as_f64() == 0.0) {
        return None;
    }
    if gate.alu_op() != Some(AluOp::CmpLt) {
        return None;
    }
    let (lhs, rhs) = (&gate.src[0], &gate.src[1]);
    let c = rhs.const_val()?.as_i64();
    // find the one reduction range the comparison walks
    for (ri, rng) in root.src[1..].iter().enumerate() {
        if rng.op != UOpKind::Range {
            continue;
        }
        let lo = rng.src[0].const_val()?.as_i64();
        let e = rng.src[1].const_val()?.as_i64();
        if lo != 0 {
            return None;
        }
        let Some((idx, m)) = split_linear(lhs, rng, g) else {
            continue;
        };
        if m == 0 {
            continue;
        }
        if root.src[1..]
            .iter()
            .enumerate()
            .any(|(j, r)| j != ri && r.op == UOpKind::Range && contains(lhs, r))
        {
            return None;
        }
        // negative steps reverse the loop first
        let (idx, m) = if m < 0 {
            (g.iadd(idx, g.cint(m * (e - 1))), -m)
        } else {
            (idx, m)
        };
        // count = min(e, max(0, ceildiv(c - idx, m)))
        let diff = g.alu(AluOp::Sub, DType::I32, vec![g.cint(c), idx]);
        let ceil = g.idiv(g.iadd(diff, g.cint(m - 1)), g.cint(m));
        let count = g.alu(AluOp::Max, DType::I32, vec![ceil, g.cint(0)]);
        let count = g.alu(AluOp::Min, DType::I32, vec![count, g.cint(e)]);
        let dtype = root.dtype.unwrap();
        let counted = if dtype == DType::I32 {
            count
        } else {
            g.cast(count, dtype)
        };
        let val = g.alu(AluOp::Mul, dtype, vec![counted, mult.clone()]);
        let rest: Vec<UOpRef> = root.src[1..]
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != ri)
            .map(|(_, r)| r.clone())
            .collect();
        return Some(g.add(
            UOpKind::Reduce,
            root.dtype,
            std::iter::once(val).chain(rest).collect(),
            root.arg.clone(),
        ));
    }
    None
}

/// Algebraic folding, strength reduction, load/store folding, vector
/// folding, loop collapse. Declaration order is normative.
pub fn folder() -> PatternMatcher {
    let mut rules: Vec<(Pat, Builder)> = Vec::new();

    // GEP of VECTORIZE picks the lane; GEP of a const is the const
    rules.push((
        Pat::op(UOpKind::Gep)
            .src(SrcPat::Exact(vec![Pat::op(UOpKind::Vectorize)
                .named("v")
                .pat()]))
            .named("root")
            .pat(),
        b(|m, _| {
            let UOpArg::Gep(i) = &m["root"].arg else {
                return None;
            };
            Some(m["v"].src[*i].clone())
        }),
    ));
    rules.push((
        Pat::op(UOpKind::Gep)
            .src(SrcPat::Exact(vec![Pat::CVar("c")]))
            .named("root")
            .pat(),
        b(|m, g| Some(g.cnst(m["root"].dtype?, cval(&m["c"])))),
    ));

    // casts: identity, of consts, and vectorize of one lane
    rules.push((
        Pat::op(UOpKind::Cast).src(SrcPat::Exact(vec![Pat::Var("x")])).named("root").pat(),
        b(|m, _| (m["root"].dtype == m["x"].dtype).then(|| m["x"].clone())),
    ));
    rules.push((
        Pat::op(UOpKind::Cast)
            .src(SrcPat::Exact(vec![Pat::CVar("c")]))
            .named("root")
            .pat(),
        b(|m, g| {
            let dt = m["root"].dtype?;
            if dt.count > 1 {
                return None;
            }
            Some(g.cnst(dt, ConstVal::of(dt, cval(&m["c"]).as_f64())))
        }),
    ));
    rules.push((
        Pat::op(UOpKind::Vectorize).named("root").pat(),
        b(|m, _| {
            let root = &m["root"];
            (root.src.len() == 1 && root.dtype == root.src[0].dtype)
                .then(|| root.src[0].clone())
        }),
    ));

    // conditionals
    rules.push((
        alu_pat(
            AluOp::Where,
            vec![Pat::CVar("gate"), Pat::Var("a"), Pat::Var("b")],
        ),
        b(|m, _| {
            Some(if cval(&m["gate"]).as_bool() {
                m["a"].clone()
            } else {
                m["b"].clone()
            })
        }),
    ));
    rules.push((
        alu_pat(AluOp::Where, vec![Pat::Any, Pat::Var("v"), Pat::Var("v")]),
        b(|m, _| Some(m["v"].clone())),
    ));

    // self folding
    rules.push((
        alu_named(AluOp::Add, vec![Pat::Var("x"), Pat::ConstV(0.0)], "root"),
        b(|m, _| Some(m["x"].clone())),
    ));
    rules.push((
        alu_named(AluOp::Mul, vec![Pat::Var("x"), Pat::ConstV(1.0)], "root"),
        b(|m, _| Some(m["x"].clone())),
    ));
    rules.push((
        alu_named(AluOp::Mul, vec![Pat::Var("x"), Pat::ConstV(0.0)], "root"),
        b(|m, g| {
            let dt = m["root"].dtype?;
            Some(g.cnst(dt, ConstVal::of(dt, 0.0)))
        }),
    ));
    rules.push((
        alu_named(AluOp::Sub, vec![Pat::Var("x"), Pat::Var("x")], "root"),
        b(|m, g| {
            let dt = m["root"].dtype?;
            Some(g.cnst(dt, ConstVal::of(dt, 0.0)))
        }),
    ));
    rules.push((
        alu_named(AluOp::Div, vec![Pat::Var("x"), Pat::Var("x")], "root"),
        b(|m, g| {
            let dt = m["root"].dtype?;
            Some(g.cnst(dt, ConstVal::of(dt, 1.0)))
        }),
    ));
    rules.push((
        alu_pat(AluOp::Div, vec![Pat::Var("x"), Pat::ConstV(1.0)]),
        b(|m, _| Some(m["x"].clone())),
    ));

    // two-stage const folding
    rules.push((
        alu_named(
            AluOp::Add,
            vec![
                alu_pat(AluOp::Add, vec![Pat::Var("x"), Pat::CVar("c1")]),
                Pat::CVar("c2"),
            ],
            "root",
        ),
        b(|m, g| {
            let dt = m["root"].dtype?;
            let c = exec_alu(AluOp::Add, dt, &[cval(&m["c1"]), cval(&m["c2"])]);
            Some(g.alu(AluOp::Add, dt, vec![m["x"].clone(), g.cnst(dt, c)]))
        }),
    ));
    rules.push((
        alu_named(
            AluOp::Mul,
            vec![
                alu_pat(AluOp::Mul, vec![Pat::Var("x"), Pat::CVar("c1")]),
                Pat::CVar("c2"),
            ],
            "root",
        ),
        b(|m, g| {
            let dt = m["root"].dtype?;
            let c = exec_alu(AluOp::Mul, dt, &[cval(&m["c1"]), cval(&m["c2"])]);
            Some(g.alu(AluOp::Mul, dt, vec![m["x"].clone(), g.cnst(dt, c)]))
        }),
    ));

    // integer strength reduction, mirroring the symbolic layer
    rules.push((
        alu_pat(AluOp::Mod, vec![Pat::Var("x"), Pat::ConstV(1.0)]),
        b(|m, g| {
            let dt = m["x"].dtype?;
            dt.is_int().then(|| g.cnst(dt, ConstVal::Int(0)))
        }),
    ));
    rules.push((
        alu_pat(AluOp::Mod, vec![Pat::Var("x"), Pat::CVar("c")]),
        b(|m, _| {
            let c = cval(&m["c"]).as_i64();
            let (lo, hi) = m["x"].int_bounds()?;
            (c > 0 && lo >= 0 && hi < c).then(|| m["x"].clone())
        }),
    ));
    rules.push((
        alu_pat(AluOp::Div, vec![Pat::Var("x"), Pat::CVar("c")]),
        b(|m, g| {
            let c = cval(&m["c"]).as_i64();
            let dt = m["x"].dtype?;
            let (lo, hi) = m["x"].int_bounds()?;
            (c > 0 && lo / c == hi / c).then(|| g.cnst(dt, ConstVal::Int(lo / c)))
        }),
    ));
    rules.push((
        alu_pat(AluOp::Div, vec![Pat::Var("x"), Pat::CVar("c")]),
        b(|m, g| {
            let c = cval(&m["c"]).as_i64();
            if c <= 0 {
                return None;
            }
            divides(&m["x"], c, g)
        }),
    ));
    // (x*c0)//c1 reduces by the gcd
    rules.push((
        alu_pat(
            AluOp::Div,
            vec![
                alu_pat(AluOp::Mul, vec![Pat::Var("x"), Pat::CVar("c0")]),
                Pat::CVar("c1"),
            ],
        ),
        b(|m, g| {
            let (c0, c1) = (cval(&m["c0"]).as_i64(), cval(&m["c1"]).as_i64());
            if c0 <= 0 || c1 <= 0 {
                return None;
            }
            let gcd = {
                let (mut a, mut bb) = (c0, c1);
                while bb != 0 {
                    let t = a % bb;
                    a = bb;
                    bb = t;
                }
                a
            };
            if gcd <= 1 {
                return None;
            }
            let num = g.imul(m["x"].clone(), g.cint(c0 / gcd));
            Some(g.idiv(num, g.cint(c1 / gcd)))
        }),
    ));
    // (x//c0)//c1 -> x//(c0*c1)
    rules.push((
        alu_pat(
            AluOp::Div,
            vec![
                alu_pat(AluOp::Div, vec![Pat::Var("x"), Pat::CVar("c0")]),
                Pat::CVar("c1"),
            ],
        ),
        b(|m, g| {
            let (c0, c1) = (cval(&m["c0"]).as_i64(), cval(&m["c1"]).as_i64());
            (c0 > 0 && c1 > 0).then(|| g.idiv(m["x"].clone(), g.cint(c0 * c1)))
        }),
    ));

    // comparison folding through interval analysis
    rules.push((
        alu_named(AluOp::CmpLt, vec![Pat::Var("x"), Pat::Var("y")], "root"),
        b(|m, g| {
            let (xl, xh) = m["x"].int_bounds()?;
            let (yl, yh) = m["y"].int_bounds()?;
            if xh < yl {
                Some(g.cbool(true))
            } else if xl >= yh {
                Some(g.cbool(false))
            } else {
                None
            }
        }),
    ));
    // (c0 + x) < c1  ->  x < c1 - c0
    rules.push((
        alu_pat(
            AluOp::CmpLt,
            vec![
                alu_pat(AluOp::Add, vec![Pat::Var("x"), Pat::CVar("c0")]),
                Pat::CVar("c1"),
            ],
        ),
        b(|m, g| {
            let dt = m["x"].dtype?;
            if !dt.is_int() {
                return None;
            }
            let c = cval(&m["c1"]).as_i64() - cval(&m["c0"]).as_i64();
            Some(g.alu(
                AluOp::CmpLt,
                DType::BOOL,
                vec![m["x"].clone(), g.cint(c)],
            ))
        }),
    ));
    // max folding via bounds
    rules.push((
        alu_pat(AluOp::Max, vec![Pat::Var("x"), Pat::Var("y")]),
        b(|m, _| {
            let (xl, xh) = m["x"].int_bounds()?;
            let (yl, yh) = m["y"].int_bounds()?;
            if xl >= yh {
                Some(m["x"].clone())
            } else if xh <= yl {
                Some(m["y"].clone())
            } else {
                None
            }
        }),
    ));
    rules.push((
        alu_pat(AluOp::Min, vec![Pat::Var("x"), Pat::Var("y")]),
        b(|m, _| {
            let (xl, xh) = m["x"].int_bounds()?;
            let (yl, yh) = m["y"].int_bounds()?;
            if xh <= yl {
                Some(m["x"].clone())
            } else if xl >= yh {
                Some(m["y"].clone())
            } else {
                None
            }
        }),
    ));

    // general constant folding; sits after the targeted rules
    rules.push((
        Pat::op(UOpKind::Alu).named("root").pat(),
        b(|m, g| {
            let root = &m["root"];
            let dt = root.dtype?;
            if dt.count > 1 {
                return None;
            }
            let vals: Option<Vec<ConstVal>> =
                root.src.iter().map(|s| s.const_val()).collect();
            let vals = vals?;
            Some(g.cnst(dt, exec_alu(root.alu_op()?, dt, &vals)))
        }),
    ));

    // load/store folding
    rules.push((
        Pat::op(UOpKind::Store)
            .src(SrcPat::Exact(vec![
                Pat::Var("buf"),
                Pat::Var("idx"),
                Pat::op(UOpKind::Load)
                    .src(SrcPat::Exact(vec![Pat::Var("buf"), Pat::Var("idx")]))
                    .pat(),
            ]))
            .pat(),
        b(|_, g| Some(g.add(UOpKind::Noop, None, vec![], UOpArg::None))),
    ));
    rules.push((
        Pat::op(UOpKind::Load)
            .src(SrcPat::Exact(vec![
                Pat::Var("buf"),
                Pat::Var("idx"),
                Pat::Var("alt"),
                Pat::CVar("gate"),
            ]))
            .named("root")
            .pat(),
        b(|m, g| {
            Some(if cval(&m["gate"]).as_bool() {
                g.add(
                    UOpKind::Load,
                    m["root"].dtype,
                    vec![m["buf"].clone(), m["idx"].clone()],
                    UOpArg::None,
                )
            } else {
                m["alt"].clone()
            })
        }),
    ));
    rules.push((
        Pat::op(UOpKind::Store)
            .src(SrcPat::Exact(vec![
                Pat::Var("buf"),
                Pat::Var("idx"),
                Pat::Var("val"),
                Pat::CVar("gate"),
            ]))
            .pat(),
        b(|m, g| {
            Some(if cval(&m["gate"]).as_bool() {
                g.add(
                    UOpKind::Store,
                    None,
                    vec![m["buf"].clone(), m["idx"].clone(), m["val"].clone()],
                    UOpArg::None,
                )
            } else {
                g.add(UOpKind::Noop, None, vec![], UOpArg::None)
            })
        }),
    ));

    // reductions: arange collapse, loop-invariant bodies, spent reductions
    rules.push((
        Pat::op(UOpKind::Reduce).named("root").pat(),
        b(|m, g| loop_collapse(&m["root"], g)),
    ));
    rules.push((
        Pat::op(UOpKind::Reduce).named("root").pat(),
        b(|m, g| {
            // a body no reduction range feeds is just repeated
            let root = &m["root"];
            if root.arg != UOpArg::Reduce(ReduceKind::Sum) || root.src.len() < 2 {
                return None;
            }
            let val = &root.src[0];
            let ranges: Vec<UOpRef> = root.src[1..]
                .iter()
                .filter(|r| r.op == UOpKind::Range)
                .cloned()
                .collect();
            if ranges.len() != root.src.len() - 1 {
                return None;
            }
            if ranges.iter().any(|r| contains(val, r)) {
                return None;
            }
            let dt = root.dtype?;
            let mut total = 1i64;
            for r in &ranges {
                total *= r.src[1].const_val()?.as_i64() - r.src[0].const_val()?.as_i64();
            }
            Some(g.alu(
                AluOp::Mul,
                dt,
                vec![val.clone(), g.cnst(dt, ConstVal::of(dt, total as f64))],
            ))
        }),
    ));
    rules.push((
        Pat::op(UOpKind::Reduce).src(SrcPat::Exact(vec![Pat::Var("x")])).pat(),
        b(|m, _| Some(m["x"].clone())),
    ));

    // WMMA with a hard-zero operand is its accumulator
    rules.push((
        Pat::op(UOpKind::Wmma)
            .src(SrcPat::Exact(vec![
                Pat::ConstV(0.0),
                Pat::Any,
                Pat::Var("acc"),
            ]))
            .pat(),
        b(|m, _| Some(m["acc"].clone())),
    ));
    rules.push((
        Pat::op(UOpKind::Wmma)
            .src(SrcPat::Exact(vec![
                Pat::Any,
                Pat::ConstV(0.0),
                Pat::Var("acc"),
            ]))
            .pat(),
        b(|m, _| Some(m["acc"].clone())),
    ));

    // an accumulator with no controlling loop is its initial value, and a
    // phi over a constant is just its update
    rules.push((
        Pat::op(UOpKind::DefineAcc)
            .src(SrcPat::Exact(vec![Pat::CVar("c")]))
            .pat(),
        b(|m, _| Some(m["c"].clone())),
    ));
    rules.push((
        Pat::op(UOpKind::Phi)
            .src(SrcPat::Exact(vec![Pat::CVar("_c"), Pat::Var("x")]))
            .pat(),
        b(|m, _| Some(m["x"].clone())),
    ));

    // sinks drop NOOP children
    rules.push((
        Pat::op(UOpKind::Sink).named("root").pat(),
        b(|m, g| {
            let root = &m["root"];
            let kept: Vec<UOpRef> = root
                .src
                .iter()
                .filter(|s| s.op != UOpKind::Noop)
                .cloned()
                .collect();
            (kept.len() != root.src.len())
                .then(|| g.add(UOpKind::Sink, None, kept, UOpArg::None))
        }),
    ));

    PatternMatcher::new(rules)
}

/// Vector load/store folding for float4-capable targets.
pub fn float4_folding() -> PatternMatcher {
    let mut rules: Vec<(Pat, Builder)> = Vec::new();

    fn expand_consts(ex: &UOpRef) -> Option<usize> {
        if ex.op != UOpKind::Expand {
            return None;
        }
        let n = ex.src.len();
        if !(n == 2 || n == 4) {
            return None;
        }
        for (i, s) in ex.src.iter().enumerate() {
            if s.const_val()?.as_i64() != i as i64 {
                return None;
            }
        }
        Some(n)
    }

    // LOAD(buf, base + EXPAND(0..n)) -> EXPAND(GEP(vec LOAD))
    rules.push((
        Pat::op(UOpKind::Load)
            .src(SrcPat::Exact(vec![
                Pat::Var("buf"),
                alu_pat(
                    AluOp::Add,
                    vec![Pat::Var("base"), Pat::op(UOpKind::Expand).named("ex").pat()],
                ),
            ]))
            .named("root")
            .pat(),
        b(|m, g| {
            let n = expand_consts(&m["ex"])?;
            let dt = m["root"].dtype?;
            if dt.count > 1 || !dt.is_float() {
                return None;
            }
            divides(&m["base"], n as i64, g)?;
            let vec_load = g.add(
                UOpKind::Load,
                Some(dt.vec(n as u8)),
                vec![m["buf"].clone(), m["base"].clone()],
                UOpArg::None,
            );
            let lanes: Vec<UOpRef> = (0..n).map(|i| g.gep(vec_load.clone(), i)).collect();
            let UOpArg::Axes(axes) = &m["ex"].arg else {
                return None;
            };
            Some(g.add(
                UOpKind::Expand,
                Some(dt),
                lanes,
                UOpArg::Axes(axes.clone()),
            ))
        }),
    ));

    // STORE(buf, base + EXPAND(0..n), val) -> STORE(buf, base, CONTRACT(val))
    rules.push((
        Pat::op(UOpKind::Store)
            .src(SrcPat::Exact(vec![
                Pat::Var("buf"),
                alu_pat(
                    AluOp::Add,
                    vec![Pat::Var("base"), Pat::op(UOpKind::Expand).named("ex").pat()],
                ),
                Pat::Var("val"),
            ]))
            .pat(),
        b(|m, g| {
            let n = expand_consts(&m["ex"])?;
            let dt = m["val"].dtype?;
            if dt.count > 1 || !dt.is_float() {
                return None;
            }
            divides(&m["base"], n as i64, g)?;
            let UOpArg::Axes(axes) = &m["ex"].arg else {
                return None;
            };
            let con = g.add(
                UOpKind::Contract,
                Some(dt.vec(n as u8)),
                vec![m["val"].clone()],
                UOpArg::Axes(axes.clone()),
            );
            Some(g.add(
                UOpKind::Store,
                None,
                vec![m["buf"].clone(), m["base"].clone(), con],
                UOpArg::None,
            ))
        }),
    ));

    PatternMatcher::new(rules)
}

/// Image-buffer lowering: `(x, y, component)` index triples become one
/// 4-wide texel read with lane select.
pub fn image_folding() -> PatternMatcher {
    let mut rules: Vec<(Pat, Builder)> = Vec::new();

    rules.push((
        Pat::op(UOpKind::Load)
            .src(SrcPat::Prefix(vec![
                Pat::Var("buf"),
                Pat::op(UOpKind::Vectorize)
                    .src(SrcPat::Exact(vec![
                        Pat::Var("x"),
                        Pat::Var("y"),
                        Pat::Var("c"),
                    ]))
                    .named("vidx")
                    .pat(),
            ]))
            .named("root")
            .pat(),
        b(|m, g| {
            let root = &m["root"];
            let dt = root.dtype?;
            if dt.count > 1 || !m["buf"].dtype.is_some_and(|d| d.is_image()) {
                return None;
            }
            if m["vidx"].dtype != Some(DType::I32.vec(3)) {
                return None;
            }
            let xy = g.add(
                UOpKind::Vectorize,
                Some(DType::I32.vec(2)),
                vec![m["x"].clone(), m["y"].clone()],
                UOpArg::None,
            );
            let mut srcs = vec![m["buf"].clone(), xy];
            if root.src.len() >= 4 {
                // the out-of-range alternative widens to a full texel
                let alt = g.add(
                    UOpKind::Vectorize,
                    Some(dt.vec(4)),
                    vec![root.src[2].clone(); 4],
                    UOpArg::None,
                );
                srcs.push(alt);
                srcs.push(root.src[3].clone());
            }
            let texel = g.add(UOpKind::Load, Some(dt.vec(4)), srcs, UOpArg::None);
            // select the component: start from lane 0 and swap in lane i
            // when c == i
            let mut out = g.gep(texel.clone(), 0);
            for i in 1..4usize {
                let ne = g.alu(
                    AluOp::CmpNe,
                    DType::BOOL,
                    vec![m["c"].clone(), g.cint(i as i64)],
                );
                let lane = g.gep(texel.clone(), i);
                out = g.alu(AluOp::Where, dt, vec![ne, out, lane]);
            }
            Some(out)
        }),
    ));

    PatternMatcher::new(rules)
}

fn expand_axes(u: &UOpRef) -> Vec<(usize, i64)> {
    match &u.arg {
        UOpArg::Axes(a) => a.clone(),
        _ => vec![],
    }
}

fn axes_index(axes: &[(usize, i64)], choice: &std::collections::HashMap<usize, i64>) -> usize {
    let mut idx = 0usize;
    let mut mul = 1usize;
    for (axis, m) in axes.iter().rev() {
        idx += choice[axis] as usize * mul;
        mul *= *m as usize;
    }
    idx
}

fn axes_choices(axes: &[(usize, i64)]) -> Vec<std::collections::HashMap<usize, i64>> {
    let mut out = vec![std::collections::HashMap::new()];
    for (axis, m) in axes {
        let mut next = Vec::with_capacity(out.len() * *m as usize);
        for choice in &out {
            for v in 0..*m {
                let mut c = choice.clone();
                c.insert(*axis, v);
                next.push(c);
            }
        }
        out = next;
    }
    out
}

/// EXPAND distribution over scalar ops: one copy of the op per lane choice.
fn do_expand(root: &UOpRef, g: &UOpGraph) -> Option<UOpRef> {
    let expands: Vec<&UOpRef> = root.src.iter().filter(|s| s.op == UOpKind::Expand).collect();
    if expands.is_empty() {
        return None;
    }
    let mut axes: Vec<(usize, i64)> = vec![];
    for &ex in &expands {
        for a in expand_axes(ex) {
            if !axes.contains(&a) {
                axes.push(a);
            }
        }
    }
    axes.sort_unstable();
    let mut new_srcs = Vec::new();
    for choice in axes_choices(&axes) {
        let srcs: Vec<UOpRef> = root
            .src
            .iter()
            .map(|s| {
                if s.op == UOpKind::Expand {
                    let sa = expand_axes(s);
                    s.src[axes_index(&sa, &choice)].clone()
                } else {
                    s.clone()
                }
            })
            .collect();
        new_srcs.push(g.add(root.op, root.dtype, srcs, root.arg.clone()));
    }
    Some(g.add(
        UOpKind::Expand,
        root.dtype,
        new_srcs,
        UOpArg::Axes(axes),
    ))
}

/// REDUCE of an EXPAND over axes disjoint from its reduction: the expand
/// commutes outward, one reduction per lane.
fn reduce_before_expand(root: &UOpRef, g: &UOpGraph) -> Option<UOpRef> {
    if root.src[0].op != UOpKind::Expand {
        return None;
    }
    let ex = &root.src[0];
    let reduce_expand_axes: Vec<usize> = root.src[1..]
        .iter()
        .filter(|s| s.op == UOpKind::Expand)
        .flat_map(|s| expand_axes(s).into_iter().map(|(a, _)| a))
        .collect();
    let ex_axes = expand_axes(ex);
    if ex_axes.iter().any(|(a, _)| reduce_expand_axes.contains(a)) {
        return None;
    }
    let lanes: Vec<UOpRef> = ex
        .src
        .iter()
        .map(|lane| {
            g.add(
                UOpKind::Reduce,
                root.dtype,
                std::iter::once(lane.clone())
                    .chain(root.src[1..].iter().cloned())
                    .collect(),
                root.arg.clone(),
            )
        })
        .collect();
    Some(g.add(
        UOpKind::Expand,
        root.dtype,
        lanes,
        UOpArg::Axes(ex_axes),
    ))
}

/// REDUCE to DEFINE_ACC + PHI. Unrolled reduction lanes fold into a
/// sequential ALU chain on the accumulator.
fn do_reduce(root: &UOpRef, g: &UOpGraph) -> Option<UOpRef> {
    let UOpArg::Reduce(kind) = &root.arg else {
        return None;
    };
    let kind = *kind;
    let dtype = root.dtype?;
    let val = &root.src[0];
    let ranges: Vec<UOpRef> = root.src[1..]
        .iter()
        .filter(|s| s.op == UOpKind::Range)
        .cloned()
        .collect();
    let expands: Vec<UOpRef> = root.src[1..]
        .iter()
        .filter(|s| s.op == UOpKind::Expand)
        .cloned()
        .collect();
    let init = g.cnst(dtype, kind.identity(dtype));
    let acc = g.add(
        UOpKind::DefineAcc,
        Some(dtype),
        std::iter::once(init).chain(ranges.iter().cloned()).collect(),
        UOpArg::Acc(root.id as usize),
    );
    let alu = kind.alu();
    let mut ret = acc.clone();
    if !expands.is_empty() && val.op == UOpKind::Expand {
        for lane in &val.src {
            ret = g.alu(alu, dtype, vec![ret, lane.clone()]);
        }
    } else if !expands.is_empty() && kind == ReduceKind::Sum {
        // a lane-invariant body still sums once per unrolled lane
        let lanes: i64 = expands
            .iter()
            .flat_map(|e| match &e.arg {
                UOpArg::Axes(a) => a.clone(),
                _ => vec![],
            })
            .map(|(_, m)| m)
            .product();
        let total = g.alu(
            AluOp::Mul,
            dtype,
            vec![val.clone(), g.cnst(dtype, ConstVal::of(dtype, lanes as f64))],
        );
        ret = g.alu(alu, dtype, vec![ret, total]);
    } else {
        ret = g.alu(alu, dtype, vec![ret, val.clone()]);
    }
    if ranges.is_empty() {
        // no loop: the chain itself is the reduction
        return Some(ret);
    }
    Some(g.add(UOpKind::Phi, Some(dtype), vec![acc, ret], UOpArg::None))
}

/// CONTRACT gathers expand lanes into a vector; contracting something that
/// never expanded just broadcasts it.
fn do_contract(root: &UOpRef, g: &UOpGraph) -> Option<UOpRef> {
    let con_axes = expand_axes(root);
    let dtype = root.dtype?;
    let ex = &root.src[0];
    if ex.op != UOpKind::Expand
        || !con_axes.iter().all(|a| expand_axes(ex).contains(a))
    {
        let lanes = vec![root.src[0].clone(); dtype.count as usize];
        return Some(g.add(UOpKind::Vectorize, Some(dtype), lanes, UOpArg::None));
    }
    let ex_axes = expand_axes(ex);
    let keep: Vec<(usize, i64)> = ex_axes
        .iter()
        .filter(|a| !con_axes.contains(a))
        .cloned()
        .collect();
    let mut outs = Vec::new();
    for kc in axes_choices(&keep) {
        let mut lanes = Vec::new();
        for cc in axes_choices(&con_axes) {
            let mut choice = kc.clone();
            choice.extend(cc);
            lanes.push(ex.src[axes_index(&ex_axes, &choice)].clone());
        }
        outs.push(g.add(UOpKind::Vectorize, Some(dtype), lanes, UOpArg::None));
    }
    if outs.len() == 1 {
        return Some(outs.pop().unwrap());
    }
    Some(g.add(UOpKind::Expand, Some(dtype), outs, UOpArg::Axes(keep)))
}

/// The expander: eliminates EXPAND/CONTRACT/REDUCE ahead of rendering.
pub fn expander() -> PatternMatcher {
    let mut rules: Vec<(Pat, Builder)> = Vec::new();

    // an EXPAND with no axes is its single lane
    rules.push((
        Pat::op(UOpKind::Expand).named("root").pat(),
        b(|m, _| {
            let root = &m["root"];
            (expand_axes(root).is_empty() && root.src.len() == 1)
                .then(|| root.src[0].clone())
        }),
    ));

    // reductions first commute with foreign expands, then lower to acc/phi
    rules.push((
        Pat::op(UOpKind::Reduce).named("root").pat(),
        b(|m, g| reduce_before_expand(&m["root"], g)),
    ));
    rules.push((
        Pat::op(UOpKind::Reduce).named("root").pat(),
        b(|m, g| do_reduce(&m["root"], g)),
    ));

    // scalar ops distribute over expand lanes
    rules.push((
        Pat::any_op(&[
            UOpKind::Alu,
            UOpKind::Cast,
            UOpKind::Bitcast,
            UOpKind::Gep,
            UOpKind::Load,
            UOpKind::Store,
            UOpKind::Vectorize,
            UOpKind::Wmma,
        ])
        .named("root")
        .pat(),
        b(|m, g| do_expand(&m["root"], g)),
    ));

    rules.push((
        Pat::op(UOpKind::Contract).named("root").pat(),
        b(|m, g| do_contract(&m["root"], g)),
    ));

    // sinks flatten expanded stores
    rules.push((
        Pat::op(UOpKind::Sink).named("root").pat(),
        b(|m, g| {
            let root = &m["root"];
            if !root.src.iter().any(|s| s.op == UOpKind::Expand) {
                return None;
            }
            let mut kept = Vec::new();
            for s in &root.src {
                if s.op == UOpKind::Expand {
                    kept.extend(s.src.iter().cloned());
                } else {
                    kept.push(s.clone());
                }
            }
            Some(g.add(UOpKind::Sink, None, kept, UOpArg::None))
        }),
    ));

    PatternMatcher::new(rules)
}
