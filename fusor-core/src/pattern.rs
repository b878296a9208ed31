use std::collections::HashMap;

use crate::dtype::DType;
use crate::uop::{UOpArg, UOpGraph, UOpKind, UOpRef};

/// Source-list matching mode. `Exact` is positional; `Prefix` allows unmatched
/// trailing sources (reduction patterns ignore the loop list); `Unordered`
/// tries every assignment and is what commutative ALU patterns use; `All`
/// requires every source to match one repeated pattern.
#[derive(Clone)]
pub enum SrcPat {
    Any,
    Exact(Vec<Pat>),
    Prefix(Vec<Pat>),
    Unordered(Vec<Pat>),
    All(Box<Pat>),
}

#[derive(Clone, Default)]
pub struct NodePat {
    pub ops: Option<Vec<UOpKind>>,
    pub dtypes: Option<Vec<DType>>,
    pub arg: Option<UOpArg>,
    pub src: Option<Box<SrcPat>>,
    pub name: Option<&'static str>,
}

/// A pattern tree over UOps with three wildcards: `Var` binds anything,
/// `CVar` binds a CONST, `Any` matches without binding. `ConstV` matches a
/// CONST of the given numeric value regardless of dtype.
#[derive(Clone)]
pub enum Pat {
    Node(NodePat),
    Var(&'static str),
    CVar(&'static str),
    ConstV(f64),
    Any,
}

impl Pat {
    pub fn op(op: UOpKind) -> NodePat {
        NodePat {
            ops: Some(vec![op]),
            ..NodePat::default()
        }
    }

    pub fn any_op(ops: &[UOpKind]) -> NodePat {
        NodePat {
            ops: Some(ops.to_vec()),
            ..NodePat::default()
        }
    }
}

impl NodePat {
    pub fn named(mut self, name: &'static str) -> NodePat {
        self.name = Some(name);
        self
    }

    pub fn dtypes(mut self, d: &[DType]) -> NodePat {
        self.dtypes = Some(d.to_vec());
        self
    }

    pub fn arg(mut self, a: UOpArg) -> NodePat {
        self.arg = Some(a);
        self
    }

    pub fn src(mut self, s: SrcPat) -> NodePat {
        self.src = Some(Box::new(s));
        self
    }

    pub fn pat(self) -> Pat {
        Pat::Node(self)
    }
}

pub type Bindings = HashMap<&'static str, UOpRef>;

fn bind(binds: &mut Bindings, name: &'static str, u: &UOpRef) -> bool {
    match binds.get(name) {
        Some(prev) => prev.id == u.id,
        None => {
            binds.insert(name, u.clone());
            true
        }
    }
}

fn match_src(pats: &[Pat], srcs: &[UOpRef], binds: &mut Bindings, unordered: bool) -> bool {
    if !unordered {
        return pats
            .iter()
            .zip(srcs)
            .all(|(p, s)| match_pat(p, s, binds));
    }
    // small arity; try assignments with backtracking
    fn rec(pats: &[Pat], srcs: &[UOpRef], used: &mut Vec<bool>, binds: &mut Bindings) -> bool {
        let Some(p) = pats.first() else { return true };
        for (i, s) in srcs.iter().enumerate() {
            if used[i] {
                continue;
            }
            let saved = binds.clone();
            if match_pat(p, s, binds) {
                used[i] = true;
                if rec(&pats[1..], srcs, used, binds) {
                    return true;
                }
                used[i] = false;
            }
            *binds = saved;
        }
        false
    }
    let mut used = vec![false; srcs.len()];
    rec(pats, srcs, &mut used, binds)
}

fn match_pat(pat: &Pat, u: &UOpRef, binds: &mut Bindings) -> bool {
    match pat {
        Pat::Any => true,
        Pat::Var(name) => bind(binds, name, u),
        Pat::CVar(name) => u.op == UOpKind::Const && bind(binds, name, u),
        Pat::ConstV(v) => u
            .const_val()
            .is_some_and(|c| c.as_f64() == *v),
        Pat::Node(np) => {
            if let Some(ops) = &np.ops {
                if !ops.contains(&u.op) {
                    return false;
                }
            }
            if let Some(dts) = &np.dtypes {
                match u.dtype {
                    Some(d) => {
                        if !dts.contains(&d) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            if let Some(arg) = &np.arg {
                if *arg != u.arg {
                    return false;
                }
            }
            if let Some(sp) = &np.src {
                match &**sp {
                    SrcPat::Any => {}
                    SrcPat::Exact(pats) => {
                        if pats.len() != u.src.len()
                            || !match_src(pats, &u.src, binds, false)
                        {
                            return false;
                        }
                    }
                    SrcPat::Prefix(pats) => {
                        if pats.len() > u.src.len()
                            || !match_src(pats, &u.src[..pats.len()], binds, false)
                        {
                            return false;
                        }
                    }
                    SrcPat::Unordered(pats) => {
                        if pats.len() != u.src.len()
                            || !match_src(pats, &u.src, binds, true)
                        {
                            return false;
                        }
                    }
                    SrcPat::All(pat) => {
                        if !u.src.iter().all(|s| match_pat(pat, s, binds)) {
                            return false;
                        }
                    }
                }
            }
            if let Some(name) = np.name {
                return bind(binds, name, u);
            }
            true
        }
    }
}

/// Builder: gets the binding map and the owning graph; `None` means
/// "doesn't apply", which is never an error.
pub type Builder = Box<dyn Fn(&Bindings, &UOpGraph) -> Option<UOpRef>>;

pub struct PatternMatcher {
    rules: Vec<(Pat, Builder)>,
    // rule indices bucketed by root op; None holds op-wildcard rules
    by_op: HashMap<Option<UOpKind>, Vec<usize>>,
}

impl PatternMatcher {
    pub fn new(rules: Vec<(Pat, Builder)>) -> PatternMatcher {
        let mut by_op: HashMap<Option<UOpKind>, Vec<usize>> = HashMap::new();
        for (i, (pat, _)) in rules.iter().enumerate() {
            match pat {
                Pat::Node(np) if np.ops.is_some() => {
                    for op in np.ops.as_ref().unwrap() {
                        by_op.entry(Some(*op)).or_default().push(i);
                    }
                }
                _ => by_op.entry(None).or_default().push(i),
            }
        }
        PatternMatcher { rules, by_op }
    }

    pub fn concat(mut self, other: PatternMatcher) -> PatternMatcher {
        let offset = self.rules.len();
        self.rules.extend(other.rules);
        for (op, idxs) in other.by_op {
            let bucket = self.by_op.entry(op).or_default();
            bucket.extend(idxs.into_iter().map(|i| i + offset));
            bucket.sort_unstable();
        }
        self
    }

    /// First matching rule whose builder returns `Some` wins; rules apply in
    /// declaration order.
    pub fn rewrite(&self, u: &UOpRef, g: &UOpGraph) -> Option<UOpRef> {
        let empty = Vec::new();
        let specific = self.by_op.get(&Some(u.op)).unwrap_or(&empty);
        let wild = self.by_op.get(&None).unwrap_or(&empty);
        let (mut i, mut j) = (0usize, 0usize);
        loop {
            let idx = match (specific.get(i), wild.get(j)) {
                (Some(&a), Some(&b)) => {
                    if a < b {
                        i += 1;
                        a
                    } else {
                        j += 1;
                        b
                    }
                }
                (Some(&a), None) => {
                    i += 1;
                    a
                }
                (None, Some(&b)) => {
                    j += 1;
                    b
                }
                (None, None) => return None,
            };
            let (pat, builder) = &self.rules[idx];
            let mut binds = Bindings::new();
            if match_pat(pat, u, &mut binds) {
                if let Some(out) = builder(&binds, g) {
                    return Some(out);
                }
            }
        }
    }
}

/// Memoised post-order rewriting to a fixed point, with an explicit work
/// stack so deep graphs can't overflow the call stack. Rewritten nodes are
/// themselves re-processed until no rule fires.
pub fn graph_rewrite(root: &UOpRef, pm: &PatternMatcher, g: &UOpGraph) -> UOpRef {
    enum Task {
        Visit(UOpRef),
        Rebuild(UOpRef),
        Alias(UOpRef, UOpRef),
    }
    let mut out = root.clone();
    // outer loop: a full pass that changes nothing is the fixed point
    loop {
        let mut replace: HashMap<u64, UOpRef> = HashMap::new();
        let mut stack = vec![Task::Visit(out.clone())];
        while let Some(task) = stack.pop() {
            match task {
                Task::Visit(u) => {
                    if replace.contains_key(&u.id) {
                        continue;
                    }
                    stack.push(Task::Rebuild(u.clone()));
                    for s in &u.src {
                        stack.push(Task::Visit(s.clone()));
                    }
                }
                Task::Rebuild(u) => {
                    if replace.contains_key(&u.id) {
                        continue;
                    }
                    let new_src: Vec<UOpRef> =
                        u.src.iter().map(|s| replace[&s.id].clone()).collect();
                    let x = if new_src.iter().zip(&u.src).all(|(a, b)| a.id == b.id) {
                        u.clone()
                    } else {
                        g.add(u.op, u.dtype, new_src, u.arg.clone())
                    };
                    match pm.rewrite(&x, g) {
                        Some(nx) if nx.id != x.id => {
                            stack.push(Task::Alias(u, nx.clone()));
                            stack.push(Task::Visit(nx));
                        }
                        _ => {
                            replace.insert(x.id, x.clone());
                            replace.insert(u.id, x);
                        }
                    }
                }
                Task::Alias(u, nx) => {
                    let resolved = replace[&nx.id].clone();
                    replace.insert(u.id, resolved);
                }
            }
        }
        let next = replace[&out.id].clone();
        if next.id == out.id {
            return next;
        }
        out = next;
    }
}
