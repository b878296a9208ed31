pub mod cstyle;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::uop::{AluOp, UOpArg, UOpGraph, UOpKind, UOpRef};

pub fn print_uops(uops: &[UOpRef]) -> String {
    let index: HashMap<u64, usize> = uops.iter().enumerate().map(|(i, u)| (u.id, i)).collect();
    let mut out = String::new();
    for (i, u) in uops.iter().enumerate() {
        let srcs: Vec<String> = u
            .src
            .iter()
            .map(|s| {
                index
                    .get(&s.id)
                    .map(|j| j.to_string())
                    .unwrap_or_else(|| "?".into())
            })
            .collect();
        let dt = u
            .dtype
            .map(|d| d.to_string())
            .unwrap_or_default();
        out.push_str(&format!(
            "{i:4} {:<14} {:<12} [{}] {:?}\n",
            format!("{:?}", u.op),
            dt,
            srcs.join(", "),
            u.arg
        ));
    }
    out
}

fn scope_stop(op: UOpKind) -> UOpKind {
    match op {
        UOpKind::Range => UOpKind::Phi,
        _ => UOpKind::Store,
    }
}

fn end_of(op: UOpKind) -> UOpKind {
    match op {
        UOpKind::Range => UOpKind::EndRange,
        _ => UOpKind::EndIf,
    }
}

/// Topologically order a rewritten UOp graph into the flat program the
/// emitters walk: a priority queue prefers children of open loops so their
/// ENDRANGE closes promptly, DEFINE_ACC hoists above its reduction loops,
/// and scope-closing ops are inserted at last use.
pub fn order_uops(sink: &UOpRef, g: &UOpGraph) -> Result<Vec<UOpRef>> {
    // consumer edges + in-degrees over the live graph
    let nodes = sink.parents();
    let by_id: HashMap<u64, UOpRef> = nodes.iter().map(|u| (u.id, u.clone())).collect();
    let mut children: HashMap<u64, Vec<u64>> = HashMap::new();
    let mut in_degree: HashMap<u64, usize> = HashMap::new();
    for u in &nodes {
        in_degree.insert(u.id, u.src.len());
        children.entry(u.id).or_default();
        for s in &u.src {
            children.entry(s.id).or_default().push(u.id);
        }
    }

    // transitive consumers of each scope-opening op, not walking past the
    // op that terminates the scope body
    let mut scope_children: HashMap<u64, HashSet<u64>> = HashMap::new();
    for u in &nodes {
        if !matches!(u.op, UOpKind::Range | UOpKind::If) {
            continue;
        }
        let stop = scope_stop(u.op);
        let mut seen: HashSet<u64> = HashSet::new();
        let mut stack: Vec<u64> = children[&u.id].clone();
        while let Some(c) = stack.pop() {
            if by_id[&c].op == UOpKind::Sink || !seen.insert(c) {
                continue;
            }
            if by_id[&c].op != stop {
                stack.extend(children[&c].iter().copied());
            }
        }
        scope_children.insert(u.id, seen);
    }

    let priority_of = |uid: u64| -> i64 {
        // declarations and literals float to the top so everything after
        // them (including hoisted accumulators) can refer to them
        let mut p = match by_id[&uid].op {
            UOpKind::Const
            | UOpKind::DefineGlobal
            | UOpKind::DefineLocal
            | UOpKind::Special => -2_000_000,
            _ => 0,
        };
        for (range_id, members) in &scope_children {
            if by_id[range_id].op == UOpKind::Range && members.contains(&uid) {
                p -= 1000;
            }
        }
        p
    };

    let mut queue: BinaryHeap<Reverse<(i64, u64)>> = BinaryHeap::new();
    for u in &nodes {
        if in_degree[&u.id] == 0 {
            queue.push(Reverse((priority_of(u.id), u.id)));
        }
    }

    let mut order: Vec<UOpRef> = Vec::with_capacity(nodes.len());
    let mut remaining = scope_children.clone();
    let mut scope_end: Vec<(u64, u64)> = Vec::new(); // (scope id, last member id)
    while let Some(Reverse((_, uid))) = queue.pop() {
        let u = by_id[&uid].clone();
        if u.op == UOpKind::DefineAcc {
            // initialise right before the earliest reduction loop it drives
            let idx = u
                .src
                .iter()
                .filter(|s| s.op == UOpKind::Range)
                .filter_map(|s| order.iter().position(|o| o.id == s.id))
                .min();
            match idx {
                Some(i) => order.insert(i, u.clone()),
                None => order.push(u.clone()),
            }
        } else {
            order.push(u.clone());
        }
        for (scope, members) in remaining.iter_mut() {
            if members.remove(&uid) && members.is_empty() {
                scope_end.push((*scope, uid));
            }
        }
        if let Some(members) = remaining.get(&uid) {
            if members.is_empty() {
                scope_end.push((uid, uid));
            }
        }
        for c in &children[&uid] {
            let d = in_degree.get_mut(c).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push(Reverse((priority_of(*c), *c)));
            }
        }
    }

    // close scopes after the last op inside them; outer scopes insert first
    // so inner ones land closer to their body
    scope_end.sort_by_key(|(scope, _)| order.iter().position(|o| o.id == *scope));
    for (scope, last) in scope_end {
        let su = by_id[&scope].clone();
        let pos = order
            .iter()
            .position(|o| o.id == last)
            .ok_or_else(|| Error::IrViolation {
                msg: "scope body vanished during ordering".into(),
                uops: print_uops(&order),
            })?;
        let end = g.add(end_of(su.op), None, vec![su], UOpArg::None);
        order.insert(pos + 1, end);
    }

    verify(&order)?;
    Ok(order)
}

/// Post-ordering invariants: SINK is the unique last op, no pre-render ops
/// survive, scopes nest, and dtypes are legal for their ops.
pub fn verify(uops: &[UOpRef]) -> Result<()> {
    let fail = |msg: String| -> Result<()> {
        Err(Error::IrViolation {
            msg,
            uops: print_uops(uops),
        })
    };
    if uops.last().map(|u| u.op) != Some(UOpKind::Sink) {
        return fail("program does not end with SINK".into());
    }
    let sinks = uops.iter().filter(|u| u.op == UOpKind::Sink).count();
    if sinks != 1 {
        return fail(format!("expected one SINK, found {sinks}"));
    }
    let mut open: Vec<&UOpRef> = Vec::new();
    for u in uops {
        match u.op {
            UOpKind::Expand | UOpKind::Contract | UOpKind::Reduce | UOpKind::View => {
                return fail(format!("forbidden op {:?} after rewriting", u.op));
            }
            UOpKind::Range | UOpKind::If => open.push(u),
            UOpKind::EndRange | UOpKind::EndIf => {
                let Some(top) = open.pop() else {
                    return fail(format!("unmatched {:?}", u.op));
                };
                if top.id != u.src[0].id {
                    return fail("scope close does not match innermost open".into());
                }
            }
            UOpKind::Alu => {
                let Some(op) = u.alu_op() else {
                    return fail("ALU without operator".into());
                };
                if u.src.len() != op.arity() {
                    return fail(format!("{op:?} arity mismatch"));
                }
                if matches!(op, AluOp::CmpLt | AluOp::CmpNe)
                    && u.dtype.map(|d| d.base) != Some(crate::dtype::Scalar::Bool)
                {
                    return fail(format!("{op:?} must produce bool"));
                }
            }
            UOpKind::DefineAcc => {
                if u.src.is_empty() || u.src[0].op != UOpKind::Const {
                    return fail("DEFINE_ACC must start from a CONST".into());
                }
            }
            UOpKind::Store => {
                if u.src.len() < 3 {
                    return fail("STORE needs buffer, index and value".into());
                }
            }
            _ => {}
        }
    }
    if let Some(u) = open.pop() {
        return fail(format!("unclosed scope {:?}", u.op));
    }
    Ok(())
}

/// Global/local launch dimensions from the SPECIAL ops of an ordered
/// program, fastest-varying dimension first.
pub fn launch_dims(uops: &[UOpRef]) -> (Vec<i64>, Vec<i64>) {
    let mut global = Vec::new();
    let mut local = Vec::new();
    for u in uops {
        if let (UOpKind::Special, UOpArg::Special { name, size }) = (&u.op, &u.arg) {
            if name.starts_with("gidx") {
                global.push(*size);
            } else {
                local.push(*size);
            }
        }
    }
    global.reverse();
    local.reverse();
    (global, local)
}
