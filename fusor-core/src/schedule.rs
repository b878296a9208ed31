use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;
use std::rc::Rc;

use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::buffer::Buffer;
use crate::context::CompileContext;
use crate::device::{Device, DeviceRegistry, Program};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, Op, OpKind};
use crate::linearize::linearize;
use crate::pattern::graph_rewrite;
use crate::render::cstyle::{dialect_for, finalize_name, render};
use crate::render::order_uops;
use crate::rules;
use crate::shapetracker::ShapeTracker;
use crate::uop::{UOpArg, UOpGraph, UOpKind, UOpRef};

/// One kernel worth of work: a SINK-rooted AST plus its buffer interface.
pub struct ScheduledKernel {
    pub ast_graph: Rc<UOpGraph>,
    pub ast: UOpRef,
    pub outputs: Vec<NodeId>,
    pub inputs: Vec<NodeId>,
    pub device: Device,
}

/// A pure-reshape movement chain (contiguous, same element count) realises
/// as its root's buffer; both nodes then share the storage.
fn store_root(graph: &Graph, mut id: NodeId) -> NodeId {
    loop {
        let node = graph.node(id);
        if node.is_realized() || node.kind != OpKind::Movement || !node.st.contiguous() {
            return id;
        }
        let Op::Movement(_, src) = &node.op else {
            return id;
        };
        if node.st.size() != graph.node(*src).st.size() {
            return id;
        }
        id = *src;
    }
}

fn is_compute(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Unary | OpKind::Binary | OpKind::Ternary | OpKind::Reduce | OpKind::Contract
    )
}

struct Scheduler<'a> {
    graph: &'a Graph,
    cuts: HashSet<NodeId>,
}

impl<'a> Scheduler<'a> {
    /// Kernel boundaries: realisation targets, shared compute, reductions
    /// that cannot legally fuse further, and explicit contiguity barriers.
    fn find_cuts(&mut self, roots: &[NodeId]) -> Result<()> {
        // reachability + user counts over the unrealised graph
        let mut users: HashMap<NodeId, usize> = HashMap::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.graph.node(id);
            if node.is_realized() {
                continue;
            }
            for src in node.op.srcs() {
                *users.entry(src).or_insert(0) += 1;
                stack.push(src);
            }
        }

        self.cuts.extend(roots.iter().copied());
        for id in &seen {
            let node = self.graph.node(*id);
            if node.is_realized() {
                continue;
            }
            if matches!(node.op, Op::Contiguous(_)) {
                self.cuts.insert(*id);
            }
            if is_compute(node.kind) && users.get(id).copied().unwrap_or(0) > 1 {
                self.cuts.insert(*id);
            }
        }

        // reductions can't nest inside a kernel, sit behind a non-trivial
        // view, or share a kernel with a sibling reduction
        loop {
            let before = self.cuts.len();
            for root in self.cuts.clone() {
                let mut found: Vec<NodeId> = Vec::new();
                self.walk_region(root, root, false, false, &mut found);
                if found.len() > 1 {
                    found.sort_by(|a, b| self.graph.cmp(*a, *b));
                    for extra in &found[1..] {
                        self.cuts.insert(*extra);
                    }
                }
            }
            if self.cuts.len() == before {
                break;
            }
        }
        Ok(())
    }

    /// Walk one kernel region collecting reductions that would fuse into it;
    /// reductions that may not fuse are cut on the spot.
    fn walk_region(
        &mut self,
        id: NodeId,
        root: NodeId,
        in_reduce: bool,
        viewed: bool,
        found: &mut Vec<NodeId>,
    ) {
        let node = self.graph.node(id);
        if node.is_realized() || (id != root && self.cuts.contains(&id)) {
            return;
        }
        match &node.op {
            Op::Movement(_, src) => {
                self.walk_region(*src, root, in_reduce, true, found);
            }
            Op::Reduce(_, src, _) => {
                if in_reduce || viewed {
                    self.cuts.insert(id);
                    return;
                }
                found.push(id);
                self.walk_region(*src, root, true, false, found);
            }
            other => {
                for src in other.srcs() {
                    self.walk_region(src, root, in_reduce, viewed, found);
                }
            }
        }
    }

    /// Dependency edges between cut nodes (through their inline regions).
    fn region_inputs(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(root, true)];
        while let Some((id, is_root)) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.graph.node(id);
            if !is_root && (node.is_realized() || self.cuts.contains(&id)) {
                out.push(id);
                continue;
            }
            for src in node.op.srcs() {
                stack.push((src, false));
            }
        }
        out
    }
}

/// AST emission for one cut node.
struct AstBuilder<'a> {
    graph: &'a Graph,
    cuts: &'a HashSet<NodeId>,
    g: Rc<UOpGraph>,
    inputs: Vec<NodeId>,
}

impl<'a> AstBuilder<'a> {
    fn compose(node_st: &ShapeTracker, ctx: &ShapeTracker) -> ShapeTracker {
        let mut views = node_st.views.clone();
        views.extend(ctx.views.iter().cloned());
        ShapeTracker { views }.simplify()
    }

    fn input_index(&mut self, id: NodeId) -> usize {
        if let Some(i) = self.inputs.iter().position(|x| *x == id) {
            return i;
        }
        self.inputs.push(id);
        self.inputs.len() - 1
    }

    fn load_input(&mut self, id: NodeId, ctx: &ShapeTracker) -> UOpRef {
        let node = self.graph.node(id);
        let st = Self::compose(&node.st, ctx);
        let index = self.input_index(id) + 1;
        let buf = self.g.add(
            UOpKind::DefineGlobal,
            Some(node.dtype),
            vec![],
            UOpArg::Buffer {
                index,
                writable: false,
            },
        );
        let view = self
            .g
            .add(UOpKind::View, None, vec![], UOpArg::View(st));
        self.g
            .add(UOpKind::Load, Some(node.dtype), vec![buf, view], UOpArg::None)
    }

    fn build(&mut self, id: NodeId, root: NodeId, ctx: &ShapeTracker) -> Result<UOpRef> {
        let node = self.graph.node(id);
        if node.is_realized() || (id != root && self.cuts.contains(&id)) {
            return Ok(self.load_input(id, ctx));
        }
        let g = self.g.clone();
        match node.op.clone() {
            Op::Buffer => Err(Error::UnsupportedOp {
                target: "scheduler",
                op: "source buffer was never given data".into(),
            }),
            Op::Fill(v) => {
                let st = Self::compose(&node.st, ctx);
                let view = g.add(UOpKind::View, None, vec![], UOpArg::View(st));
                Ok(g.add(
                    UOpKind::Const,
                    Some(node.dtype),
                    vec![view],
                    UOpArg::Const(v),
                ))
            }
            Op::Arange { start, step } => {
                let st = Self::compose(&node.st, ctx);
                let view = g.add(UOpKind::View, None, vec![], UOpArg::View(st));
                Ok(g.add(
                    UOpKind::Load,
                    Some(node.dtype),
                    vec![view],
                    UOpArg::Arange { start, step },
                ))
            }
            // as a kernel root this is just a copy through the view
            Op::Contiguous(src) => self.build_through(src, ctx),
            Op::Cast(src) => {
                let s = self.build(src, root, ctx)?;
                Ok(g.add(UOpKind::Cast, Some(node.dtype), vec![s], UOpArg::None))
            }
            Op::Unary(alu, a) => {
                let sa = self.build(a, root, ctx)?;
                Ok(g.add(
                    UOpKind::Alu,
                    Some(node.dtype),
                    vec![sa],
                    UOpArg::Alu(alu),
                ))
            }
            Op::Binary(alu, a, b) => {
                let sa = self.build(a, root, ctx)?;
                let sb = self.build(b, root, ctx)?;
                Ok(g.add(
                    UOpKind::Alu,
                    Some(node.dtype),
                    vec![sa, sb],
                    UOpArg::Alu(alu),
                ))
            }
            Op::Ternary(alu, a, b, c) => {
                let sa = self.build(a, root, ctx)?;
                let sb = self.build(b, root, ctx)?;
                let sc = self.build(c, root, ctx)?;
                Ok(g.add(
                    UOpKind::Alu,
                    Some(node.dtype),
                    vec![sa, sb, sc],
                    UOpArg::Alu(alu),
                ))
            }
            Op::Reduce(kind, src, axes) => {
                let full = ShapeTracker::from_shape(self.graph.node(src).shape());
                let s = self.build(src, root, &full)?;
                Ok(g.add(
                    UOpKind::Reduce,
                    Some(node.dtype),
                    vec![s],
                    UOpArg::ReduceAxis(kind, axes),
                ))
            }
            Op::Movement(_, src) => {
                let st = Self::compose(&node.st, ctx);
                self.build_through(src, &st)
            }
        }
    }

    /// Read `src` through an accumulated view context.
    fn build_through(&mut self, src: NodeId, ctx: &ShapeTracker) -> Result<UOpRef> {
        let node = self.graph.node(src);
        if node.is_realized() || self.cuts.contains(&src) {
            return Ok(self.load_input(src, ctx));
        }
        // unrealised leaves read inline through the composed view
        self.build(src, src, ctx)
    }
}

/// Partition the lazy graph below `targets` into kernel ASTs, ordered so
/// every kernel's inputs are realised before it runs.
pub fn schedule(graph: &Graph, targets: &[NodeId]) -> Result<Vec<ScheduledKernel>> {
    let roots: Vec<NodeId> = {
        let mut out: Vec<NodeId> = Vec::new();
        for t in targets {
            let r = store_root(graph, *t);
            if !graph.node(r).is_realized() && !out.contains(&r) {
                out.push(r);
            }
        }
        out
    };
    if roots.is_empty() {
        return Ok(vec![]);
    }

    let mut sched = Scheduler {
        graph,
        cuts: HashSet::new(),
    };
    sched.find_cuts(&roots)?;

    // order cuts by their realised-buffer dependencies; ties go to original
    // creation order
    let mut dep = DiGraphMap::<usize, ()>::new();
    for cut in &sched.cuts {
        dep.add_node(cut.get());
    }
    let cuts_by_idx: HashMap<usize, NodeId> =
        sched.cuts.iter().map(|c| (c.get(), *c)).collect();
    for cut in &sched.cuts {
        for input in sched.region_inputs(*cut) {
            if sched.cuts.contains(&input) && input != *cut {
                dep.add_edge(input.get(), cut.get(), ());
            }
        }
    }
    let mut in_deg: HashMap<usize, usize> = dep
        .nodes()
        .map(|n| (n, dep.neighbors_directed(n, petgraph::Direction::Incoming).count()))
        .collect();
    let mut heap: BinaryHeap<Reverse<usize>> = in_deg
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| Reverse(*n))
        .collect();
    let mut order: Vec<NodeId> = Vec::new();
    while let Some(Reverse(n)) = heap.pop() {
        order.push(cuts_by_idx[&n]);
        for m in dep.neighbors_directed(n, petgraph::Direction::Outgoing) {
            let d = in_deg.get_mut(&m).unwrap();
            *d -= 1;
            if *d == 0 {
                heap.push(Reverse(m));
            }
        }
    }
    if order.len() != sched.cuts.len() {
        return Err(Error::IrViolation {
            msg: "cycle in kernel dependency graph".into(),
            uops: String::new(),
        });
    }

    let mut kernels = Vec::new();
    for root in order {
        let g = Rc::new(UOpGraph::new());
        let mut builder = AstBuilder {
            graph,
            cuts: &sched.cuts,
            g: g.clone(),
            inputs: vec![],
        };
        let node = graph.node(root);
        let out_shape = node.shape().to_vec();
        let ctx = ShapeTracker::from_shape(&out_shape);
        let value = builder.build(root, root, &ctx)?;
        let out_buf = g.add(
            UOpKind::DefineGlobal,
            Some(node.dtype),
            vec![],
            UOpArg::Buffer {
                index: 0,
                writable: true,
            },
        );
        let view = g.add(
            UOpKind::View,
            None,
            vec![],
            UOpArg::View(ShapeTracker::from_shape(&out_shape)),
        );
        let store = g.add(
            UOpKind::Store,
            None,
            vec![out_buf, view, value],
            UOpArg::None,
        );
        let ast = g.sink(vec![store]);
        kernels.push(ScheduledKernel {
            ast_graph: g,
            ast,
            outputs: vec![root],
            inputs: builder.inputs,
            device: node.device,
        });
    }
    debug!(kernels = kernels.len(), "scheduled");
    Ok(kernels)
}

/// Run the full pipeline for every scheduled kernel and mark outputs
/// realised. Nothing is committed for a kernel that fails.
pub fn realize(
    graph: &mut Graph,
    targets: &[NodeId],
    registry: &DeviceRegistry,
    ctx: &CompileContext,
) -> Result<()> {
    let kernels = schedule(graph, targets)?;
    for kernel in kernels {
        let target = kernel.device.target();
        let lowered = linearize(&kernel.ast, &target, ctx)?;
        let g = &lowered.graph;

        let mut folder = rules::folder();
        if target.supports_float4 {
            folder = folder.concat(rules::float4_folding());
        }
        if target.has_image {
            folder = folder.concat(rules::image_folding());
        }
        let sink = graph_rewrite(&lowered.sink, &folder, g);
        let expand = rules::folder().concat(rules::expander());
        let sink = graph_rewrite(&sink, &expand, g);

        let uops = order_uops(&sink, g)?;
        if ctx.debug >= 3 {
            debug!("\n{}", crate::render::print_uops(&uops));
        }

        let dialect = dialect_for(kernel.device);
        let (source, global_size, local_size) = render(&lowered.name_base, &uops, dialect)?;
        let (name, source) = finalize_name(ctx, &lowered.name_base, &source);
        ctx.cache_source(&name, &source);
        if ctx.debug >= 1 {
            debug!(%name, ?global_size, ?local_size, "compiled");
        }

        let driver = registry.driver(kernel.device)?;
        let prog = Program {
            name,
            source,
            uops,
            global_size,
            local_size,
        };
        let compiled = driver.compile(&prog)?;

        let mut bufs = Vec::with_capacity(kernel.outputs.len() + kernel.inputs.len());
        let mut out_handles = Vec::new();
        for out in &kernel.outputs {
            let node = graph.node(*out);
            let buf = Rc::new(RefCell::new(Buffer::zeroed(
                node.dtype,
                node.st.size() as usize,
            )));
            out_handles.push((*out, buf.clone()));
            bufs.push(buf);
        }
        for input in &kernel.inputs {
            let node = graph.node(*input);
            let handle = node.realized.clone().ok_or_else(|| Error::IrViolation {
                msg: "kernel scheduled before its input was realised".into(),
                uops: String::new(),
            })?;
            bufs.push(handle);
        }
        compiled.launch(&bufs)?;
        ctx.stats.kernels.set(ctx.stats.kernels.get() + 1);

        for (out, buf) in out_handles {
            graph.set_realized(out, buf);
        }
    }

    // contiguous movement targets alias their root's storage
    for t in targets {
        if graph.node(*t).is_realized() {
            continue;
        }
        let root = store_root(graph, *t);
        if let Some(buf) = graph.node(root).realized.clone() {
            graph.set_realized(*t, buf);
        }
    }
    Ok(())
}
