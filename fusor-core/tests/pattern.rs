use fusor_core::{
    folder, graph_rewrite, AluOp, ConstVal, DType, Pat, PatternMatcher, SrcPat, UOpArg, UOpGraph,
    UOpKind, UOpRef,
};

fn ident_rule(pat: Pat) -> PatternMatcher {
    PatternMatcher::new(vec![(
        pat,
        Box::new(|m: &fusor_core::Bindings, _: &UOpGraph| Some(m["x"].clone())),
    )])
}

#[test]
fn simple_match() {
    let matcher = ident_rule(
        Pat::op(UOpKind::Const)
            .dtypes(&[DType::F32])
            .named("x")
            .pat(),
    );
    let g = UOpGraph::new();
    let c1 = g.cnst(DType::F32, ConstVal::Float(1.0));
    let c2 = g.cnst(DType::I32, ConstVal::Int(1));
    assert_eq!(matcher.rewrite(&c1, &g).map(|u| u.id), Some(c1.id));
    assert!(matcher.rewrite(&c2, &g).is_none());
}

#[test]
fn dtype_set() {
    let matcher = ident_rule(
        Pat::op(UOpKind::Const)
            .dtypes(&[DType::F32, DType::F64])
            .named("x")
            .pat(),
    );
    let g = UOpGraph::new();
    let c1 = g.cnst(DType::F32, ConstVal::Float(1.0));
    let c2 = g.cnst(DType::F64, ConstVal::Float(1.0));
    let c3 = g.cnst(DType::F16, ConstVal::Float(1.0));
    let c4 = g.cnst(DType::I32, ConstVal::Int(1));
    assert!(matcher.rewrite(&c1, &g).is_some());
    assert!(matcher.rewrite(&c2, &g).is_some());
    assert!(matcher.rewrite(&c3, &g).is_none());
    assert!(matcher.rewrite(&c4, &g).is_none());
}

#[test]
fn src_positional() {
    let matcher = ident_rule(
        Pat::op(UOpKind::Alu)
            .src(SrcPat::Exact(vec![
                Pat::op(UOpKind::Const).pat(),
                Pat::op(UOpKind::Const).pat(),
            ]))
            .named("x")
            .pat(),
    );
    let g = UOpGraph::new();
    let c1 = g.cnst(DType::F32, ConstVal::Float(1.0));
    let c2 = g.cnst(DType::F32, ConstVal::Float(2.0));
    let c3 = g.alu(AluOp::Add, DType::F32, vec![c1, c2.clone()]);
    assert!(matcher.rewrite(&c3, &g).is_some());
    assert!(matcher.rewrite(&c2, &g).is_none());
}

#[test]
fn src_permutations() {
    let matcher = ident_rule(
        Pat::op(UOpKind::Alu)
            .src(SrcPat::Unordered(vec![
                Pat::op(UOpKind::Const).pat(),
                Pat::op(UOpKind::Alu).pat(),
            ]))
            .named("x")
            .pat(),
    );
    let g = UOpGraph::new();
    let c1 = g.cnst(DType::F32, ConstVal::Float(1.0));
    let c2 = g.cnst(DType::F32, ConstVal::Float(2.0));
    let c3 = g.alu(AluOp::Add, DType::F32, vec![c1, c2.clone()]);
    let c4 = g.alu(AluOp::Add, DType::F32, vec![c3.clone(), c2.clone()]);
    let c5 = g.alu(AluOp::Add, DType::F32, vec![c2.clone(), c3.clone()]);
    let c6 = g.alu(AluOp::Add, DType::F32, vec![c3.clone(), c4.clone()]);
    assert!(matcher.rewrite(&c3, &g).is_none());
    assert!(matcher.rewrite(&c4, &g).is_some());
    assert!(matcher.rewrite(&c5, &g).is_some());
    assert!(matcher.rewrite(&c6, &g).is_none());
}

#[test]
fn src_repeat() {
    let matcher = ident_rule(
        Pat::op(UOpKind::Alu)
            .src(SrcPat::All(Box::new(Pat::op(UOpKind::Const).pat())))
            .named("x")
            .pat(),
    );
    let g = UOpGraph::new();
    let c1 = g.cnst(DType::F32, ConstVal::Float(1.0));
    let c2 = g.cnst(DType::F32, ConstVal::Float(2.0));
    let c3 = g.alu(AluOp::Add, DType::F32, vec![c1, c2.clone()]);
    let c4 = g.alu(AluOp::Add, DType::F32, vec![c2.clone(), c3.clone()]);
    assert!(matcher.rewrite(&c3, &g).is_some());
    assert!(matcher.rewrite(&c4, &g).is_none());
}

#[test]
fn repeated_name_binds_same_node() {
    let matcher = ident_rule(
        Pat::op(UOpKind::Alu)
            .src(SrcPat::Exact(vec![Pat::Var("x"), Pat::Var("x")]))
            .pat(),
    );
    let g = UOpGraph::new();
    let c1 = g.cnst(DType::F32, ConstVal::Float(1.0));
    let c2 = g.cnst(DType::F32, ConstVal::Float(2.0));
    let same = g.alu(AluOp::Add, DType::F32, vec![c1.clone(), c1.clone()]);
    let diff = g.alu(AluOp::Add, DType::F32, vec![c1, c2]);
    assert!(matcher.rewrite(&same, &g).is_some());
    assert!(matcher.rewrite(&diff, &g).is_none());
}

#[test]
fn rule_order_is_first_match_wins() {
    let mk = |v: f64| -> (Pat, fusor_core::Builder) {
        (
            Pat::op(UOpKind::Const).named("x").pat(),
            Box::new(move |_m, g: &UOpGraph| Some(g.cnst(DType::F32, ConstVal::Float(v)))),
        )
    };
    let matcher = PatternMatcher::new(vec![mk(5.0), mk(7.0)]);
    let g = UOpGraph::new();
    let c = g.cnst(DType::F32, ConstVal::Float(0.0));
    let out = matcher.rewrite(&c, &g).unwrap();
    assert_eq!(out.const_val().unwrap().as_f64(), 5.0);
}

fn fold_all(g: &UOpGraph, root: &UOpRef) -> UOpRef {
    graph_rewrite(root, &folder(), g)
}

#[test]
fn rewrite_folds_constants() {
    let g = UOpGraph::new();
    let c1 = g.cnst(DType::F32, ConstVal::Float(2.0));
    let c2 = g.cnst(DType::F32, ConstVal::Float(3.0));
    let add = g.alu(AluOp::Add, DType::F32, vec![c1, c2]);
    let out = fold_all(&g, &add);
    assert_eq!(out.op, UOpKind::Const);
    assert_eq!(out.const_val().unwrap().as_f64(), 5.0);
}

#[test]
fn rewrite_removes_identity_ops() {
    let g = UOpGraph::new();
    let x = g.add(
        UOpKind::Special,
        Some(DType::I32),
        vec![],
        UOpArg::Special {
            name: "gidx0".into(),
            size: 16,
        },
    );
    let zero = g.cint(0);
    let one = g.cint(1);
    let chain = g.imul(g.iadd(x.clone(), zero), one);
    let out = fold_all(&g, &chain);
    assert_eq!(out.id, x.id);
}

#[test]
fn rewrite_reaches_fixed_point() {
    let g = UOpGraph::new();
    let x = g.add(
        UOpKind::Special,
        Some(DType::I32),
        vec![],
        UOpArg::Special {
            name: "gidx0".into(),
            size: 16,
        },
    );
    // ((x + 1) + 2) * 1 needs several passes of two-stage folding
    let e = g.imul(g.iadd(g.iadd(x, g.cint(1)), g.cint(2)), g.cint(1));
    let once = fold_all(&g, &e);
    let twice = fold_all(&g, &once);
    assert_eq!(once.id, twice.id);
}

#[test]
fn comparison_folds_on_disjoint_ranges() {
    let g = UOpGraph::new();
    let x = g.add(
        UOpKind::Special,
        Some(DType::I32),
        vec![],
        UOpArg::Special {
            name: "gidx0".into(),
            size: 8,
        },
    );
    let lt = g.alu(AluOp::CmpLt, DType::BOOL, vec![x, g.cint(100)]);
    let out = fold_all(&g, &lt);
    assert_eq!(out.const_val().unwrap().as_bool(), true);
}

#[test]
fn gated_load_folds_on_constant_gate() {
    let g = UOpGraph::new();
    let buf = g.add(
        UOpKind::DefineGlobal,
        Some(DType::F32),
        vec![],
        UOpArg::Buffer {
            index: 1,
            writable: false,
        },
    );
    let idx = g.cint(3);
    let alt = g.cnst(DType::F32, ConstVal::Float(0.0));
    let gate = g.cbool(true);
    let load = g.add(
        UOpKind::Load,
        Some(DType::F32),
        vec![buf, idx, alt.clone(), gate],
        UOpArg::None,
    );
    let out = fold_all(&g, &load);
    assert_eq!(out.op, UOpKind::Load);
    assert_eq!(out.src.len(), 2);

    let g2 = UOpGraph::new();
    let buf2 = g2.add(
        UOpKind::DefineGlobal,
        Some(DType::F32),
        vec![],
        UOpArg::Buffer {
            index: 1,
            writable: false,
        },
    );
    let load2 = g2.add(
        UOpKind::Load,
        Some(DType::F32),
        vec![
            buf2,
            g2.cint(3),
            g2.cnst(DType::F32, ConstVal::Float(4.5)),
            g2.cbool(false),
        ],
        UOpArg::None,
    );
    let out2 = fold_all(&g2, &load2);
    assert_eq!(out2.const_val().unwrap().as_f64(), 4.5);
}

#[test]
fn store_of_just_loaded_value_is_noop() {
    let g = UOpGraph::new();
    let buf = g.add(
        UOpKind::DefineGlobal,
        Some(DType::F32),
        vec![],
        UOpArg::Buffer {
            index: 0,
            writable: true,
        },
    );
    let idx = g.cint(0);
    let load = g.add(
        UOpKind::Load,
        Some(DType::F32),
        vec![buf.clone(), idx.clone()],
        UOpArg::None,
    );
    let store = g.add(UOpKind::Store, None, vec![buf, idx, load], UOpArg::None);
    let out = fold_all(&g, &store);
    assert_eq!(out.op, UOpKind::Noop);
}
