use std::collections::HashMap;

use fusor_core::{Node, ShapeTracker};

fn env_of(idxs: &[i64]) -> HashMap<String, i64> {
    idxs.iter()
        .enumerate()
        .map(|(k, v)| (format!("idx{k}"), *v))
        .collect()
}

fn eval_at(st: &ShapeTracker, idxs: &[i64]) -> (i64, i64) {
    let (idx, valid) = st.expr_node();
    let env = env_of(idxs);
    (idx.eval(&env), valid.eval(&env))
}

#[test]
fn contiguous_roundtrip() {
    let st = ShapeTracker::from_shape(&[2, 3, 4]);
    assert!(st.contiguous());
    let mut flat = 0;
    for i in 0..2 {
        for j in 0..3 {
            for k in 0..4 {
                assert_eq!(eval_at(&st, &[i, j, k]), (flat, 1));
                flat += 1;
            }
        }
    }
}

#[test]
fn permute_maps_indices() {
    let st = ShapeTracker::from_shape(&[2, 3]).permute(&[1, 0]).unwrap();
    assert_eq!(st.shape(), &[3, 2]);
    for i in 0..3 {
        for j in 0..2 {
            // position (i, j) of the transpose is (j, i) of the original
            assert_eq!(eval_at(&st, &[i, j]).0, j * 3 + i);
        }
    }
}

#[test]
fn permute_inverse_is_identity() {
    let st = ShapeTracker::from_shape(&[2, 3, 4]);
    let p = st.permute(&[2, 0, 1]).unwrap();
    // inverse of (2,0,1) is (1,2,0)
    let back = p.permute(&[1, 2, 0]).unwrap();
    assert_eq!(back, st);
}

#[test]
fn reshape_of_reshape_is_last_reshape() {
    let st = ShapeTracker::from_shape(&[4, 3]);
    let a = st.reshape(&[2, 6]).unwrap().reshape(&[12]).unwrap();
    let b = st.reshape(&[12]).unwrap();
    assert_eq!(a, b);
}

#[test]
fn reshape_after_permute_stacks_views() {
    let st = ShapeTracker::from_shape(&[2, 3])
        .permute(&[1, 0])
        .unwrap()
        .reshape(&[6])
        .unwrap();
    assert_eq!(st.views.len(), 2);
    for k in 0..6 {
        // row-major over the transpose
        let expect = (k % 2) * 3 + k / 2;
        assert_eq!(eval_at(&st, &[k]), (expect, 1));
    }
}

#[test]
fn expand_broadcasts_with_zero_stride() {
    let st = ShapeTracker::from_shape(&[1, 3]).expand(&[4, 3]).unwrap();
    assert_eq!(st.shape(), &[4, 3]);
    assert_eq!(st.top_strides(), &[0, 1]);
    // footprint unchanged by broadcast
    assert_eq!(st.real_size(), 3);
    for i in 0..4 {
        for j in 0..3 {
            assert_eq!(eval_at(&st, &[i, j]).0, j);
        }
    }
}

#[test]
fn expand_rejects_non_unit_axis() {
    assert!(ShapeTracker::from_shape(&[2, 3]).expand(&[4, 3]).is_err());
}

#[test]
fn pad_masks_the_border() {
    let st = ShapeTracker::from_shape(&[3, 3])
        .pad(&[(1, 1), (1, 1)])
        .unwrap();
    assert_eq!(st.shape(), &[5, 5]);
    assert_eq!(eval_at(&st, &[0, 0]).1, 0);
    assert_eq!(eval_at(&st, &[0, 2]).1, 0);
    assert_eq!(eval_at(&st, &[4, 4]).1, 0);
    assert_eq!(eval_at(&st, &[1, 1]), (0, 1));
    assert_eq!(eval_at(&st, &[2, 3]), (1 * 3 + 2, 1));
}

#[test]
fn pad_then_matching_shrink_is_identity() {
    let st = ShapeTracker::from_shape(&[3, 3]);
    let round = st
        .pad(&[(1, 1), (1, 1)])
        .unwrap()
        .shrink(&[(1, 4), (1, 4)])
        .unwrap();
    assert_eq!(round, st);
}

#[test]
fn shrink_shifts_offset() {
    let st = ShapeTracker::from_shape(&[4, 4]).shrink(&[(1, 3), (2, 4)]).unwrap();
    assert_eq!(st.shape(), &[2, 2]);
    assert_eq!(eval_at(&st, &[0, 0]), (1 * 4 + 2, 1));
    assert_eq!(eval_at(&st, &[1, 1]), (2 * 4 + 3, 1));
}

#[test]
fn flip_reverses_an_axis() {
    let st = ShapeTracker::from_shape(&[4]).stride(&[-1]).unwrap();
    for i in 0..4 {
        assert_eq!(eval_at(&st, &[i]).0, 3 - i);
    }
    // flipping twice restores the identity
    let back = st.stride(&[-1]).unwrap();
    assert_eq!(back, ShapeTracker::from_shape(&[4]));
}

#[test]
fn strided_view_skips_elements() {
    let st = ShapeTracker::from_shape(&[6]).stride(&[2]).unwrap();
    assert_eq!(st.shape(), &[3]);
    for i in 0..3 {
        assert_eq!(eval_at(&st, &[i]).0, i * 2);
    }
}

#[test]
fn simplify_merges_stacked_views() {
    // a reshape over a contiguous tracker collapses back to one view
    let st = ShapeTracker::from_shape(&[6]).reshape(&[2, 3]).unwrap();
    assert_eq!(st.simplify().views.len(), 1);
}

#[test]
fn masked_view_survives_unit_reshape() {
    let st = ShapeTracker::from_shape(&[3]).pad(&[(1, 0)]).unwrap();
    let r = st.reshape(&[4, 1]).unwrap();
    assert_eq!(r.shape(), &[4, 1]);
    assert_eq!(eval_at(&r, &[0, 0]).1, 0);
    assert_eq!(eval_at(&r, &[1, 0]), (0, 1));
}

#[test]
fn expr_idxs_composes_with_custom_indices() {
    let st = ShapeTracker::from_shape(&[2, 3]);
    let (idx, valid) = st.expr_idxs(&[Node::var("a", 0, 1), Node::var("b", 0, 2)]);
    let mut env = HashMap::new();
    env.insert("a".to_string(), 1);
    env.insert("b".to_string(), 2);
    assert_eq!(idx.eval(&env), 5);
    assert_eq!(valid.eval(&env), 1);
}

#[test]
fn multi_view_mask_still_guards() {
    // pad, then a reshape that cannot merge: validity must flow through
    let st = ShapeTracker::from_shape(&[2, 2])
        .pad(&[(1, 1), (0, 0)])
        .unwrap()
        .permute(&[1, 0])
        .unwrap()
        .reshape(&[8])
        .unwrap();
    let mut valid_count = 0;
    for k in 0..8 {
        valid_count += eval_at(&st, &[k]).1;
    }
    assert_eq!(valid_count, 4);
}
