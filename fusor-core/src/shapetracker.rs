use crate::error::{Error, Result};
use crate::symbolic::Node;
use crate::view::View;

/// A non-empty stack of views. The last view is the observable shape; older
/// views underneath describe how it composes down to the flat buffer.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ShapeTracker {
    pub views: Vec<View>,
}

impl ShapeTracker {
    pub fn from_shape(shape: &[i64]) -> ShapeTracker {
        ShapeTracker {
            views: vec![View::contiguous(shape)],
        }
    }

    pub fn top(&self) -> &View {
        self.views.last().unwrap()
    }

    pub fn shape(&self) -> &[i64] {
        &self.top().shape
    }

    pub fn size(&self) -> i64 {
        self.top().size()
    }

    /// Number of elements of the underlying buffer this tracker can touch:
    /// one past the highest flat index the bottom view reaches. Broadcast
    /// axes contribute nothing, so expanding never grows the footprint.
    pub fn real_size(&self) -> i64 {
        let v = self.views.first().unwrap();
        let span: i64 = v
            .shape
            .iter()
            .zip(&v.strides)
            .filter(|(_, st)| **st > 0)
            .map(|(s, st)| (s - 1) * st)
            .sum();
        v.offset + span + 1
    }

    pub fn contiguous(&self) -> bool {
        self.views.len() == 1 && self.top().is_contiguous()
    }

    fn with_top(&self, view: View) -> ShapeTracker {
        let mut views = self.views.clone();
        *views.last_mut().unwrap() = view;
        ShapeTracker { views }
    }

    pub fn reshape(&self, new_shape: &[i64]) -> Result<ShapeTracker> {
        if new_shape.iter().any(|s| *s <= 0) {
            return Err(Error::ShapeMismatch {
                op: "reshape",
                shape: self.shape().to_vec(),
                msg: format!("non-positive dim in {new_shape:?}"),
            });
        }
        if new_shape.iter().product::<i64>() != self.size() {
            return Err(Error::ShapeMismatch {
                op: "reshape",
                shape: self.shape().to_vec(),
                msg: format!("cannot reshape to {new_shape:?}"),
            });
        }
        if let Some(view) = self.top().reshape(new_shape) {
            return Ok(self.with_top(view));
        }
        // not expressible in place: a fresh contiguous view goes on top and
        // the old stack keeps describing the physical layout
        let mut views = self.views.clone();
        views.push(View::contiguous(new_shape));
        Ok(ShapeTracker { views })
    }

    pub fn permute(&self, perm: &[usize]) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().permute(perm)?))
    }

    pub fn expand(&self, new_shape: &[i64]) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().expand(new_shape)?))
    }

    pub fn pad(&self, arg: &[(i64, i64)]) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().pad(arg)?))
    }

    pub fn shrink(&self, arg: &[(i64, i64)]) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().shrink(arg)?))
    }

    pub fn stride(&self, steps: &[i64]) -> Result<ShapeTracker> {
        Ok(self.with_top(self.top().stride(steps)?))
    }

    /// Drop views that compose away. A contiguous view underneath the top is
    /// the identity on the flat index, and a contiguous same-shape view on
    /// top is the identity on the one below it.
    pub fn simplify(&self) -> ShapeTracker {
        let mut views = self.views.clone();
        loop {
            let n = views.len();
            if n < 2 {
                break;
            }
            let under = &views[n - 2];
            let top = &views[n - 1];
            if under.is_contiguous() {
                views.remove(n - 2);
                continue;
            }
            if top.is_contiguous() && top.shape == under.shape {
                views.pop();
                continue;
            }
            break;
        }
        ShapeTracker { views }
    }

    /// Symbolic `(flat_index, valid)` over per-axis index expressions for the
    /// observable shape. Walks the stack top-down, unflattening through each
    /// older view.
    pub fn expr_idxs(&self, idxs: &[Node]) -> (Node, Node) {
        let (mut idx, mut valid) = self.top().expr(idxs, Node::num(1));
        for view in self.views[..self.views.len() - 1].iter().rev() {
            let mut acc = 1i64;
            let mut sub_idxs = Vec::with_capacity(view.shape.len());
            for d in view.shape.iter().rev() {
                sub_idxs.push(idx.clone().floordiv(acc).modulo(*d));
                acc *= d;
            }
            sub_idxs.reverse();
            let (next_idx, next_valid) = view.expr(&sub_idxs, valid);
            idx = next_idx;
            valid = next_valid;
        }
        (idx, valid)
    }

    /// `expr_idxs` with default `idx{k}` variables spanning the shape.
    pub fn expr_node(&self) -> (Node, Node) {
        let idxs: Vec<Node> = self
            .shape()
            .iter()
            .enumerate()
            .map(|(k, s)| Node::var(format!("idx{k}"), 0, s - 1))
            .collect();
        self.expr_idxs(&idxs)
    }

    /// True when any legal index can fall outside the mask.
    pub fn needs_valid(&self) -> bool {
        self.views.iter().any(|v| v.mask.is_some())
    }

    /// Strides of the top view when it alone describes the layout, used by
    /// fusion heuristics. Not meaningful for multi-view stacks.
    pub fn top_strides(&self) -> &[i64] {
        &self.top().strides
    }
}
