use crate::error::{Error, Result};
use crate::symbolic::Node;

/// Row-major strides for a shape.
pub fn strides_for_shape(shape: &[i64]) -> Vec<i64> {
    let mut strides = Vec::with_capacity(shape.len());
    let mut acc = 1;
    for dim in shape.iter().rev() {
        strides.push(acc);
        acc *= *dim;
    }
    strides.reverse();
    strides
}

/// Size-1 axes carry stride 0 by convention, so views that differ only in
/// dead strides compare equal.
fn canonicalize_strides(shape: &[i64], strides: &[i64]) -> Vec<i64> {
    shape
        .iter()
        .zip(strides)
        .map(|(s, st)| if *s == 1 { 0 } else { *st })
        .collect()
}

/// One affine layer of a shape tracker: an N-dim index maps to
/// `offset + sum(i_k * strides_k)`, valid iff every `i_k` lies inside the
/// mask interval for its axis.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct View {
    pub shape: Vec<i64>,
    pub strides: Vec<i64>,
    pub offset: i64,
    pub mask: Option<Vec<(i64, i64)>>,
}

impl View {
    pub fn new(
        shape: Vec<i64>,
        strides: Vec<i64>,
        offset: i64,
        mask: Option<Vec<(i64, i64)>>,
    ) -> View {
        let strides = canonicalize_strides(&shape, &strides);
        // a mask covering every axis in full is no mask at all
        let mask = mask.filter(|m| {
            !m.iter()
                .zip(&shape)
                .all(|((lo, hi), s)| *lo == 0 && *hi == *s)
        });
        View {
            shape,
            strides,
            offset,
            mask,
        }
    }

    pub fn contiguous(shape: &[i64]) -> View {
        let strides = strides_for_shape(shape);
        View::new(shape.to_vec(), strides, 0, None)
    }

    pub fn size(&self) -> i64 {
        self.shape.iter().product()
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0
            && self.mask.is_none()
            && self.strides == canonicalize_strides(&self.shape, &strides_for_shape(&self.shape))
    }

    fn mask_or_full(&self) -> Vec<(i64, i64)> {
        self.mask
            .clone()
            .unwrap_or_else(|| self.shape.iter().map(|s| (0, *s)).collect())
    }

    pub fn permute(&self, perm: &[usize]) -> Result<View> {
        if perm.len() != self.shape.len() {
            return Err(Error::ShapeMismatch {
                op: "permute",
                shape: self.shape.clone(),
                msg: format!("permutation {perm:?} has wrong rank"),
            });
        }
        let mut seen = vec![false; perm.len()];
        for &p in perm {
            if p >= perm.len() || seen[p] {
                return Err(Error::ShapeMismatch {
                    op: "permute",
                    shape: self.shape.clone(),
                    msg: format!("{perm:?} is not a permutation"),
                });
            }
            seen[p] = true;
        }
        Ok(View::new(
            perm.iter().map(|&p| self.shape[p]).collect(),
            perm.iter().map(|&p| self.strides[p]).collect(),
            self.offset,
            self.mask
                .as_ref()
                .map(|m| perm.iter().map(|&p| m[p]).collect()),
        ))
    }

    pub fn expand(&self, new_shape: &[i64]) -> Result<View> {
        if new_shape.len() != self.shape.len() {
            return Err(Error::ShapeMismatch {
                op: "expand",
                shape: self.shape.clone(),
                msg: format!("rank mismatch with {new_shape:?}"),
            });
        }
        let mut mask = self.mask.clone();
        for (k, (&s, &ns)) in self.shape.iter().zip(new_shape).enumerate() {
            if s == ns {
                continue;
            }
            if s != 1 {
                return Err(Error::ShapeMismatch {
                    op: "expand",
                    shape: self.shape.clone(),
                    msg: format!("cannot broadcast axis {k} of size {s} to {ns}"),
                });
            }
            if let Some(m) = mask.as_mut() {
                // a fully-visible unit axis broadcasts its visibility,
                // a masked-out one stays empty
                m[k] = if m[k] == (0, 1) { (0, ns) } else { (0, 0) };
            }
        }
        Ok(View::new(
            new_shape.to_vec(),
            self.strides.clone(),
            self.offset,
            mask,
        ))
    }

    pub fn pad(&self, arg: &[(i64, i64)]) -> Result<View> {
        if arg.len() != self.shape.len() || arg.iter().any(|(b, e)| *b < 0 || *e < 0) {
            return Err(Error::ShapeMismatch {
                op: "pad",
                shape: self.shape.clone(),
                msg: format!("bad padding {arg:?}"),
            });
        }
        if arg.iter().all(|(b, e)| *b == 0 && *e == 0) {
            return Ok(self.clone());
        }
        let old_mask = self.mask_or_full();
        let shape: Vec<i64> = self
            .shape
            .iter()
            .zip(arg)
            .map(|(s, (b, e))| s + b + e)
            .collect();
        let offset = self.offset
            - self
                .strides
                .iter()
                .zip(arg)
                .map(|(st, (b, _))| st * b)
                .sum::<i64>();
        let mask: Vec<(i64, i64)> = old_mask
            .iter()
            .zip(arg)
            .map(|((lo, hi), (b, _))| (lo + b, hi + b))
            .collect();
        Ok(View::new(shape, self.strides.clone(), offset, Some(mask)))
    }

    pub fn shrink(&self, arg: &[(i64, i64)]) -> Result<View> {
        if arg.len() != self.shape.len()
            || arg
                .iter()
                .zip(&self.shape)
                .any(|((b, e), s)| *b < 0 || b > e || *e > *s)
        {
            return Err(Error::ShapeMismatch {
                op: "shrink",
                shape: self.shape.clone(),
                msg: format!("bad bounds {arg:?}"),
            });
        }
        let offset = self.offset
            + self
                .strides
                .iter()
                .zip(arg)
                .map(|(st, (b, _))| st * b)
                .sum::<i64>();
        let shape: Vec<i64> = arg.iter().map(|(b, e)| e - b).collect();
        let mask = self.mask.as_ref().map(|m| {
            m.iter()
                .zip(arg)
                .map(|((lo, hi), (b, e))| ((lo - b).max(0), (hi.min(e)) - b))
                .collect()
        });
        Ok(View::new(shape, self.strides.clone(), offset, mask))
    }

    /// Step through each axis; negative steps reverse.
    pub fn stride(&self, steps: &[i64]) -> Result<View> {
        if steps.len() != self.shape.len() || steps.iter().any(|s| *s == 0) {
            return Err(Error::ShapeMismatch {
                op: "stride",
                shape: self.shape.clone(),
                msg: format!("bad steps {steps:?}"),
            });
        }
        let mut shape = Vec::with_capacity(self.shape.len());
        let mut strides = Vec::with_capacity(self.shape.len());
        let mut offset = self.offset;
        let mut mask = self.mask.clone();
        for (k, &st) in steps.iter().enumerate() {
            let abs = st.abs();
            let s = self.shape[k];
            shape.push((s + abs - 1) / abs);
            strides.push(self.strides[k] * st);
            if st < 0 {
                offset += (s - 1) * self.strides[k];
            }
            if let Some(m) = mask.as_mut() {
                let (lo, hi) = m[k];
                m[k] = if st > 0 {
                    ((lo + st - 1) / st, (hi + st - 1) / st)
                } else {
                    ((s - hi + abs - 1) / abs, (s - 1 - lo) / abs + 1)
                };
            }
        }
        Ok(View::new(shape, strides, offset, mask))
    }

    /// Try to express `new_shape` over the same buffer without data motion.
    /// Ported from the classic no-copy reshape stride check; returns `None`
    /// when a fresh view has to be pushed instead.
    pub fn reshape(&self, new_shape: &[i64]) -> Option<View> {
        if new_shape == self.shape.as_slice() {
            return Some(self.clone());
        }
        if self.mask.is_some() {
            // only trivial rank changes (adding/dropping unit axes) keep a
            // mask intact
            return self.reshape_units_only(new_shape);
        }
        let old: Vec<(i64, i64)> = self
            .shape
            .iter()
            .zip(&self.strides)
            .filter(|(s, _)| **s != 1)
            .map(|(s, st)| (*s, *st))
            .collect();
        let targets: Vec<i64> = new_shape.iter().copied().filter(|s| *s != 1).collect();
        let mut new_strides = vec![0i64; targets.len()];
        let (mut oi, mut ni) = (0usize, 0usize);
        while oi < old.len() && ni < targets.len() {
            // grow minimal windows on both sides until the products agree
            let (mut op, mut np) = (old[oi].0, targets[ni]);
            let (mut oj, mut nj) = (oi + 1, ni + 1);
            while op != np {
                if op < np {
                    op *= old.get(oj)?.0;
                    oj += 1;
                } else {
                    np *= targets.get(nj)?;
                    nj += 1;
                }
            }
            // the old window must be internally contiguous (or all broadcast)
            for k in oi..oj - 1 {
                if old[k].1 != old[k + 1].1 * old[k + 1].0 {
                    return None;
                }
            }
            let mut acc = old[oj - 1].1;
            for k in (ni..nj).rev() {
                new_strides[k] = acc;
                acc *= targets[k];
            }
            oi = oj;
            ni = nj;
        }
        if oi != old.len() || ni != targets.len() {
            return None;
        }
        // reinsert unit axes
        let mut it = new_strides.into_iter();
        let full: Vec<i64> = new_shape
            .iter()
            .map(|s| if *s == 1 { 0 } else { it.next().unwrap() })
            .collect();
        Some(View::new(new_shape.to_vec(), full, self.offset, None))
    }

    fn reshape_units_only(&self, new_shape: &[i64]) -> Option<View> {
        let old_core: Vec<i64> = self.shape.iter().copied().filter(|s| *s != 1).collect();
        let new_core: Vec<i64> = new_shape.iter().copied().filter(|s| *s != 1).collect();
        if old_core != new_core {
            return None;
        }
        let mask = self.mask_or_full();
        // all dropped unit axes must be fully visible
        for ((s, _), m) in self.shape.iter().zip(&self.strides).zip(&mask) {
            if *s == 1 && *m != (0, 1) {
                return None;
            }
        }
        let mut pairs = self
            .shape
            .iter()
            .zip(self.strides.iter().zip(&mask))
            .filter(|(s, _)| **s != 1)
            .map(|(_, x)| x);
        let mut strides = Vec::with_capacity(new_shape.len());
        let mut new_mask = Vec::with_capacity(new_shape.len());
        for s in new_shape {
            if *s == 1 {
                strides.push(0);
                new_mask.push((0, 1));
            } else {
                let (st, m) = pairs.next().unwrap();
                strides.push(*st);
                new_mask.push(*m);
            }
        }
        Some(View::new(
            new_shape.to_vec(),
            strides,
            self.offset,
            Some(new_mask),
        ))
    }

    /// Symbolic `(index, valid)` for one view given per-axis index nodes.
    pub fn expr(&self, idxs: &[Node], valid_in: Node) -> (Node, Node) {
        debug_assert_eq!(idxs.len(), self.shape.len());
        let mut parts = vec![Node::num(self.offset)];
        let mut valids = vec![valid_in];
        let full = self.mask_or_full();
        for (k, idx) in idxs.iter().enumerate() {
            if self.shape[k] != 1 && self.strides[k] != 0 {
                parts.push(idx.clone().muln(self.strides[k]));
            }
            if self.mask.is_some() {
                let (lo, hi) = full[k];
                if lo != 0 {
                    valids.push(idx.clone().ge(lo));
                }
                if hi != self.shape[k] {
                    valids.push(idx.clone().lt(hi));
                }
            }
        }
        (Node::sum(parts), Node::ands(valids))
    }
}
