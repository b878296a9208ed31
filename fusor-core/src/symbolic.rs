use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// A bounded integer expression. Division and modulo are always by positive
/// constants; constant folding uses C (truncating) semantics to match the
/// emitted kernels. Every constructor canonicalises, so two algebraically
/// equal expressions built through the public API compare structurally equal.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Node {
    Num(i64),
    Var { name: String, min: i64, max: i64 },
    Sum(Vec<Node>),
    Mul(Box<Node>, i64),
    Div(Box<Node>, i64),
    Mod(Box<Node>, i64),
    Lt(Box<Node>, i64),
    Ge(Box<Node>, i64),
    And(Vec<Node>),
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    a = a.abs();
    b = b.abs();
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl Node {
    pub fn num(n: i64) -> Node {
        Node::Num(n)
    }

    pub fn var(name: impl Into<String>, min: i64, max: i64) -> Node {
        let name = name.into();
        debug_assert!(min <= max, "var {name} has empty range {min}..{max}");
        if min == max {
            return Node::Num(min);
        }
        Node::Var { name, min, max }
    }

    pub fn min(&self) -> i64 {
        self.bounds().0
    }

    pub fn max(&self) -> i64 {
        self.bounds().1
    }

    /// Exact for linear forms; standard interval rules for div/mod.
    pub fn bounds(&self) -> (i64, i64) {
        match self {
            Node::Num(n) => (*n, *n),
            Node::Var { min, max, .. } => (*min, *max),
            Node::Sum(parts) => parts
                .iter()
                .map(Node::bounds)
                .fold((0, 0), |(lo, hi), (a, b)| (lo + a, hi + b)),
            Node::Mul(a, k) => {
                let (lo, hi) = a.bounds();
                if *k >= 0 {
                    (lo * k, hi * k)
                } else {
                    (hi * k, lo * k)
                }
            }
            Node::Div(a, b) => {
                let (lo, hi) = a.bounds();
                (lo / b, hi / b)
            }
            Node::Mod(a, b) => {
                let (lo, hi) = a.bounds();
                let out_lo = if lo >= 0 { 0 } else { lo.max(-(b - 1)) };
                (out_lo, hi.min(b - 1))
            }
            Node::Lt(..) | Node::Ge(..) => (0, 1),
            Node::And(parts) => parts
                .iter()
                .map(Node::bounds)
                .fold((i64::MAX, i64::MIN), |(lo, hi), (a, b)| {
                    (lo.min(a), hi.max(b))
                }),
        }
    }

    pub fn num_val(&self) -> Option<i64> {
        match self {
            Node::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// Flatten nested sums, fold constants into one trailing term, drop
    /// zeros, unwrap a lone non-constant term.
    pub fn sum(parts: Vec<Node>) -> Node {
        let mut terms = Vec::with_capacity(parts.len());
        let mut konst = 0i64;
        let mut stack = parts;
        stack.reverse();
        while let Some(p) = stack.pop() {
            match p {
                Node::Num(n) => konst += n,
                Node::Sum(inner) => {
                    for x in inner.into_iter().rev() {
                        stack.push(x);
                    }
                }
                other => terms.push(other),
            }
        }
        if terms.is_empty() {
            return Node::Num(konst);
        }
        if konst != 0 {
            terms.push(Node::Num(konst));
        }
        if terms.len() == 1 {
            return terms.pop().unwrap();
        }
        Node::Sum(terms)
    }

    pub fn muln(self, k: i64) -> Node {
        match (self, k) {
            (_, 0) => Node::Num(0),
            (node, 1) => node,
            (Node::Num(n), k) => Node::Num(n * k),
            (Node::Mul(a, j), k) => a.muln(j * k),
            (Node::Sum(parts), k) => Node::sum(parts.into_iter().map(|p| p.muln(k)).collect()),
            (node, k) => Node::Mul(Box::new(node), k),
        }
    }

    /// Truncating division by a positive constant.
    pub fn floordiv(self, b: i64) -> Node {
        assert!(b > 0, "symbolic division must be by a positive constant");
        if b == 1 {
            return self;
        }
        match self {
            Node::Num(n) => Node::Num(n / b),
            Node::Mul(a, j) if j % b == 0 => a.muln(j / b),
            Node::Mul(a, j) if j > 0 && b % j == 0 => a.floordiv(b / j),
            Node::Sum(parts) => Node::sum_div(parts, b),
            node => node.div_generic(b),
        }
    }

    fn sum_div(parts: Vec<Node>, b: i64) -> Node {
        let mut fully = Vec::new();
        let mut rest = Vec::new();
        let mut g = b;
        let mut divisor = 1i64;
        for x in parts {
            match &x {
                Node::Num(n) => {
                    if n % b == 0 {
                        fully.push(Node::Num(n / b));
                    } else {
                        g = gcd(g, *n);
                        rest.push(x);
                    }
                }
                Node::Mul(_, j) => {
                    if j % b == 0 {
                        let Node::Mul(a, j) = x else { unreachable!() };
                        fully.push(a.muln(j / b));
                    } else {
                        g = gcd(g, *j);
                        if divisor == 1 && *j > 0 && b % j == 0 {
                            divisor = *j;
                        }
                        rest.push(x);
                    }
                }
                _ => {
                    g = 1;
                    rest.push(x);
                }
            }
        }
        if g > 1 {
            return Node::sum(vec![
                Node::sum(fully),
                Node::sum(rest).floordiv(g).floordiv(b / g),
            ]);
        }
        if divisor > 1 {
            return Node::sum(vec![
                Node::sum(fully),
                Node::sum(rest).floordiv(divisor).floordiv(b / divisor),
            ]);
        }
        Node::sum(vec![Node::sum(fully), Node::sum(rest).div_generic(b)])
    }

    fn div_generic(self, b: i64) -> Node {
        if let Node::Num(n) = self {
            return Node::Num(n / b);
        }
        let (lo, hi) = self.bounds();
        if lo < 0 {
            let off = lo / b;
            if off != 0 {
                return Node::sum(vec![
                    (self - Node::Num(off * b)).floordiv(b),
                    Node::Num(off),
                ]);
            }
        }
        if lo / b == hi / b {
            return Node::Num(lo / b);
        }
        Node::Div(Box::new(self), b)
    }

    /// Truncating remainder by a positive constant.
    pub fn modulo(self, b: i64) -> Node {
        assert!(b > 0, "symbolic modulo must be by a positive constant");
        if b == 1 {
            return Node::Num(0);
        }
        match self {
            Node::Num(n) => Node::Num(n % b),
            Node::Mul(a, j) if j % b != j => (a.muln(j % b)).modulo(b),
            Node::Sum(parts) => Node::sum(
                parts
                    .into_iter()
                    .map(|x| match x {
                        Node::Num(n) => Node::Num(n % b),
                        Node::Mul(a, j) => a.muln(j % b),
                        other => other,
                    })
                    .collect(),
            )
            .mod_generic(b),
            node => node.mod_generic(b),
        }
    }

    fn mod_generic(self, b: i64) -> Node {
        if let Node::Num(n) = self {
            return Node::Num(n % b);
        }
        let (lo, hi) = self.bounds();
        if lo >= 0 && hi < b {
            return self;
        }
        if lo == hi {
            return Node::Num(lo % b);
        }
        Node::Mod(Box::new(self), b)
    }

    pub fn lt(self, b: i64) -> Node {
        let (lo, hi) = self.bounds();
        if hi < b {
            Node::Num(1)
        } else if lo >= b {
            Node::Num(0)
        } else {
            Node::Lt(Box::new(self), b)
        }
    }

    pub fn ge(self, b: i64) -> Node {
        let (lo, hi) = self.bounds();
        if lo >= b {
            Node::Num(1)
        } else if hi < b {
            Node::Num(0)
        } else {
            Node::Ge(Box::new(self), b)
        }
    }

    /// Conjunction of boolean-ish (0/1) nodes. Constant-true children drop
    /// out, a constant-false child collapses the whole thing.
    pub fn ands(parts: Vec<Node>) -> Node {
        let mut terms = Vec::with_capacity(parts.len());
        for p in parts {
            match p {
                Node::Num(0) => return Node::Num(0),
                Node::Num(_) => {}
                Node::And(inner) => terms.extend(inner),
                other => terms.push(other),
            }
        }
        match terms.len() {
            0 => Node::Num(1),
            1 => terms.pop().unwrap(),
            _ => Node::And(terms),
        }
    }

    /// Evaluate under a variable assignment, with the same truncating
    /// semantics the constructors fold with.
    pub fn eval(&self, env: &HashMap<String, i64>) -> i64 {
        match self {
            Node::Num(n) => *n,
            Node::Var { name, .. } => *env
                .get(name)
                .unwrap_or_else(|| panic!("unbound variable {name}")),
            Node::Sum(parts) => parts.iter().map(|p| p.eval(env)).sum(),
            Node::Mul(a, k) => a.eval(env) * k,
            Node::Div(a, b) => a.eval(env) / b,
            Node::Mod(a, b) => a.eval(env) % b,
            Node::Lt(a, b) => (a.eval(env) < *b) as i64,
            Node::Ge(a, b) => (a.eval(env) >= *b) as i64,
            Node::And(parts) => parts.iter().all(|p| p.eval(env) != 0) as i64,
        }
    }

    /// Stable textual form, for debugging and cache keys only. Children of
    /// commutative nodes render in sorted order so the output is canonical.
    pub fn render(&self) -> String {
        match self {
            Node::Num(n) => n.to_string(),
            Node::Var { name, .. } => name.clone(),
            Node::Sum(parts) => {
                let mut rendered: Vec<String> = parts.iter().map(Node::render).collect();
                rendered.sort();
                format!("({})", rendered.join("+"))
            }
            Node::Mul(a, k) => format!("({}*{})", a.render(), k),
            Node::Div(a, b) => format!("({}//{})", a.render(), b),
            Node::Mod(a, b) => format!("({}%{})", a.render(), b),
            Node::Lt(a, b) => format!("({}<{})", a.render(), b),
            Node::Ge(a, b) => format!("({}>={})", a.render(), b),
            Node::And(parts) => {
                let mut rendered: Vec<String> = parts.iter().map(Node::render).collect();
                rendered.sort();
                format!("({})", rendered.join(" and "))
            }
        }
    }

    /// All variables referenced, deduplicated, in first-seen order.
    pub fn vars(&self) -> Vec<&Node> {
        fn walk<'a>(n: &'a Node, out: &mut Vec<&'a Node>) {
            match n {
                Node::Var { .. } => {
                    if !out.iter().any(|v| *v == n) {
                        out.push(n);
                    }
                }
                Node::Sum(ps) | Node::And(ps) => ps.iter().for_each(|p| walk(p, out)),
                Node::Mul(a, _) | Node::Div(a, _) | Node::Mod(a, _) | Node::Lt(a, _)
                | Node::Ge(a, _) => walk(a, out),
                Node::Num(_) => {}
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }
}

impl Add for Node {
    type Output = Node;
    fn add(self, rhs: Node) -> Node {
        Node::sum(vec![self, rhs])
    }
}

impl Add<i64> for Node {
    type Output = Node;
    fn add(self, rhs: i64) -> Node {
        Node::sum(vec![self, Node::Num(rhs)])
    }
}

impl Sub for Node {
    type Output = Node;
    fn sub(self, rhs: Node) -> Node {
        Node::sum(vec![self, rhs.muln(-1)])
    }
}

impl Sub<i64> for Node {
    type Output = Node;
    fn sub(self, rhs: i64) -> Node {
        Node::sum(vec![self, Node::Num(-rhs)])
    }
}

impl Mul<i64> for Node {
    type Output = Node;
    fn mul(self, rhs: i64) -> Node {
        self.muln(rhs)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
