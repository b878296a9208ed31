use std::collections::HashMap;

use fusor_core::Node;

fn check(v: Node, min: i64, max: i64, s: &str) {
    assert_eq!(v.render(), s);
    assert_eq!(v.min(), min, "min of {s}");
    assert_eq!(v.max(), max, "max of {s}");
}

fn var(name: &str, min: i64, max: i64) -> Node {
    Node::var(name, min, max)
}

#[test]
fn ge() {
    check(var("a", 3, 8).ge(77), 0, 0, "0");
    check(var("a", 3, 8).ge(9), 0, 0, "0");
    check(var("a", 3, 8).ge(8), 0, 1, "(a>=8)");
    check(var("a", 3, 8).ge(4), 0, 1, "(a>=4)");
    check(var("a", 3, 8).ge(3), 1, 1, "1");
    check(var("a", 3, 8).ge(2), 1, 1, "1");
}

#[test]
fn lt() {
    check(var("a", 3, 8).lt(77), 1, 1, "1");
    check(var("a", 3, 8).lt(9), 1, 1, "1");
    check(var("a", 3, 8).lt(8), 0, 1, "(a<8)");
    check(var("a", 3, 8).lt(4), 0, 1, "(a<4)");
    check(var("a", 3, 8).lt(3), 0, 0, "0");
    check(var("a", 3, 8).lt(2), 0, 0, "0");
}

#[test]
fn mul_0() {
    check(var("a", 0, 8) * 0, 0, 0, "0");
}

#[test]
fn mul_1() {
    check(var("a", 0, 8) * 1, 0, 8, "a");
}

#[test]
fn mul_2() {
    check(var("a", 0, 8) * 2, 0, 16, "(a*2)");
}

#[test]
fn div_1() {
    check(var("a", 0, 8).floordiv(1), 0, 8, "a");
}

#[test]
fn mod_1() {
    check(var("a", 0, 8).modulo(1), 0, 0, "0");
}

#[test]
fn add_min_max() {
    check(var("a", 0, 8) * 2 + 12, 12, 16 + 12, "((a*2)+12)");
}

#[test]
fn div_min_max() {
    check(var("a", 0, 7).floordiv(2), 0, 3, "(a//2)");
}

#[test]
fn sum_div_min_max() {
    check(
        Node::sum(vec![var("a", 0, 7), var("b", 0, 3)]).floordiv(2),
        0,
        5,
        "((a+b)//2)",
    );
}

#[test]
fn sum_div_factor() {
    check(
        Node::sum(vec![var("a", 0, 7) * 4, var("b", 0, 3) * 4]).floordiv(2),
        0,
        20,
        "((a*2)+(b*2))",
    );
}

#[test]
fn sum_div_some_factor() {
    check(
        Node::sum(vec![var("a", 0, 7) * 5, var("b", 0, 3) * 4]).floordiv(2),
        0,
        23,
        "(((a*5)//2)+(b*2))",
    );
}

#[test]
fn sum_div_no_factor() {
    check(
        Node::sum(vec![var("a", 0, 7) * 5, var("b", 0, 3) * 5]).floordiv(2),
        0,
        25,
        "(((a*5)+(b*5))//2)",
    );
}

#[test]
fn sum_div_const() {
    check(
        Node::sum(vec![var("a", 0, 7) * 4, Node::num(3)]).floordiv(4),
        0,
        7,
        "a",
    );
}

#[test]
fn sum_div_const_big() {
    check(
        Node::sum(vec![var("a", 0, 7) * 4, Node::num(3)]).floordiv(16),
        0,
        1,
        "(a//4)",
    );
}

#[test]
fn mod_mul() {
    check((var("a", 0, 5) * 10).modulo(9), 0, 5, "a");
}

#[test]
fn mul_mul() {
    check((var("a", 0, 5) * 10) * 9, 0, 5 * 10 * 9, "(a*90)");
}

#[test]
fn distribute_mul() {
    check(
        Node::sum(vec![var("a", 0, 3), var("b", 0, 5)]) * 3,
        0,
        24,
        "((a*3)+(b*3))",
    );
}

#[test]
fn mod_mul_sum() {
    check(
        Node::sum(vec![var("b", 0, 2), var("a", 0, 5) * 10]).modulo(9),
        0,
        7,
        "(a+b)",
    );
}

#[test]
fn sum_of_one() {
    check(Node::sum(vec![var("a", 0, 7)]), 0, 7, "a");
}

#[test]
fn mod_remove() {
    check(var("a", 0, 6).modulo(100), 0, 6, "a");
}

#[test]
fn big_mod() {
    check(var("a", -20, 20).modulo(10), -9, 9, "(a%10)");
    check(var("a", -20, 0).modulo(10), -9, 0, "(a%10)");
    check(var("a", -20, 1).modulo(10), -9, 1, "(a%10)");
    check(var("a", 0, 20).modulo(10), 0, 9, "(a%10)");
    check(var("a", -1, 20).modulo(10), -1, 9, "(a%10)");
}

#[test]
fn ge_remove() {
    check(var("a", 0, 6).ge(25), 0, 0, "0");
}

#[test]
fn lt_remove() {
    check(var("a", 0, 6).lt(-3), 0, 0, "0");
    check(var("a", 0, 6).lt(3), 0, 1, "(a<3)");
    check(var("a", 0, 6).lt(8), 1, 1, "1");
}

#[test]
fn and_fold() {
    check(Node::ands(vec![Node::num(0), var("a", 0, 1)]), 0, 0, "0");
}

#[test]
fn and_remove() {
    check(Node::ands(vec![Node::num(1), var("a", 0, 1)]), 0, 1, "a");
}

#[test]
fn mod_factor_negative() {
    check(
        Node::sum(vec![Node::num(-29), var("a", 0, 10), var("b", 0, 10) * 28]).modulo(28),
        -1,
        9,
        "((-1+a)%28)",
    );
    check(
        Node::sum(vec![Node::num(-29), var("a", 0, 100), var("b", 0, 10) * 28]).modulo(28),
        -1,
        27,
        "((-1+a)%28)",
    );
}

#[test]
fn sum_combine_num() {
    check(
        Node::sum(vec![Node::num(29), var("a", 0, 10), Node::num(-23)]),
        6,
        16,
        "(6+a)",
    );
}

#[test]
fn div_factor() {
    check(
        Node::sum(vec![
            Node::num(-44),
            var("a", 0, 10) * 2,
            var("b", 0, 10) * 40,
        ])
        .floordiv(40),
        -1,
        9,
        "(-1+b)",
    );
}

#[test]
fn mul_div() {
    check((var("a", 0, 10) * 4).floordiv(4), 0, 10, "a");
}

#[test]
fn mul_div_factor_mul() {
    check((var("a", 0, 10) * 8).floordiv(4), 0, 20, "(a*2)");
}

#[test]
fn mul_div_factor_div() {
    check((var("a", 0, 10) * 4).floordiv(8), 0, 5, "(a//2)");
}

#[test]
fn div_remove() {
    check(
        Node::sum(vec![var("idx0", 0, 127) * 4, var("idx2", 0, 3)]).floordiv(4),
        0,
        127,
        "idx0",
    );
}

// every sampled assignment lands inside the reported interval, and constant
// inputs collapse to exact values
fn check_numeric(f: impl Fn(Node) -> Node, fi: impl Fn(i64) -> i64) {
    const MIN: i64 = 0;
    const MAX: i64 = 10;
    for i in MIN..MAX {
        let v = f(Node::num(i));
        assert_eq!(v.min(), v.max());
        assert_eq!(v.min(), fi(i));
    }
    for kmin in MIN..MAX {
        for kmax in kmin..MAX {
            let v = f(var("tmp", kmin, kmax));
            let values: Vec<i64> = (kmin..=kmax).map(&fi).collect();
            assert!(v.min() <= *values.iter().min().unwrap());
            assert!(v.max() >= *values.iter().max().unwrap());
        }
    }
}

#[test]
fn numeric_mod_4() {
    check_numeric(|x| x.modulo(4), |x| x % 4);
}

#[test]
fn numeric_div_4() {
    check_numeric(|x| x.floordiv(4), |x| x / 4);
}

#[test]
fn numeric_plus_1_div_2() {
    check_numeric(|x| (x + 1).floordiv(2), |x| (x + 1) / 2);
}

#[test]
fn numeric_plus_1_mod_2() {
    check_numeric(|x| (x + 1).modulo(2), |x| (x + 1) % 2);
}

#[test]
fn numeric_times_2() {
    check_numeric(|x| x * 2, |x| x * 2);
}

#[test]
fn numeric_times_2_plus_3() {
    check_numeric(|x| x * 2 + 3, |x| x * 2 + 3);
}

#[test]
fn numeric_times_2_plus_3_mod_4() {
    check_numeric(|x| (x * 2 + 3).modulo(4), |x| (x * 2 + 3) % 4);
}

#[test]
fn numeric_times_2_plus_3_div_4() {
    check_numeric(|x| (x * 2 + 3).floordiv(4), |x| (x * 2 + 3) / 4);
}

#[test]
fn numeric_times_2_plus_3_div_4_mod_4() {
    check_numeric(
        |x| (x * 2 + 3).floordiv(4).modulo(4),
        |x| ((x * 2 + 3) / 4) % 4,
    );
}

// evaluation agrees with the rendered algebra under substitution
#[test]
fn eval_matches_structure() {
    let e = Node::sum(vec![var("x", 0, 9) * 3, var("y", 0, 4)])
        .floordiv(2)
        .modulo(5);
    for x in 0..10 {
        for y in 0..5 {
            let mut env = HashMap::new();
            env.insert("x".to_string(), x);
            env.insert("y".to_string(), y);
            assert_eq!(e.eval(&env), ((x * 3 + y) / 2) % 5);
        }
    }
}
