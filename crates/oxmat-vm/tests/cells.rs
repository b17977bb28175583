mod common;

use common::{num, run, Frame};
use oxmat_builtins::{CellArray, Value};
use oxmat_vm::builder::A;
use oxmat_vm::{Op, VmError};

#[test]
fn single_row_cell_literal() {
    // c = {1, 'two', 3}
    let mut f = Frame::new("main", &["c"], &[], &[]);
    f.op(Op::PushCell, &[A::U(1), A::U(3)]);
    f.load_num(1.0).op(Op::AppendCell, &[A::U(0)]);
    f.load_str("two").op(Op::AppendCell, &[A::U(0)]);
    f.load_num(3.0).op(Op::AppendCell, &[A::U(3)]);
    f.assign("c").ret();
    let out = run(f, vec![], 1).unwrap();
    match &out[0] {
        Value::Cell(c) => {
            assert_eq!((c.rows, c.cols), (1, 3));
            assert!(matches!(c.get(0, 1).unwrap(), Value::Str(s) if s == "two"));
        }
        other => panic!("expected cell, got {other:?}"),
    }
}

#[test]
fn two_row_cell_literal() {
    // c = {1, 2; 3, 4}
    let mut f = Frame::new("main", &["c"], &[], &[]);
    f.op(Op::PushCell, &[A::U(2), A::U(2)]);
    f.load_num(1.0).op(Op::AppendCell, &[A::U(0)]);
    f.load_num(2.0).op(Op::AppendCell, &[A::U(4)]); // first row of many
    f.load_num(3.0).op(Op::AppendCell, &[A::U(0)]);
    f.load_num(4.0).op(Op::AppendCell, &[A::U(2)]); // last row of many
    f.assign("c").ret();
    let out = run(f, vec![], 1).unwrap();
    match &out[0] {
        Value::Cell(c) => {
            assert_eq!((c.rows, c.cols), (2, 2));
            assert!(matches!(c.get(1, 0).unwrap(), Value::Num(n) if *n == 3.0));
        }
        other => panic!("expected cell, got {other:?}"),
    }
}

#[test]
fn cs_list_spread_grows_the_first_row() {
    // a = {8, 9}; c = {1, a{:}, 2} becomes 1x4.
    let mut f = Frame::new("main", &["c"], &["a"], &[]);
    let a = f.slot("a");
    f.op(Op::PushCell, &[A::U(1), A::U(3)]);
    f.load_num(1.0).op(Op::AppendCell, &[A::U(0)]);
    f.push_var("a").load_colon();
    f.op(Op::IndexCellIdNargout1, &[A::U(a), A::U(1)]);
    f.op(Op::AppendCell, &[A::U(0)]);
    f.load_num(2.0).op(Op::AppendCell, &[A::U(3)]);
    f.assign("c").ret();
    let cell = CellArray::new(vec![Value::Num(8.0), Value::Num(9.0)], 1, 2).unwrap();
    let out = run(f, vec![Value::Cell(cell)], 1).unwrap();
    match &out[0] {
        Value::Cell(c) => {
            assert_eq!((c.rows, c.cols), (1, 4));
            let got: Vec<f64> = (0..4).map(|i| num(c.get(0, i).unwrap())).collect();
            assert_eq!(got, vec![1.0, 8.0, 9.0, 2.0]);
        }
        other => panic!("expected cell, got {other:?}"),
    }
}

#[test]
fn empty_spreads_collapse_to_one_by_zero() {
    // a = {}; c = {a{:}, a{:}}; size(c) == [1 0]
    let mut f = Frame::new("main", &["r", "cc"], &["a"], &[]);
    let a = f.slot("a");
    f.op(Op::PushCell, &[A::U(1), A::U(2)]);
    f.push_var("a").load_colon();
    f.op(Op::IndexCellIdNargout1, &[A::U(a), A::U(1)]);
    f.op(Op::AppendCell, &[A::U(0)]);
    f.push_var("a").load_colon();
    f.op(Op::IndexCellIdNargout1, &[A::U(a), A::U(1)]);
    f.op(Op::AppendCell, &[A::U(3)]);
    f.assign("cc").ret();
    let out = run(f, vec![Value::Cell(CellArray::empty())], 2).unwrap();
    match &out[1] {
        Value::Cell(c) => assert_eq!((c.rows, c.cols), (1, 0)),
        other => panic!("expected cell, got {other:?}"),
    }
}

#[test]
fn mismatched_row_widths_error() {
    // c = {1, 2; 3}
    let mut f = Frame::new("main", &["c"], &[], &[]);
    f.op(Op::PushCell, &[A::U(2), A::U(2)]);
    f.load_num(1.0).op(Op::AppendCell, &[A::U(0)]);
    f.load_num(2.0).op(Op::AppendCell, &[A::U(4)]);
    f.load_num(3.0).op(Op::AppendCell, &[A::U(2)]);
    f.assign("c").ret();
    match run(f, vec![], 1) {
        Err(VmError::Exception(e)) => {
            assert!(e.message.contains("columns must match"), "got {}", e.message)
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn brace_multi_read_expands_into_targets() {
    // [x, y] = c{:} with c = {5, 6}
    let mut f = Frame::new("main", &["x", "y"], &["c"], &[]);
    let c = f.slot("c");
    f.push_var("c").load_colon();
    f.op(Op::IndexCellIdNargoutN, &[A::U(c), A::U(2), A::U(1)]);
    f.b
        .emit_assign_n(&[f.slot16("y"), f.slot16("x")])
        .unwrap();
    f.ret();
    let cell = CellArray::new(vec![Value::Num(5.0), Value::Num(6.0)], 1, 2).unwrap();
    let out = run(f, vec![Value::Cell(cell)], 2).unwrap();
    assert_eq!(num(&out[0]), 5.0);
    assert_eq!(num(&out[1]), 6.0);
}

#[test]
fn paren_read_of_cell_selects_subcell() {
    // d = c(2) keeps the cell wrapper.
    let mut f = Frame::new("main", &["d"], &["c"], &[]);
    let c = f.slot("c");
    f.push_var("c").load_num(2.0);
    f.op(Op::IndexIdNargout1, &[A::U(c), A::U(1)]);
    f.assign("d").ret();
    let cell = CellArray::new(vec![Value::Num(5.0), Value::Num(6.0)], 1, 2).unwrap();
    let out = run(f, vec![Value::Cell(cell)], 1).unwrap();
    match &out[0] {
        Value::Cell(c) => {
            assert_eq!((c.rows, c.cols), (1, 1));
            assert!(matches!(c.get(0, 0).unwrap(), Value::Num(n) if *n == 6.0));
        }
        other => panic!("expected sub-cell, got {other:?}"),
    }
}
