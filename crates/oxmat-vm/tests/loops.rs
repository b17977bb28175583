mod common;

use common::{num, run, Frame};
use oxmat_builtins::{CellArray, StructValue, Tensor, Value};
use oxmat_vm::builder::A;
use oxmat_vm::unit::RegionKind;
use oxmat_vm::Op;

/// Emit `for k = <iterable on stack>; <body>; end`, leaving loop cleanup
/// in place. The iterable must already be on the stack.
fn emit_for(f: &mut Frame, k: &str, body: impl FnOnce(&mut Frame)) {
    let l_cond = f.b.label();
    let l_after = f.b.label();
    let body_start = f.b.label();
    let body_end = f.b.label();
    f.op(Op::ForSetup, &[]);
    f.b.bind(l_cond);
    let k_slot = f.slot(k);
    f.op(Op::ForCond, &[A::U(k_slot), A::L(l_after)]);
    f.b.bind(body_start);
    body(f);
    f.b.bind(body_end);
    f.op(Op::Jmp, &[A::L(l_cond)]);
    f.b.bind(l_after);
    f.op(Op::PopNInts, &[A::U(2)]);
    f.op(Op::Pop, &[]);
    f.b.region(RegionKind::ForLoop, body_start, body_end, None, 0);
}

#[test]
fn range_loop_sums() {
    // s = 0; for k = 1:5; s = s + k; end
    let mut f = Frame::new("main", &["s"], &[], &["k"]);
    f.load_num(0.0).assign("s");
    f.load_num(1.0).load_num(5.0).op(Op::Colon2, &[]);
    emit_for(&mut f, "k", |f| {
        f.push_var("s").push_var("k").op(Op::Add, &[]).assign("s");
    });
    f.ret();
    let out = run(f, vec![], 1).unwrap();
    assert_eq!(num(&out[0]), 15.0);
}

#[test]
fn matrix_iterates_column_wise() {
    // for k = M with M 2x2: two iterations, each a column vector; sum
    // the second column's entries.
    let mut f = Frame::new("main", &["s"], &["m"], &["k", "last"]);
    f.load_num(0.0).assign("s");
    f.push_var("m");
    emit_for(&mut f, "k", |f| {
        f.push_var("k").assign("last");
    });
    // last = [2; 4] for column-major [1 2; 3 4].
    f.push_var("last");
    f.load_num(1.0);
    let last = f.slot("last");
    f.op(Op::IndexIdNargout1, &[A::U(last), A::U(1)]);
    f.push_var("last");
    f.load_num(2.0);
    f.op(Op::IndexIdNargout1, &[A::U(last), A::U(1)]);
    f.op(Op::Add, &[]);
    f.assign("s").ret();
    let m = Value::Tensor(Tensor::new_2d(vec![1.0, 3.0, 2.0, 4.0], 2, 2).unwrap());
    let out = run(f, vec![m], 1).unwrap();
    assert_eq!(num(&out[0]), 6.0);
}

#[test]
fn scalar_iterates_once() {
    let mut f = Frame::new("main", &["s"], &[], &["k"]);
    f.load_num(0.0).assign("s");
    f.load_num(41.0);
    emit_for(&mut f, "k", |f| {
        f.push_var("s").load_num(1.0).op(Op::Add, &[]).assign("s");
    });
    f.ret();
    let out = run(f, vec![], 1).unwrap();
    assert_eq!(num(&out[0]), 1.0);
}

#[test]
fn empty_shapes_iterate_zero_times() {
    // A 0x3 cell and a 3x0 matrix both give zero iterations.
    for iterable in [
        Value::Cell(CellArray::sized(0, 3)),
        Value::Tensor(Tensor::new_2d(vec![], 3, 0).unwrap()),
    ] {
        let mut f = Frame::new("main", &["s"], &["it"], &["k"]);
        f.load_num(0.0).assign("s");
        f.push_var("it");
        emit_for(&mut f, "k", |f| {
            f.push_var("s").load_num(1.0).op(Op::Add, &[]).assign("s");
        });
        f.ret();
        let out = run(f, vec![iterable], 1).unwrap();
        assert_eq!(num(&out[0]), 0.0);
    }
}

#[test]
fn empty_loop_still_binds_induction_variable() {
    let mut f = Frame::new("main", &["r"], &["it"], &["k"]);
    f.push_var("it");
    emit_for(&mut f, "k", |_| {});
    f.push_var("k").assign("r").ret();
    let empty = Value::Tensor(Tensor::new_2d(vec![], 3, 0).unwrap());
    let out = run(f, vec![empty], 1).unwrap();
    match &out[0] {
        Value::Tensor(t) => assert!(t.is_empty()),
        other => panic!("expected the empty iterable, got {other:?}"),
    }
}

#[test]
fn cell_loop_yields_subcells() {
    // for k = {1, 2}: each k is a 1x1 cell.
    let mut f = Frame::new("main", &["r"], &[], &["k", "last"]);
    let cell = CellArray::new(vec![Value::Num(7.0), Value::Num(9.0)], 1, 2).unwrap();
    f.load_value(Value::Cell(cell));
    emit_for(&mut f, "k", |f| {
        f.push_var("k").assign("last");
    });
    // last{1} == 9
    f.push_var("last");
    f.load_num(1.0);
    let last = f.slot("last");
    f.op(Op::IndexCellIdNargout1, &[A::U(last), A::U(1)]);
    f.assign("r").ret();
    let out = run(f, vec![], 1).unwrap();
    assert_eq!(num(&out[0]), 9.0);
}

#[test]
fn break_out_of_loop_pops_counters() {
    // for k = 1:10; if k == 3, break; end; s = k; end
    let mut f = Frame::new("main", &["s"], &[], &["k"]);
    f.load_num(0.0).assign("s");
    f.load_num(1.0).load_num(10.0).op(Op::Colon2, &[]);

    let l_cond = f.b.label();
    let l_after = f.b.label();
    let l_break = f.b.label();
    let l_no = f.b.label();
    f.op(Op::ForSetup, &[]);
    f.b.bind(l_cond);
    let k = f.slot("k");
    f.op(Op::ForCond, &[A::U(k), A::L(l_after)]);
    f.push_var("k").load_num(3.0).op(Op::Eq, &[]);
    f.op(Op::JmpIfn, &[A::L(l_no)]);
    f.op(Op::Jmp, &[A::L(l_break)]); // break
    f.b.bind(l_no);
    f.push_var("k").assign("s");
    f.op(Op::Jmp, &[A::L(l_cond)]);
    f.b.bind(l_break);
    // break path and normal exit share the counter cleanup
    f.b.bind(l_after);
    f.op(Op::PopNInts, &[A::U(2)]);
    f.op(Op::Pop, &[]);
    f.ret();
    let out = run(f, vec![], 1).unwrap();
    assert_eq!(num(&out[0]), 2.0);
}

#[test]
fn struct_loop_visits_fields_in_order() {
    // for [v, name] = s: collect the last field name and the value sum.
    let mut st = StructValue::new();
    st.set("alpha", Value::Num(1.0));
    st.set("beta", Value::Num(2.0));

    let mut f = Frame::new("main", &["sum", "lastname"], &["s"], &["k", "v"]);
    f.load_num(0.0).assign("sum");
    f.push_var("s");
    let l_cond = f.b.label();
    let l_after = f.b.label();
    f.op(Op::ForComplexSetup, &[A::L(l_after)]);
    f.b.bind(l_cond);
    let k = f.slot("k");
    let v = f.slot("v");
    f.op(Op::ForComplexCond, &[A::L(l_after), A::U(k), A::U(v)]);
    f.push_var("sum").push_var("v").op(Op::Add, &[]).assign("sum");
    f.push_var("k").assign("lastname");
    f.op(Op::Jmp, &[A::L(l_cond)]);
    f.b.bind(l_after);
    f.op(Op::PopNInts, &[A::U(2)]);
    f.op(Op::Pop, &[]);
    f.ret();
    let out = run(f, vec![Value::Struct(st)], 2).unwrap();
    assert_eq!(num(&out[0]), 3.0);
    assert!(matches!(&out[1], Value::Str(s) if s == "beta"));
}
