mod common;

use common::{find_op, num, run, run_with, Frame};
use oxmat_builtins::{CellArray, Tensor, Value};
use oxmat_vm::builder::A;
use oxmat_vm::{Interp, Op, VmError};

#[test]
fn cs_list_rhs_collapses_to_first_element() {
    // b = a{:} with a = {7} assigns 7.
    let mut f = Frame::new("main", &["b"], &["a"], &[]);
    let a = f.slot("a");
    f.push_var("a").load_colon();
    f.op(Op::IndexCellIdNargout1, &[A::U(a), A::U(1)]);
    f.assign("b").ret();
    let cell = CellArray::new(vec![Value::Num(7.0)], 1, 1).unwrap();
    let out = run(f, vec![Value::Cell(cell)], 1).unwrap();
    assert_eq!(num(&out[0]), 7.0);
}

#[test]
fn empty_cs_list_rhs_is_an_error() {
    let mut f = Frame::new("main", &["b"], &["a"], &[]);
    let a = f.slot("a");
    f.push_var("a").load_colon();
    f.op(Op::IndexCellIdNargout1, &[A::U(a), A::U(1)]);
    f.assign("b").ret();
    let out = run(f, vec![Value::Cell(CellArray::empty())], 1);
    match out {
        Err(VmError::Exception(e)) => {
            assert!(
                e.message.contains("invalid number of elements"),
                "got {}",
                e.message
            )
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn undefined_rhs_is_an_error_unless_forced() {
    let mut f = Frame::new("main", &["b"], &[], &["u"]);
    f.push_var("u").assign("b").ret();
    match run(f, vec![], 1) {
        Err(VmError::Exception(e)) => {
            assert!(e.message.contains("undefined"), "got {}", e.message)
        }
        other => panic!("expected error, got {other:?}"),
    }

    let mut f2 = Frame::new("main", &["b"], &[], &["u"]);
    let b = f2.slot("b");
    f2.push_var("u");
    f2.op(Op::ForceAssign, &[A::U(b)]);
    f2.load_num(1.0).op(Op::Pop, &[]);
    f2.ret();
    // FORCE_ASSIGN accepts the undefined rhs; the return slot stays
    // undefined, which the root return tolerates.
    let out = run(f2, vec![], 1).unwrap();
    assert!(matches!(out[0], Value::Undef));
}

#[test]
fn compound_assignment_applies_operator() {
    // x = 10; x += 5
    let mut f = Frame::new("main", &["x"], &[], &[]);
    let x = f.slot("x");
    f.load_num(10.0).assign("x");
    f.load_num(5.0);
    f.op(Op::AssignCompound, &[A::U(x), A::U(0)]);
    f.ret();
    let out = run(f, vec![], 1).unwrap();
    assert_eq!(num(&out[0]), 15.0);
}

#[test]
fn compound_assignment_requires_defined_lhs() {
    let mut f = Frame::new("main", &["x"], &[], &[]);
    let x = f.slot("x");
    f.load_num(5.0);
    f.op(Op::AssignCompound, &[A::U(x), A::U(0)]);
    f.ret();
    assert!(matches!(run(f, vec![], 1), Err(VmError::Exception(_))));
}

#[test]
fn indexed_store_specializes_to_mat_2d() {
    // M = [1 2; 3 4]; M(2,1) = 9
    let mut f = Frame::new("main", &["m"], &[], &[]);
    let m = f.slot("m");
    f.load_num(1.0).load_num(2.0).load_num(3.0).load_num(4.0);
    f.op(Op::Matrix, &[A::U(2), A::U(2)]);
    f.assign("m");
    f.load_num(2.0).load_num(1.0).load_num(9.0);
    f.op(Op::SubassignId, &[A::U(m), A::U(2)]);
    f.ret();
    let mut interp = Interp::new();
    let (res, unit) = run_with(&mut interp, f.finish(), vec![], 1);
    let out = res.unwrap();
    match &out[0] {
        Value::Tensor(t) => {
            assert_eq!(t.get2(1, 0).unwrap(), 9.0);
            assert_eq!(t.get2(0, 0).unwrap(), 1.0);
            assert_eq!(t.get2(0, 1).unwrap(), 2.0);
            assert_eq!(t.get2(1, 1).unwrap(), 4.0);
        }
        other => panic!("expected matrix, got {other:?}"),
    }
    assert!(find_op(&unit, "SUBASSIGN_ID_MAT_2D").is_some());
}

#[test]
fn out_of_bounds_store_grows_through_generic_path() {
    // M = [1]; M(2,3) = 5 grows to 2x3.
    let mut f = Frame::new("main", &["m"], &[], &[]);
    let m = f.slot("m");
    f.load_num(1.0).assign("m");
    f.load_num(2.0).load_num(3.0).load_num(5.0);
    f.op(Op::SubassignId, &[A::U(m), A::U(2)]);
    f.ret();
    let out = run(f, vec![], 1).unwrap();
    match &out[0] {
        Value::Tensor(t) => {
            assert_eq!(t.rows(), 2);
            assert_eq!(t.cols(), 3);
            assert_eq!(t.get2(1, 2).unwrap(), 5.0);
            assert_eq!(t.get2(0, 0).unwrap(), 1.0);
        }
        other => panic!("expected matrix, got {other:?}"),
    }
}

#[test]
fn store_despecializes_when_types_change() {
    // First store specializes; a cell store through the same opcode
    // rewrites it back.
    let mut f = Frame::new("main", &["m"], &["v"], &[]);
    let m = f.slot("m");
    f.push_var("v").assign("m");
    f.load_num(1.0).load_num(1.0).load_num(9.0);
    f.op(Op::SubassignId, &[A::U(m), A::U(2)]);
    f.ret();

    // Run once with a matrix: specializes.
    let mut interp = Interp::new();
    let unit = f.finish().into_rc();
    interp.register_unit(unit.clone());
    let m0 = Value::Tensor(Tensor::new_2d(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap());
    oxmat_vm::call(&mut interp, unit.clone(), vec![m0], 1).unwrap();
    assert!(oxmat_vm::disassemble(&unit)
        .unwrap()
        .iter()
        .any(|(_, t)| t.starts_with("SUBASSIGN_ID_MAT_2D")));

    // Run again with a cell receiver: back to the generic opcode, and
    // the store reports a type error from the generic path.
    let c = Value::Cell(CellArray::sized(2, 2));
    let res = oxmat_vm::call(&mut interp, unit.clone(), vec![c], 1);
    assert!(res.is_err());
    assert!(oxmat_vm::disassemble(&unit)
        .unwrap()
        .iter()
        .any(|(_, t)| t.starts_with("SUBASSIGN_ID ")));
}

#[test]
fn cell_brace_store_grows() {
    // c = {}; c{3} = 7
    let mut f = Frame::new("main", &["c"], &[], &[]);
    let c = f.slot("c");
    f.load_value(Value::Cell(CellArray::empty())).assign("c");
    f.load_num(3.0).load_num(7.0);
    f.op(Op::SubassignCellId, &[A::U(c), A::U(1)]);
    f.ret();
    let out = run(f, vec![], 1).unwrap();
    match &out[0] {
        Value::Cell(cell) => {
            assert_eq!(cell.cols, 3);
            assert!(matches!(cell.get(0, 2).unwrap(), Value::Num(n) if *n == 7.0));
        }
        other => panic!("expected cell, got {other:?}"),
    }
}

#[test]
fn struct_field_store_autovivifies() {
    // s.x = 3 with s previously undefined.
    let mut f = Frame::new("main", &["s"], &[], &["x"]);
    let s = f.slot("s");
    let x = f.slot("x");
    f.load_num(3.0);
    f.op(Op::SubassignStruct, &[A::U(s), A::U(x)]);
    f.ret();
    let out = run(f, vec![], 1).unwrap();
    match &out[0] {
        Value::Struct(st) => assert!(matches!(st.get("x"), Some(Value::Num(n)) if *n == 3.0)),
        other => panic!("expected struct, got {other:?}"),
    }
}

#[test]
fn chained_store_builds_nested_structs() {
    // s.a.b = 5
    let mut f = Frame::new("main", &["s"], &[], &[]);
    let s = f.slot("s");
    f.load_num(5.0); // rhs first
    f.push_var("s"); // then the lhs value
    f.load_str("a");
    f.load_str("b");
    f.b
        .emit_subassign_chained(s as u16, None, &[(1, '.'), (1, '.')])
        .unwrap();
    f.ret();
    let out = run(f, vec![], 1).unwrap();
    match &out[0] {
        Value::Struct(st) => match st.get("a") {
            Some(Value::Struct(inner)) => {
                assert!(matches!(inner.get("b"), Some(Value::Num(n)) if *n == 5.0))
            }
            other => panic!("expected nested struct, got {other:?}"),
        },
        other => panic!("expected struct, got {other:?}"),
    }
}

#[test]
fn chained_compound_store_reads_then_writes() {
    // s.a.b += 2 after s.a.b = 5.
    let mut f = Frame::new("main", &["s"], &[], &[]);
    let s = f.slot("s");
    f.load_num(5.0);
    f.push_var("s");
    f.load_str("a");
    f.load_str("b");
    f.b
        .emit_subassign_chained(s as u16, None, &[(1, '.'), (1, '.')])
        .unwrap();
    f.load_num(2.0);
    f.push_var("s");
    f.load_str("a");
    f.load_str("b");
    f.b
        .emit_subassign_chained(s as u16, Some(0), &[(1, '.'), (1, '.')])
        .unwrap();
    f.ret();
    let out = run(f, vec![], 1).unwrap();
    match &out[0] {
        Value::Struct(st) => match st.get("a") {
            Some(Value::Struct(inner)) => {
                assert!(matches!(inner.get("b"), Some(Value::Num(n)) if *n == 7.0))
            }
            other => panic!("expected nested struct, got {other:?}"),
        },
        other => panic!("expected struct, got {other:?}"),
    }
}

#[test]
fn multi_assign_reports_missing_element_number() {
    // [a, b] = f() where f leaves its second return undefined.
    let mut g = Frame::new("g", &["p", "q"], &[], &[]);
    g.load_num(1.0).assign("p");
    g.ret();
    let mut interp = Interp::new();
    interp.register_unit(g.finish().into_rc());

    let mut m = Frame::new("main", &["a", "b"], &[], &["g"]);
    m.call("g", 0, 2, |_| {});
    m.b
        .emit_assign_n(&[m.slot16("b"), m.slot16("a")])
        .unwrap();
    m.ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 2);
    match res {
        Err(VmError::Exception(e)) => {
            assert!(
                e.message.contains("element number 2 undefined"),
                "got {}",
                e.message
            )
        }
        other => panic!("expected error, got {other:?}"),
    }
}
