mod common;

use common::{num, Frame};
use oxmat_builtins::{Tensor, Value};
use oxmat_vm::{Interp, Op};

/// function r = f(x, y); r = x + y; end
fn adder() -> Frame {
    let mut f = Frame::new("f", &["r"], &["x", "y"], &[]);
    f.push_var("x").push_var("y").op(Op::Add, &[]);
    f.assign("r").ret();
    f
}

#[test]
fn repeated_runs_are_byte_identical_and_bit_identical() {
    // Running the same arithmetic twice on same-typed operands leaves
    // the code bytes stable and the results identical.
    let mut interp = Interp::new();
    let unit = adder().finish().into_rc();
    interp.register_unit(unit.clone());

    let args = || vec![Value::Num(0.1), Value::Num(0.2)];
    let r1 = oxmat_vm::call(&mut interp, unit.clone(), args(), 1).unwrap();
    let bytes_after_first = unit.code_bytes();
    let r2 = oxmat_vm::call(&mut interp, unit.clone(), args(), 1).unwrap();
    let bytes_after_second = unit.code_bytes();

    assert_eq!(bytes_after_first, bytes_after_second);
    assert_eq!(num(&r1[0]).to_bits(), num(&r2[0]).to_bits());
}

#[test]
fn generic_specializes_then_recovers() {
    let mut interp = Interp::new();
    let unit = adder().finish().into_rc();
    interp.register_unit(unit.clone());

    // Scalars: ADD becomes ADD_DBL.
    let r = oxmat_vm::call(
        &mut interp,
        unit.clone(),
        vec![Value::Num(1.0), Value::Num(2.0)],
        1,
    )
    .unwrap();
    assert_eq!(num(&r[0]), 3.0);
    let rows = oxmat_vm::disassemble(&unit).unwrap();
    assert!(rows.iter().any(|(_, t)| t == "ADD_DBL"));

    // Tensors through the same code: the opcode reverts to ADD and the
    // result is elementwise.
    let a = Value::Tensor(Tensor::row(vec![1.0, 2.0]));
    let b = Value::Tensor(Tensor::row(vec![10.0, 20.0]));
    let r = oxmat_vm::call(&mut interp, unit.clone(), vec![a, b], 1).unwrap();
    match &r[0] {
        Value::Tensor(t) => assert_eq!(t.data, vec![11.0, 22.0]),
        other => panic!("expected tensor, got {other:?}"),
    }
    let rows = oxmat_vm::disassemble(&unit).unwrap();
    assert!(rows.iter().any(|(_, t)| t == "ADD"));
    assert!(!rows.iter().any(|(_, t)| t == "ADD_DBL"));

    // And back again.
    let r = oxmat_vm::call(
        &mut interp,
        unit.clone(),
        vec![Value::Num(5.0), Value::Num(6.0)],
        1,
    )
    .unwrap();
    assert_eq!(num(&r[0]), 11.0);
    let rows = oxmat_vm::disassemble(&unit).unwrap();
    assert!(rows.iter().any(|(_, t)| t == "ADD_DBL"));
}

#[test]
fn mixed_types_in_one_run_settle_on_generic() {
    // function r = g(x, y, m); r = (x + y) + (m + m); end
    // The first ADD specializes; the tensor ADD stays generic.
    let mut g = Frame::new("g", &["r"], &["x", "y", "m"], &[]);
    g.push_var("x").push_var("y").op(Op::Add, &[]);
    g.push_var("m").push_var("m").op(Op::Add, &[]);
    g.op(Op::Add, &[]);
    g.assign("r").ret();

    let mut interp = Interp::new();
    let unit = g.finish().into_rc();
    interp.register_unit(unit.clone());
    let m = Value::Tensor(Tensor::row(vec![1.0, 1.0]));
    let r = oxmat_vm::call(
        &mut interp,
        unit.clone(),
        vec![Value::Num(1.0), Value::Num(2.0), m],
        1,
    )
    .unwrap();
    match &r[0] {
        Value::Tensor(t) => assert_eq!(t.data, vec![5.0, 5.0]),
        other => panic!("expected tensor, got {other:?}"),
    }
    let rows = oxmat_vm::disassemble(&unit).unwrap();
    // One specialized site, two generic sites remain.
    assert_eq!(rows.iter().filter(|(_, t)| t == "ADD_DBL").count(), 1);
    assert_eq!(rows.iter().filter(|(_, t)| t == "ADD").count(), 2);
}
