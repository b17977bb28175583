mod common;

use common::{num, run_with, Frame};
use oxmat_vm::builder::A;
use oxmat_vm::{Interp, Op, VmError};

/// function [p, q] = f(); p = 1; q = 2; end
fn both_defined() -> Frame {
    let mut f = Frame::new("f", &["p", "q"], &[], &[]);
    f.load_num(1.0).assign("p");
    f.load_num(2.0).assign("q");
    f.ret();
    f
}

/// function [p, q] = g(); q = 2; end  -- first return left undefined.
fn first_undefined() -> Frame {
    let mut g = Frame::new("g", &["p", "q"], &[], &[]);
    g.load_num(2.0).assign("q");
    g.ret();
    g
}

#[test]
fn tilde_skips_an_output() {
    // [~, x] = f()
    let mut interp = Interp::new();
    interp.register_unit(both_defined().finish().into_rc());

    let mut m = Frame::new("main", &["x"], &[], &["f", "%~1"]);
    m.b.emit_set_ignore_outputs(2, &[1]).unwrap();
    m.call("f", 0, 2, |_| {});
    m.b
        .emit_assign_n(&[m.slot16("x"), m.slot16("%~1")])
        .unwrap();
    m.b
        .emit_clear_ignore_outputs(&[m.slot16("%~1")])
        .unwrap();
    m.ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    assert_eq!(num(&res.unwrap()[0]), 2.0);
}

#[test]
fn ignored_position_tolerates_undefined_return() {
    // [~, x] = g() where g never defines its first output.
    let mut interp = Interp::new();
    interp.register_unit(first_undefined().finish().into_rc());

    let mut m = Frame::new("main", &["x"], &[], &["g", "%~1"]);
    m.b.emit_set_ignore_outputs(2, &[1]).unwrap();
    m.call("g", 0, 2, |_| {});
    m.b
        .emit_assign_n(&[m.slot16("x"), m.slot16("%~1")])
        .unwrap();
    m.b
        .emit_clear_ignore_outputs(&[m.slot16("%~1")])
        .unwrap();
    m.ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    assert_eq!(num(&res.unwrap()[0]), 2.0);
}

#[test]
fn unignored_undefined_return_still_errors() {
    let mut interp = Interp::new();
    interp.register_unit(first_undefined().finish().into_rc());

    let mut m = Frame::new("main", &["a", "x"], &[], &["g"]);
    m.call("g", 0, 2, |_| {});
    m.b
        .emit_assign_n(&[m.slot16("x"), m.slot16("a")])
        .unwrap();
    m.ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 2);
    match res {
        Err(VmError::Exception(e)) => {
            assert!(e.message.contains("undefined in return list"), "got {}", e.message)
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn lvalue_list_restores_after_clear() {
    let mut interp = Interp::new();
    interp.register_unit(both_defined().finish().into_rc());

    let mut m = Frame::new("main", &["x"], &[], &["f", "%~1"]);
    m.b.emit_set_ignore_outputs(2, &[1]).unwrap();
    m.call("f", 0, 2, |_| {});
    m.b
        .emit_assign_n(&[m.slot16("x"), m.slot16("%~1")])
        .unwrap();
    m.b
        .emit_clear_ignore_outputs(&[m.slot16("%~1")])
        .unwrap();
    m.ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    res.unwrap();
    assert!(interp.lvalue_list.is_none(), "call-site lvalue list restored");
}

#[test]
fn ignore_state_survives_unwind() {
    // The callee faults with the ignore protocol active; the saved
    // lvalue stack must restore on the way out.
    let mut g = Frame::new("g", &["p", "q"], &[], &["error"]);
    g.push_var("error");
    g.load_str("G:fail");
    g.load_str("boom");
    let err = g.slot("error");
    g.op(Op::IndexIdNargout0, &[A::U(err), A::U(2)]);
    g.op(Op::Pop, &[]);
    g.ret();
    let mut interp = Interp::new();
    interp.register_unit(g.finish().into_rc());

    let mut m = Frame::new("main", &["x"], &[], &["g", "%~1"]);
    m.b.emit_set_ignore_outputs(2, &[1]).unwrap();
    m.call("g", 0, 2, |_| {});
    m.b
        .emit_assign_n(&[m.slot16("x"), m.slot16("%~1")])
        .unwrap();
    m.b
        .emit_clear_ignore_outputs(&[m.slot16("%~1")])
        .unwrap();
    m.ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    assert!(res.is_err());
    assert!(interp.lvalue_list.is_none());
}
