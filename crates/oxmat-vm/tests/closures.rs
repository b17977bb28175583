mod common;

use common::{num, run_with, Frame};
use oxmat_builtins::{ClosureFrame, FnHandle, Value};
use oxmat_vm::builder::A;
use oxmat_vm::{Interp, Op};

#[test]
fn named_handle_calls_through_the_table() {
    // g = @sqrt; r = g(49)
    let mut m = Frame::new("main", &["r"], &[], &["@sqrt", "g"]);
    let h = m.slot("@sqrt");
    m.op(Op::PushFcnHandle, &[A::U(h)]);
    m.assign("g");
    m.push_var("g");
    m.load_num(49.0);
    let g = m.slot("g");
    m.op(Op::IndexIdNargout1, &[A::U(g), A::U(1)]);
    m.assign("r").ret();
    let mut interp = Interp::new();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    assert_eq!(num(&res.unwrap()[0]), 7.0);
}

#[test]
fn named_handle_to_user_function() {
    let mut f = Frame::new("double_it", &["r"], &["x"], &[]);
    f.push_var("x").load_num(2.0).op(Op::Mul, &[]);
    f.assign("r").ret();
    let mut interp = Interp::new();
    interp.register_unit(f.finish().into_rc());

    let mut m = Frame::new("main", &["r"], &[], &["@double_it", "g"]);
    let h = m.slot("@double_it");
    m.op(Op::PushFcnHandle, &[A::U(h)]);
    m.assign("g");
    m.push_var("g");
    m.load_num(21.0);
    let g = m.slot("g");
    m.op(Op::IndexIdNargout1, &[A::U(g), A::U(1)]);
    m.assign("r").ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    assert_eq!(num(&res.unwrap()[0]), 42.0);
}

#[test]
fn anonymous_handle_captures_by_value() {
    // a = 5; g = @(x) x + a; a = 100; r = g(4)  -- r is 9, not 104.
    let mut interp = Interp::new();

    // The compiled anonymous body: slots %nargout, x (arg), a (capture).
    let mut anon = Frame::new("@<anonymous>", &[], &["x"], &["a"]);
    anon.b.set_kind("anonymous");
    anon.push_var("x").push_var("a").op(Op::Add, &[]);
    anon.op(Op::RetAnon, &[]);
    let key = interp.register_anon_unit(anon.finish().into_rc());

    let mut m = Frame::new("main", &["r"], &[], &["a", "g"]);
    m.load_num(5.0).assign("a");
    m.op(Op::PushAnonFcnHandle, &[A::U(key as u32)]);
    m.assign("g");
    m.load_num(100.0).assign("a");
    m.push_var("g");
    m.load_num(4.0);
    let g = m.slot("g");
    m.op(Op::IndexIdNargout1, &[A::U(g), A::U(1)]);
    m.assign("r").ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    assert_eq!(num(&res.unwrap()[0]), 9.0);
}

#[test]
fn nested_handle_shares_its_frame() {
    // A nested-function handle carries a shared access frame: calls
    // read and write the captured variable in place.
    let mut interp = Interp::new();

    // function r = bump(); n = n + 1; r = n; end  (n captured)
    let mut bump = Frame::new("bump", &["r"], &[], &["n"]);
    bump.push_var("n").load_num(1.0).op(Op::Add, &[]);
    bump.assign("n");
    bump.push_var("n").assign("r");
    bump.ret();
    let key = interp.register_anon_unit(bump.finish().into_rc());

    let frame = ClosureFrame::new();
    frame.vars.borrow_mut().insert("n".to_string(), Value::Num(10.0));
    let handle = Value::Handle(FnHandle::nested("bump", key, frame.clone()));

    // main(h): r = h()
    let mut m = Frame::new("main", &["r"], &["h"], &[]);
    m.push_var("h");
    let h = m.slot("h");
    m.op(Op::IndexIdNargout1, &[A::U(h), A::U(0)]);
    m.assign("r").ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![handle], 1);
    assert_eq!(num(&res.unwrap()[0]), 11.0);
    // The captured frame saw the write back.
    assert_eq!(
        frame.vars.borrow().get("n").map(num),
        Some(11.0)
    );
}

#[test]
fn anonymous_handle_with_no_captures() {
    let mut interp = Interp::new();
    let mut anon = Frame::new("@<anonymous>", &[], &["x"], &[]);
    anon.b.set_kind("anonymous");
    anon.push_var("x").push_var("x").op(Op::Mul, &[]);
    anon.op(Op::RetAnon, &[]);
    let key = interp.register_anon_unit(anon.finish().into_rc());

    let mut m = Frame::new("main", &["r"], &[], &["g"]);
    m.op(Op::PushAnonFcnHandle, &[A::U(key as u32)]);
    m.assign("g");
    m.push_var("g");
    m.load_num(6.0);
    let g = m.slot("g");
    m.op(Op::IndexIdNargout1, &[A::U(g), A::U(1)]);
    m.assign("r").ret();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    assert_eq!(num(&res.unwrap()[0]), 36.0);
}
