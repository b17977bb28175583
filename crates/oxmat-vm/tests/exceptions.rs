mod common;

use common::{num, run, run_with, Frame};
use oxmat_builtins::Value;
use oxmat_vm::builder::A;
use oxmat_vm::unit::RegionKind;
use oxmat_vm::{Interp, Op, VmError};
use std::sync::atomic::Ordering;

#[test]
fn try_catch_captures_identifier_and_message() {
    // try; error('X:id', 'boom'); catch e; r = e.identifier; end
    let mut f = Frame::new("main", &["r"], &[], &["error", "e", "identifier"]);
    let l_start = f.b.label();
    let l_end = f.b.label();
    let l_catch = f.b.label();
    let l_out = f.b.label();

    f.b.bind(l_start);
    f.push_var("error");
    f.load_str("X:id");
    f.load_str("boom");
    let err = f.slot("error");
    f.op(Op::IndexIdNargout0, &[A::U(err), A::U(2)]);
    f.op(Op::Pop, &[]);
    f.b.bind(l_end);
    f.op(Op::Jmp, &[A::L(l_out)]);

    f.b.bind(l_catch);
    f.assign("e");
    f.push_var("e");
    let e = f.slot("e");
    let id = f.slot("identifier");
    f.op(Op::IndexStructNargoutN, &[A::U(1), A::U(e), A::U(id)]);
    f.assign("r");
    f.b.bind(l_out);
    f.ret();

    f.b.region(RegionKind::Try, l_start, l_end, Some(l_catch), 0);
    let out = run(f, vec![], 1).unwrap();
    assert!(matches!(&out[0], Value::Str(s) if s == "X:id"), "got {:?}", out[0]);
}

#[test]
fn operand_stack_recovers_after_catch() {
    // Leave a live temporary below the try, fault inside, and verify the
    // expression completes with the pre-try value intact.
    let mut f = Frame::new("main", &["r"], &[], &["error", "e"]);
    let l_start = f.b.label();
    let l_end = f.b.label();
    let l_catch = f.b.label();
    let l_out = f.b.label();

    f.load_num(40.0); // live temporary, depth 1
    f.b.bind(l_start);
    f.push_var("error");
    f.load_str("X:x");
    f.load_str("no");
    let err = f.slot("error");
    f.op(Op::IndexIdNargout0, &[A::U(err), A::U(2)]);
    f.op(Op::Pop, &[]);
    f.b.bind(l_end);
    f.op(Op::Jmp, &[A::L(l_out)]);

    f.b.bind(l_catch);
    f.assign("e"); // error object
    f.b.bind(l_out);
    // The pre-try temporary is still the top of the stack.
    f.load_num(2.0).op(Op::Add, &[]);
    f.assign("r").ret();

    // The region preserves the one temporary below the try.
    f.b.region(RegionKind::Try, l_start, l_end, Some(l_catch), 1);
    let out = run(f, vec![], 1).unwrap();
    assert_eq!(num(&out[0]), 42.0);
}

#[test]
fn error_in_callee_unwinds_to_caller_try() {
    // function g(); error('Deep:err', 'down'); end
    let mut g = Frame::new("g", &[], &[], &["error"]);
    g.push_var("error");
    g.load_str("Deep:err");
    g.load_str("down");
    let err = g.slot("error");
    g.op(Op::IndexIdNargout0, &[A::U(err), A::U(2)]);
    g.op(Op::Pop, &[]);
    g.ret();
    let mut interp = Interp::new();
    interp.register_unit(g.finish().into_rc());

    let mut m = Frame::new("main", &["r"], &[], &["g", "e", "identifier"]);
    let l_start = m.b.label();
    let l_end = m.b.label();
    let l_catch = m.b.label();
    let l_out = m.b.label();
    m.b.bind(l_start);
    m.call("g", 0, 0, |_| {});
    m.op(Op::Pop, &[]);
    m.b.bind(l_end);
    m.op(Op::Jmp, &[A::L(l_out)]);
    m.b.bind(l_catch);
    m.assign("e");
    m.push_var("e");
    let e = m.slot("e");
    let id = m.slot("identifier");
    m.op(Op::IndexStructNargoutN, &[A::U(1), A::U(e), A::U(id)]);
    m.assign("r");
    m.b.bind(l_out);
    m.ret();
    m.b.region(RegionKind::Try, l_start, l_end, Some(l_catch), 0);

    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    let out = res.unwrap();
    assert!(matches!(&out[0], Value::Str(s) if s == "Deep:err"));
}

#[test]
fn uncaught_errors_reach_the_host() {
    let mut f = Frame::new("main", &["r"], &[], &["error"]);
    f.push_var("error");
    f.load_str("Top:boom");
    f.load_str("bad");
    let err = f.slot("error");
    f.op(Op::IndexIdNargout0, &[A::U(err), A::U(2)]);
    f.op(Op::Pop, &[]);
    f.ret();
    match run(f, vec![], 1) {
        Err(VmError::Exception(e)) => {
            assert_eq!(e.identifier, "Top:boom");
            assert_eq!(e.message, "bad");
        }
        other => panic!("expected exception, got {other:?}"),
    }
}

#[test]
fn unwind_protect_runs_cleanup_then_rethrows() {
    let mut f = Frame::new("main", &["r"], &[], &["error", "e"]);
    let l_start = f.b.label();
    let l_end = f.b.label();
    let l_cleanup = f.b.label();

    f.b.bind(l_start);
    f.push_var("error");
    f.load_str("P:fail");
    f.load_str("inside");
    let err = f.slot("error");
    f.op(Op::IndexIdNargout0, &[A::U(err), A::U(2)]);
    f.op(Op::Pop, &[]);
    f.b.bind(l_end);
    // Normal completion enters the cleanup with no error object.
    f.op(Op::PushNil, &[]);
    f.b.bind(l_cleanup);
    f.assign("e"); // stash the error object (or nil)
    f.load_str("cleanup ran");
    f.op(Op::Disp, &[A::U(0), A::U(0)]);
    f.push_var("e");
    f.op(Op::ThrowIfErrObj, &[]);
    f.load_num(0.0).assign("r").ret();

    f.b
        .region(RegionKind::UnwindProtect, l_start, l_end, Some(l_cleanup), 0);

    let mut interp = Interp::new();
    let (res, _) = run_with(&mut interp, f.finish(), vec![], 1);
    match res {
        Err(VmError::Exception(e)) => assert_eq!(e.identifier, "P:fail"),
        other => panic!("expected rethrow, got {other:?}"),
    }
    assert!(interp
        .display_sink
        .iter()
        .any(|l| l.contains("cleanup ran")));
}

#[test]
fn interrupt_skips_try_but_runs_unwind_protect() {
    // A try region does not see the interrupt; it reaches the host.
    let mut f = Frame::new("main", &["r"], &[], &["e"]);
    let l_start = f.b.label();
    let l_end = f.b.label();
    let l_catch = f.b.label();
    let l_out = f.b.label();
    f.b.bind(l_start);
    f.op(Op::HandleSignals, &[]);
    f.load_num(1.0).assign("r");
    f.b.bind(l_end);
    f.op(Op::Jmp, &[A::L(l_out)]);
    f.b.bind(l_catch);
    f.assign("e");
    f.load_num(2.0).assign("r");
    f.b.bind(l_out);
    f.ret();
    f.b.region(RegionKind::Try, l_start, l_end, Some(l_catch), 0);

    let mut interp = Interp::new();
    interp.interrupt_handle().store(true, Ordering::Relaxed);
    let (res, _) = run_with(&mut interp, f.finish(), vec![], 1);
    assert!(matches!(res, Err(VmError::Interrupted)));

    // An unwind-protect region runs its cleanup, then the interrupt
    // continues out of the VM.
    let mut g = Frame::new("main", &["r"], &[], &["e"]);
    let l_start = g.b.label();
    let l_end = g.b.label();
    let l_cleanup = g.b.label();
    g.b.bind(l_start);
    g.op(Op::HandleSignals, &[]);
    g.load_num(1.0).assign("r");
    g.b.bind(l_end);
    g.op(Op::PushNil, &[]);
    g.b.bind(l_cleanup);
    g.assign("e");
    g.load_str("protected cleanup");
    g.op(Op::Disp, &[A::U(0), A::U(0)]);
    g.push_var("e");
    g.op(Op::ThrowIfErrObj, &[]);
    g.ret();
    g.b
        .region(RegionKind::UnwindProtect, l_start, l_end, Some(l_cleanup), 0);

    let mut interp = Interp::new();
    interp.interrupt_handle().store(true, Ordering::Relaxed);
    let (res, _) = run_with(&mut interp, g.finish(), vec![], 1);
    assert!(matches!(res, Err(VmError::Interrupted)));
    assert!(interp
        .display_sink
        .iter()
        .any(|l| l.contains("protected cleanup")));
}

#[test]
fn host_frame_stack_restores_after_unwind() {
    let mut g = Frame::new("g", &[], &[], &["error"]);
    g.push_var("error");
    g.load_str("A:b");
    g.load_str("x");
    let err = g.slot("error");
    g.op(Op::IndexIdNargout0, &[A::U(err), A::U(2)]);
    g.op(Op::Pop, &[]);
    g.ret();

    let mut interp = Interp::new();
    interp.register_unit(g.finish().into_rc());
    let mut m = Frame::new("main", &["r"], &[], &["g"]);
    m.call("g", 0, 0, |_| {});
    m.op(Op::Pop, &[]);
    m.ret();
    let depth_before = interp.frame_depth();
    let (res, _) = run_with(&mut interp, m.finish(), vec![], 1);
    assert!(res.is_err());
    assert_eq!(interp.frame_depth(), depth_before);
}

#[test]
fn loop_counters_are_stripped_during_unwind() {
    // Fault inside a for loop wrapped by an outer try: the loop's two
    // counter ints and its iterable must be torn down before the handler
    // resumes at depth zero.
    let mut f = Frame::new("main", &["r"], &[], &["error", "k", "e"]);
    let l_start = f.b.label();
    let l_end = f.b.label();
    let l_catch = f.b.label();
    let l_out = f.b.label();
    let l_cond = f.b.label();
    let l_after = f.b.label();
    let body_start = f.b.label();
    let body_end = f.b.label();

    f.b.bind(l_start);
    f.load_num(1.0).load_num(3.0).op(Op::Colon2, &[]);
    f.op(Op::ForSetup, &[]);
    f.b.bind(l_cond);
    let k = f.slot("k");
    f.op(Op::ForCond, &[A::U(k), A::L(l_after)]);
    f.b.bind(body_start);
    f.push_var("error");
    f.load_str("Loop:fail");
    f.load_str("inside loop");
    let err = f.slot("error");
    f.op(Op::IndexIdNargout0, &[A::U(err), A::U(2)]);
    f.op(Op::Pop, &[]);
    f.b.bind(body_end);
    f.op(Op::Jmp, &[A::L(l_cond)]);
    f.b.bind(l_after);
    f.op(Op::PopNInts, &[A::U(2)]);
    f.op(Op::Pop, &[]);
    f.b.bind(l_end);
    f.op(Op::Jmp, &[A::L(l_out)]);
    f.b.bind(l_catch);
    f.assign("e");
    f.load_num(1.0).assign("r");
    f.b.bind(l_out);
    f.ret();

    f.b.region(RegionKind::Try, l_start, l_end, Some(l_catch), 0);
    f.b.region(RegionKind::ForLoop, body_start, body_end, None, 0);

    let out = run(f, vec![], 1).unwrap();
    assert_eq!(num(&out[0]), 1.0);
}
