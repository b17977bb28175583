mod common;

use common::{num, run_with, Frame};
use oxmat_builtins::Value;
use oxmat_vm::builder::A;
use oxmat_vm::{Interp, Op};

#[test]
fn statement_display_names_the_variable() {
    // x = 5 (unsuppressed): DISP prints "x = 5".
    let mut f = Frame::new("main", &["r"], &[], &["x"]);
    f.load_num(5.0).assign("x");
    f.push_var("x");
    let x = f.slot("x");
    f.op(Op::Disp, &[A::U(x), A::U(0)]);
    f.load_num(0.0).assign("r").ret();
    let mut interp = Interp::new();
    let (res, _) = run_with(&mut interp, f.finish(), vec![], 1);
    res.unwrap();
    assert!(interp.display_sink.iter().any(|l| l == "x = 5"), "sink: {:?}", interp.display_sink);
}

#[test]
fn suppressed_printing_stays_silent() {
    let mut f = Frame::new("main", &["r"], &[], &["x"]);
    f.load_num(5.0).assign("x");
    f.push_var("x");
    let x = f.slot("x");
    f.op(Op::Disp, &[A::U(x), A::U(0)]);
    f.load_num(0.0).assign("r").ret();
    let mut interp = Interp::new();
    interp.statement_printing = false;
    let (res, _) = run_with(&mut interp, f.finish(), vec![], 1);
    res.unwrap();
    assert!(interp.display_sink.is_empty());
}

#[test]
fn bind_ans_keeps_the_value_for_display() {
    // An expression statement binds `ans` and then displays it.
    let mut f = Frame::new("main", &["ans"], &[], &[]);
    f.load_num(2.0).load_num(3.0).op(Op::Mul, &[]);
    let ans = f.slot("ans");
    f.op(Op::BindAns, &[A::U(ans)]);
    f.op(Op::Disp, &[A::U(ans), A::U(0)]);
    f.ret();
    let mut interp = Interp::new();
    let (res, _) = run_with(&mut interp, f.finish(), vec![], 1);
    assert_eq!(num(&res.unwrap()[0]), 6.0);
    assert!(interp.display_sink.iter().any(|l| l == "ans = 6"));
}

#[test]
fn folded_constant_computes_once_per_frame() {
    // A fold cached in a slot: the initializer runs on the cold path,
    // later visits in the same frame reuse the cache.
    let mut f = Frame::new("main", &["s"], &[], &["%cst0", "i"]);
    f.load_num(0.0).assign("s");
    // Loop twice, adding the folded constant (2+3) each time.
    f.load_num(1.0).load_num(2.0).op(Op::Colon2, &[]);
    let l_cond = f.b.label();
    let l_after = f.b.label();
    f.op(Op::ForSetup, &[]);
    f.b.bind(l_cond);
    let i = f.slot("i");
    f.op(Op::ForCond, &[A::U(i), A::L(l_after)]);
    let cst = f.slot("%cst0");
    let l_have = f.b.label();
    f.op(Op::PushFoldedCst, &[A::U(cst), A::L(l_have)]);
    f.load_num(2.0).load_num(3.0).op(Op::Add, &[]);
    f.op(Op::SetFoldedCst, &[A::U(cst)]);
    f.b.bind(l_have);
    f.push_var("s").op(Op::Rot, &[]).op(Op::Add, &[]).assign("s");
    f.op(Op::Jmp, &[A::L(l_cond)]);
    f.b.bind(l_after);
    f.op(Op::PopNInts, &[A::U(2)]);
    f.op(Op::Pop, &[]);
    f.ret();
    let mut interp = Interp::new();
    let (res, _) = run_with(&mut interp, f.finish(), vec![], 1);
    assert_eq!(num(&res.unwrap()[0]), 10.0);
}

#[test]
fn word_command_routes_words_as_strings() {
    // `disp hello` in command syntax.
    let mut f = Frame::new("main", &["r"], &[], &["disp"]);
    f.load_str("hello");
    let d = f.slot("disp");
    f.op(Op::Wordcmd, &[A::U(d), A::U(0), A::U(1)]);
    f.op(Op::Pop, &[]);
    f.load_num(0.0).assign("r").ret();
    let mut interp = Interp::new();
    let (res, _) = run_with(&mut interp, f.finish(), vec![], 1);
    res.unwrap();
    assert!(interp.display_sink.iter().any(|l| l.contains("hello")));
}

#[test]
fn braindead_precondition_tests_scalarness() {
    let mut f = Frame::new("main", &["a", "b"], &["m"], &[]);
    f.load_num(1.0);
    f.op(Op::BraindeadPrecondition, &[]);
    f.assign("a");
    f.push_var("m");
    f.op(Op::BraindeadPrecondition, &[]);
    f.assign("b").ret();
    let m = Value::Tensor(oxmat_builtins::Tensor::row(vec![1.0, 2.0]));
    let mut interp = Interp::new();
    let (res, _) = run_with(&mut interp, f.finish(), vec![m], 2);
    let out = res.unwrap();
    assert!(matches!(out[0], Value::Bool(true)));
    assert!(matches!(out[1], Value::Bool(false)));
}
