mod common;

use common::Frame;
use oxmat_builtins::Value;
use oxmat_vm::builder::A;
use oxmat_vm::unit::HEADER_SIZE;
use oxmat_vm::{disassemble, Op};

/// A unit touching the interesting encodings: wide slots, shorts, ints,
/// selector chars and the variable-length tails.
fn kitchen_sink() -> oxmat_vm::CompiledUnit {
    let mut f = Frame::new("sink", &["r"], &[], &[]);
    // Filler slots w0..w299 land at indices 2..=301, forcing a
    // WIDE-prefixed access for the high ones.
    for i in 0..300 {
        f.b.declare_slot(&format!("w{i}"));
    }
    let w = |i: u32| 2 + i;
    let far = w(299);
    let near = w(0);

    f.load_num(1.0);
    f.op(Op::Assign, &[A::U(far)]).op(Op::PushSlotIndexed, &[A::U(far)]);
    f.op(Op::Assign, &[A::U(near)]);

    let l = f.b.label();
    f.op(Op::Jmp, &[A::L(l)]);
    f.b.bind(l);

    f.load_value(Value::Num(2.5));
    f.op(Op::IndexIdNargout1, &[A::U(near), A::U(1)]);
    f.op(Op::Pop, &[]);

    f.b.emit_assign_n(&[w(1) as u16, w(2) as u16]).unwrap();
    f.b.emit_set_ignore_outputs(3, &[1, 3]).unwrap();
    f.b.emit_clear_ignore_outputs(&[w(3) as u16]).unwrap();
    f.b.emit_matrix_uneven(&[2, 3]).unwrap();
    f.b
        .emit_subassign_chained(w(4) as u16, Some(0), &[(2, '('), (1, '.')])
        .unwrap();
    f.b.emit_global_init(false, w(5) as u16, 0, None).unwrap();
    f.b
        .emit_end_x_n(&[(0, 0, 1, w(6) as u16), (1, 1, 2, w(7) as u16)])
        .unwrap();
    f.op(Op::PushAnonFcnHandle, &[A::U(77)]);
    f.op(
        Op::IndexObj,
        &[A::U(1), A::U(0), A::U(w(8)), A::U(2), A::U(0x28)],
    );
    f.op(
        Op::IndexStructCall,
        &[A::U(1), A::U(w(9)), A::U(1), A::C('.')],
    );
    f.op(
        Op::IndexStructSubcall,
        &[A::U(255), A::U(1), A::U(0), A::U(2), A::C('{')],
    );
    f.op(Op::Ret, &[]);
    f.finish()
}

#[test]
fn every_offset_reproduces_on_rescan() {
    let unit = kitchen_sink();
    let rows = disassemble(&unit).unwrap();
    assert!(!rows.is_empty());

    // Law: decoding is deterministic and offsets tile the code stream
    // exactly, starting right after the header.
    let again = disassemble(&unit).unwrap();
    assert_eq!(rows, again);
    assert_eq!(rows[0].0, HEADER_SIZE);
    for pair in rows.windows(2) {
        assert!(pair[0].0 < pair[1].0, "offsets must strictly increase");
    }
    // Nothing decodes past the end, and the last instruction ends the
    // stream.
    let last = rows.last().unwrap();
    assert!(last.0 < unit.code_len());
    assert!(last.1.starts_with("RET"));
}

#[test]
fn texts_carry_slot_names() {
    let unit = kitchen_sink();
    let rows = disassemble(&unit).unwrap();
    assert!(rows.iter().any(|(_, t)| t.contains("# w299")));
    assert!(rows.iter().any(|(_, t)| t.starts_with("WIDE")));
    assert!(rows.iter().any(|(_, t)| t.contains("'GLOBAL'")));
    assert!(rows.iter().any(|(_, t)| t.starts_with("SET_IGNORE_OUTPUTS 2 3 1 3")));
}

#[test]
fn malformed_streams_are_rejected() {
    // Truncated operand: ASSIGN with no slot byte.
    let code = vec![1, 0, 1, 0, Op::Assign as u8];
    let unit = oxmat_vm::CompiledUnit::new(
        code,
        vec![
            Value::Str("bad".into()),
            Value::Str("function".into()),
            Value::Str("bad".into()),
        ],
        vec!["%nargout".into()],
        Default::default(),
    )
    .unwrap();
    assert!(disassemble(&unit).is_err());
}
