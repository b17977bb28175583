//! Per-opcode handler implementations, grouped by concern. All of these
//! are `impl VmCore` blocks; the dispatch match in `vm.rs` routes here.

mod arith;
mod assign;
mod construct;
mod control;
mod index;
mod misc;
