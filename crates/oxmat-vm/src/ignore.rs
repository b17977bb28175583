//! The output-ignore protocol: `[~, x] = f(...)`.
//!
//! A side-structure owned by the VM holds the pending ignore matrix the
//! next call consumes, plus a stack of prior call-site lvalue lists kept
//! in lock-step with the dynamic frame stack, so nested calls see their
//! own caller's intent and everything restores on unwind.

use std::rc::Rc;

use crate::host::Interp;

/// Saved call-site state: the interpreter's lvalue list before this
/// frame replaced it, and whether the replacement is VM-owned.
#[derive(Debug)]
struct SavedLvalues {
    prior: Option<Rc<Vec<bool>>>,
    owned: bool,
}

#[derive(Debug, Default)]
pub struct IgnoreState {
    /// 1-based output positions to black-hole, consumed by the next call.
    pending: Option<Vec<usize>>,
    saved: Vec<SavedLvalues>,
}

impl IgnoreState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.pending.is_some() || !self.saved.is_empty()
    }

    /// `SET_IGNORE_OUTPUTS`: record the ignore positions and install a
    /// fresh lvalue list at the interpreter, saving the previous one.
    pub fn set_ignore(&mut self, interp: &mut Interp, ignored: Vec<usize>, n_total: usize) {
        let mut black_hole = vec![false; n_total];
        for &pos in &ignored {
            if pos >= 1 && pos <= n_total {
                black_hole[pos - 1] = true;
            }
        }
        self.saved.push(SavedLvalues {
            prior: interp.lvalue_list.take(),
            owned: true,
        });
        interp.lvalue_list = Some(Rc::new(black_hole));
        self.pending = Some(ignored);
    }

    /// Propagate a caller's ignore matrix into an anonymous-function
    /// call frame.
    pub fn set_ignore_anon(&mut self, interp: &mut Interp, ignored: Vec<usize>) {
        let n_total = ignored.iter().copied().max().unwrap_or(0);
        self.set_ignore(interp, ignored, n_total);
    }

    /// A bytecode call is being made: hand the pending matrix to the
    /// callee's frame and remember the call-site list.
    pub fn push_frame(&mut self, interp: &mut Interp) {
        let pending = self.pending.take();
        if let Some(frame) = interp.current_frame_mut() {
            frame.ignored = pending;
        }
        self.saved.push(SavedLvalues {
            prior: interp.lvalue_list.take(),
            owned: false,
        });
    }

    /// Frame teardown (return or unwind): restore the caller's list. A
    /// VM-owned replacement list simply drops here.
    pub fn pop_frame(&mut self, interp: &mut Interp) {
        if let Some(saved) = self.saved.pop() {
            if saved.owned && log::log_enabled!(log::Level::Trace) {
                log::trace!("dropping VM-owned lvalue list on frame pop");
            }
            interp.lvalue_list = saved.prior;
        }
    }

    /// `CLEAR_IGNORE_OUTPUTS`: drop the pending matrix and restore the
    /// prior lvalue list installed by `set_ignore`.
    pub fn clear_ignore(&mut self, interp: &mut Interp) {
        self.pending = None;
        if let Some(saved) = self.saved.pop() {
            interp.lvalue_list = saved.prior;
        }
    }

    /// True when nothing is pending and no saved lists remain, meaning
    /// the VM can drop the side-structure entirely.
    pub fn can_be_dropped(&self) -> bool {
        self.pending.is_none() && self.saved.is_empty()
    }
}
