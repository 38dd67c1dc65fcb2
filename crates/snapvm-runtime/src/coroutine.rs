//! Task suspension and resumption.
//!
//! A running task suspends only at async-hypercall boundaries, so its
//! whole continuation is the resume pc plus the floating-point control
//! state that the runtime may clobber while the task is parked. Pausing
//! captures both out of the register bank; resuming restores the control
//! word and hands back the pc. The task behaves as if it returned from
//! the suspension point with everything intact.

use snapvm_core::RegisterBank;

#[derive(Debug, Clone, Copy)]
struct SavedContext {
    resume_pc: u64,
    fpcw: u16,
}

/// The per-task suspension context. At most one suspension is
/// outstanding at a time; `is_executing` is true from resume (or first
/// entry) until the matching pause or natural return.
#[derive(Debug, Default)]
pub struct Coroutine {
    executing: bool,
    saved: Option<SavedContext>,
}

impl Coroutine {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between enter/resume and the matching pause or leave.
    pub fn is_executing(&self) -> bool {
        self.executing
    }

    /// Marks the task on-stack for a fresh dispatch.
    pub fn enter(&mut self) {
        debug_assert!(!self.executing, "task is already executing");
        self.executing = true;
    }

    /// Marks the task off-stack after a natural return.
    pub fn leave(&mut self) {
        self.executing = false;
    }

    /// Suspends at `resume_pc`, capturing the floating-point control
    /// word from the bank.
    pub fn pause(&mut self, bank: &RegisterBank, resume_pc: u64) {
        debug_assert!(self.executing, "pause without a running task");
        debug_assert!(self.saved.is_none(), "task is already suspended");
        self.saved = Some(SavedContext {
            resume_pc,
            fpcw: bank.fpcw(),
        });
        self.executing = false;
    }

    /// Resumes a suspended task: restores the floating-point control
    /// word and returns the pc to continue from. Returns `None` if the
    /// task was not suspended.
    pub fn resume(&mut self, bank: &mut RegisterBank) -> Option<u64> {
        let saved = self.saved.take()?;
        bank.set_fpcw(saved.fpcw);
        self.executing = true;
        Some(saved.resume_pc)
    }
}
