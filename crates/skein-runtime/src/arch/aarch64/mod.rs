//! aarch64 context switching implementation
//!
//! AAPCS64 callee-saved state: sp, x19-x28, fp (x29), lr (x30), d8-d15.

use std::arch::naked_asm;

/// Saved registers of a suspended context
///
/// Offsets are hard-coded in `switch_context`; keep the layout in sync.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedRegs {
    pub sp: u64,       // 0x00
    pub pc: u64,       // 0x08
    pub x: [u64; 12],  // 0x10: x19..x28, x29, x30
    pub d: [u64; 8],   // 0x70: d8..d15
}

/// Initialize a fresh context
///
/// # Safety
///
/// `stack_top` must be the high end of a writable stack owned by the
/// context for as long as it can be switched to.
#[inline]
pub unsafe fn init_context(
    regs: &mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: extern "C" fn(usize) -> !,
    entry_arg: usize,
) {
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs::default();
    regs.sp = sp as u64;
    regs.pc = task_trampoline as usize as u64;
    regs.x[0] = entry_fn as usize as u64; // x19
    regs.x[1] = entry_arg as u64;         // x20
}

/// First code a fresh context runs
#[unsafe(naked)]
unsafe extern "C" fn task_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // entry_fn never returns
        "brk #1",
    );
}

/// Save the running context into `from`, resume `to`
///
/// # Safety
///
/// `to` must hold a context produced by `init_context` or by an earlier
/// `switch_context`, whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut SavedRegs, _to: *const SavedRegs) {
    naked_asm!(
        // Save into from (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "adr x10, 2f",
        "str x10, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        // Load from to (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        "ldr x10, [x1, #0x08]",
        "br x10",
        // Resume point of a saved context
        "2:",
        "ret",
    );
}
