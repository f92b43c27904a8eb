//! x86_64 context switching implementation
//!
//! System V AMD64: rsp, rbx, rbp, r12-r15 plus the MXCSR control bits and
//! the x87 control word survive a call, so that is all a voluntary switch
//! has to carry.

use std::arch::naked_asm;

/// Default MXCSR: all exceptions masked, round-to-nearest
const MXCSR_DEFAULT: u32 = 0x1F80;

/// Default x87 control word
const FPCW_DEFAULT: u16 = 0x037F;

/// Saved registers of a suspended context
///
/// Offsets are hard-coded in `switch_context`; keep the layout in sync.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedRegs {
    pub rsp: u64,   // 0x00
    pub rip: u64,   // 0x08
    pub rbx: u64,   // 0x10
    pub rbp: u64,   // 0x18
    pub r12: u64,   // 0x20
    pub r13: u64,   // 0x28
    pub r14: u64,   // 0x30
    pub r15: u64,   // 0x38
    pub mxcsr: u32, // 0x40
    pub fpcw: u16,  // 0x44
    _pad: u16,
}

/// Initialize a fresh context
///
/// The first switch into `regs` lands in the trampoline, which calls
/// `entry_fn(entry_arg)`. `entry_fn` must never return.
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
    // 16-byte aligned so that `call r12` leaves rsp ≡ 8 (mod 16) at entry
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs::default();
    regs.rsp = sp as u64;
    regs.rip = task_trampoline as usize as u64;
    regs.r12 = entry_fn as usize as u64;
    regs.r13 = entry_arg as u64;
    regs.mxcsr = MXCSR_DEFAULT;
    regs.fpcw = FPCW_DEFAULT;
}

/// First code a fresh context runs
#[unsafe(naked)]
unsafe extern "C" fn task_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry_fn never returns
        "ud2",
    );
}

/// Save the running context into `from`, resume `to`
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// `to` must hold a context produced by `init_context` or by an earlier
/// `switch_context`, whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut SavedRegs, _to: *const SavedRegs) {
    naked_asm!(
        // Save into from (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr [rdi + 0x40]",
        "fnstcw [rdi + 0x44]",
        // Load from to (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr [rsi + 0x40]",
        "fldcw [rsi + 0x44]",
        "jmp qword ptr [rsi + 0x08]",
        // Resume point of a saved context
        "2:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_asm_offsets() {
        assert_eq!(std::mem::size_of::<SavedRegs>(), 0x48);
        assert_eq!(std::mem::offset_of!(SavedRegs, rip), 0x08);
        assert_eq!(std::mem::offset_of!(SavedRegs, r15), 0x38);
        assert_eq!(std::mem::offset_of!(SavedRegs, mxcsr), 0x40);
        assert_eq!(std::mem::offset_of!(SavedRegs, fpcw), 0x44);
    }

    extern "C" fn never(_: usize) -> ! {
        std::process::abort()
    }

    #[test]
    fn test_init_aligns_stack() {
        let mut regs = SavedRegs::default();
        let top = 0x1000_0007usize as *mut u8;
        unsafe { init_context(&mut regs, top, never, 42) };
        assert_eq!(regs.rsp % 16, 0);
        assert_eq!(regs.r13, 42);
        assert_eq!(regs.mxcsr, MXCSR_DEFAULT);
    }
}
