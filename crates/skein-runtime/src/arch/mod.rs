//! Architecture-specific context switching
//!
//! Each backend provides the same surface:
//!
//! - `SavedRegs` - callee-saved register file of a suspended context
//! - `init_context` - prepare a fresh stack so the first switch enters `entry_fn(entry_arg)`
//! - `switch_context` - save the running context, load another

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
    }
}
