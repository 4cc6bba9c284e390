//! Saved machine context and the raw stack switch.
//!
//! A context is just the stack pointer of a suspended execution: the
//! callee-saved registers are pushed onto that stack by the switch routine
//! itself. A fresh context is primed so that its first restore "returns"
//! into a bootstrap stub which calls the entry function with one argument.

/// Entry point of a primed context. Must never return.
pub type Entry = extern "C" fn(usize) -> !;

/// Saved stack pointer of a suspended execution
#[derive(Debug, Default)]
pub struct Context {
    sp: usize,
}

impl Context {
    /// An empty context, filled in by the first switch away from it
    pub const fn empty() -> Self {
        Self { sp: 0 }
    }

    /// Prime this context to run `entry(arg)` on the stack ending at `top`.
    ///
    /// # Safety
    /// `top` must be the exclusive upper end of a writable stack with room
    /// for the initial frame, and that stack must outlive every switch into
    /// this context.
    pub unsafe fn prime(&mut self, top: *mut u8, entry: Entry, arg: usize) {
        self.sp = arch::prime(top, entry, arg);
    }

    /// Whether the context has been primed or saved
    pub fn is_set(&self) -> bool {
        self.sp != 0
    }

    /// Save the running execution into `from` and resume `to`.
    ///
    /// Returns when something switches back into `from`.
    ///
    /// # Safety
    /// `from` must be valid for writes and `to` must hold a primed or saved
    /// context whose stack is still alive. Neither may be touched by another
    /// thread during the switch.
    pub unsafe fn switch(from: *mut Context, to: *const Context) {
        let target = (*to).sp;
        debug_assert!(target != 0, "switching into an empty context");
        arch::spindle_context_switch(std::ptr::addr_of_mut!((*from).sp), target);
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::Entry;

    extern "C" {
        pub fn spindle_context_switch(from: *mut usize, to: usize);
        fn spindle_context_bootstrap();
    }

    // Frame layout at a saved stack pointer, lowest address first:
    // mxcsr/x87 control word, r15, r14, r13, r12, rbx, rbp, return address.
    core::arch::global_asm!(
        ".text",
        ".p2align 4",
        ".globl spindle_context_switch",
        ".type spindle_context_switch,@function",
        "spindle_context_switch:",
        "    push rbp",
        "    push rbx",
        "    push r12",
        "    push r13",
        "    push r14",
        "    push r15",
        "    sub rsp, 8",
        "    stmxcsr dword ptr [rsp]",
        "    fnstcw word ptr [rsp + 4]",
        "    mov qword ptr [rdi], rsp",
        "    mov rsp, rsi",
        "    ldmxcsr dword ptr [rsp]",
        "    fldcw word ptr [rsp + 4]",
        "    add rsp, 8",
        "    pop r15",
        "    pop r14",
        "    pop r13",
        "    pop r12",
        "    pop rbx",
        "    pop rbp",
        "    ret",
        ".size spindle_context_switch, .-spindle_context_switch",
        "",
        ".p2align 4",
        ".globl spindle_context_bootstrap",
        ".type spindle_context_bootstrap,@function",
        "spindle_context_bootstrap:",
        "    .cfi_startproc",
        "    .cfi_undefined rip",
        "    mov rdi, r12",
        "    call r13",
        "    ud2",
        "    .cfi_endproc",
        ".size spindle_context_bootstrap, .-spindle_context_bootstrap",
    );

    const MXCSR_DEFAULT: u64 = 0x1F80;
    const FPU_CW_DEFAULT: u64 = 0x037F;

    pub unsafe fn prime(top: *mut u8, entry: Entry, arg: usize) -> usize {
        // 16 bytes of padding keep the bootstrap's call site 16-byte aligned.
        let top = (top as usize & !15) - 16;
        let frame = (top - 8 * 8) as *mut u64;
        frame.add(0).write(MXCSR_DEFAULT | (FPU_CW_DEFAULT << 32));
        frame.add(1).write(0); // r15
        frame.add(2).write(0); // r14
        frame.add(3).write(entry as usize as u64); // r13
        frame.add(4).write(arg as u64); // r12
        frame.add(5).write(0); // rbx
        frame.add(6).write(0); // rbp
        frame.add(7).write(spindle_context_bootstrap as usize as u64);
        frame as usize
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::Entry;

    extern "C" {
        pub fn spindle_context_switch(from: *mut usize, to: usize);
        fn spindle_context_bootstrap();
    }

    // Frame layout at a saved stack pointer: x19..x28, x29 (fp), x30 (lr),
    // then d8..d15. 160 bytes, 16-byte aligned.
    core::arch::global_asm!(
        ".text",
        ".p2align 4",
        ".globl spindle_context_switch",
        ".type spindle_context_switch,%function",
        "spindle_context_switch:",
        "    sub sp, sp, #160",
        "    stp x19, x20, [sp, #0]",
        "    stp x21, x22, [sp, #16]",
        "    stp x23, x24, [sp, #32]",
        "    stp x25, x26, [sp, #48]",
        "    stp x27, x28, [sp, #64]",
        "    stp x29, x30, [sp, #80]",
        "    stp d8, d9, [sp, #96]",
        "    stp d10, d11, [sp, #112]",
        "    stp d12, d13, [sp, #128]",
        "    stp d14, d15, [sp, #144]",
        "    mov x9, sp",
        "    str x9, [x0]",
        "    mov sp, x1",
        "    ldp x19, x20, [sp, #0]",
        "    ldp x21, x22, [sp, #16]",
        "    ldp x23, x24, [sp, #32]",
        "    ldp x25, x26, [sp, #48]",
        "    ldp x27, x28, [sp, #64]",
        "    ldp x29, x30, [sp, #80]",
        "    ldp d8, d9, [sp, #96]",
        "    ldp d10, d11, [sp, #112]",
        "    ldp d12, d13, [sp, #128]",
        "    ldp d14, d15, [sp, #144]",
        "    add sp, sp, #160",
        "    ret",
        ".size spindle_context_switch, .-spindle_context_switch",
        "",
        ".p2align 4",
        ".globl spindle_context_bootstrap",
        ".type spindle_context_bootstrap,%function",
        "spindle_context_bootstrap:",
        "    .cfi_startproc",
        "    .cfi_undefined x30",
        "    mov x0, x19",
        "    blr x20",
        "    brk #0",
        "    .cfi_endproc",
        ".size spindle_context_bootstrap, .-spindle_context_bootstrap",
    );

    pub unsafe fn prime(top: *mut u8, entry: Entry, arg: usize) -> usize {
        let top = top as usize & !15;
        let frame = (top - 160) as *mut u64;
        for slot in 0..20 {
            frame.add(slot).write(0);
        }
        frame.add(0).write(arg as u64); // x19
        frame.add(1).write(entry as usize as u64); // x20
        frame.add(11).write(spindle_context_bootstrap as usize as u64); // x30
        frame as usize
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("spindle fibers support x86_64 and aarch64 only");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::stack::Stack;
    use std::cell::Cell;

    thread_local! {
        static MAIN: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
        static SIDE: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
    }

    extern "C" fn bounce(arg: usize) -> ! {
        let counter = arg as *mut u64;
        loop {
            // SAFETY: the test keeps `counter` and both contexts alive.
            unsafe {
                *counter += 1;
                Context::switch(SIDE.with(Cell::get), MAIN.with(Cell::get));
            }
        }
    }

    #[test]
    fn test_switch_round_trip() {
        let stack = Stack::new(32 * 1024).unwrap();
        let mut main = Context::empty();
        let mut side = Context::empty();
        let mut counter: u64 = 0;

        unsafe {
            side.prime(stack.top(), bounce, &mut counter as *mut u64 as usize);
        }
        assert!(side.is_set());
        MAIN.with(|c| c.set(&mut main));
        SIDE.with(|c| c.set(&mut side));

        for expected in 1..=3 {
            // SAFETY: both contexts and the stack outlive the loop.
            unsafe { Context::switch(&mut main, &side) };
            assert_eq!(counter, expected);
        }
    }

    #[test]
    fn test_float_state_survives_switch() {
        let stack = Stack::new(32 * 1024).unwrap();
        let mut main = Context::empty();
        let mut side = Context::empty();
        let mut counter: u64 = 0;

        unsafe {
            side.prime(stack.top(), bounce, &mut counter as *mut u64 as usize);
        }
        MAIN.with(|c| c.set(&mut main));
        SIDE.with(|c| c.set(&mut side));

        let x = std::hint::black_box(1.5f64);
        unsafe { Context::switch(&mut main, &side) };
        let y = std::hint::black_box(2.25f64);
        assert_eq!(x * y, 3.375);
    }
}
