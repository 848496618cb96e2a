use crate::args::ArgSpec;

/// Number of integer argument registers the entry stub captures; spec
/// positions beyond this cannot be served.
pub const NR_ARG_REGS: i32 = 6;

/// Integer argument registers captured by the entry trampoline, in the
/// order the stub pushes them. `get_arg` indexes them per the SysV
/// calling convention.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct Regs {
    pub r9: u64,
    pub r8: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
}

/// Fetch one positional argument from the captured register file.
pub fn get_arg(regs: &Regs, spec: &ArgSpec) -> i64 {
    let value = match spec.idx {
        1 => regs.rdi,
        2 => regs.rsi,
        3 => regs.rdx,
        4 => regs.rcx,
        5 => regs.r8,
        6 => regs.r9,
        _ => 0,
    };
    value as i64
}

/// Remap the return-address slot when the ABI hides the real one.
/// x86_64 hands us the right slot already.
pub fn parent_location(parent_loc: *mut u64, _child_ip: u64) -> *mut u64 {
    parent_loc
}

/// Address written over hijacked return slots.
pub fn return_trampoline() -> u64 {
    mcount_return as usize as u64
}

// The `mcount` prologue stub saves the argument registers (laid out as
// `Regs`), picks the parent return slot out of the caller frame (the
// compiler emits the call after the frame setup, so it sits at rbp+8),
// and hands everything to mcount_entry. `mcount_return` is entered by
// the hijacked return itself: it preserves the return-value registers
// across mcount_exit and jumps to the address mcount_exit gives back.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    .globl mcount
    .type mcount, @function
mcount:
    sub rsp, 56
    mov [rsp + 40], rdi
    mov [rsp + 32], rsi
    mov [rsp + 24], rdx
    mov [rsp + 16], rcx
    mov [rsp + 8], r8
    mov [rsp + 0], r9
    mov rsi, [rsp + 56]
    lea rdi, [rbp + 8]
    mov rdx, rsp
    call mcount_entry
    mov r9, [rsp + 0]
    mov r8, [rsp + 8]
    mov rcx, [rsp + 16]
    mov rdx, [rsp + 24]
    mov rsi, [rsp + 32]
    mov rdi, [rsp + 40]
    add rsp, 56
    ret
    .size mcount, .-mcount

    .globl mcount_return
    .type mcount_return, @function
mcount_return:
    sub rsp, 48
    mov [rsp + 0], rax
    mov [rsp + 8], rdx
    movdqu [rsp + 16], xmm0
    mov rdi, rax
    call mcount_exit
    mov [rsp + 40], rax
    movdqu xmm0, [rsp + 16]
    mov rdx, [rsp + 8]
    mov rax, [rsp + 0]
    add rsp, 40
    ret
    .size mcount_return, .-mcount_return
"#
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn mcount_return();
}

/// Without an arch shim the trampoline address is still needed as a
/// sentinel; reaching it would mean a hijacked return on an unsupported
/// architecture.
#[cfg(not(target_arch = "x86_64"))]
#[no_mangle]
pub extern "C" fn mcount_return() {
    std::process::abort();
}
