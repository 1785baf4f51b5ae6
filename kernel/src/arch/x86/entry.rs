//! Common interrupt entry stubs.
//!
//! Every wired vector funnels through `isr_common`, which pushes the uniform
//! [`TrapFrame`](super::context::TrapFrame) and calls the C-ABI dispatcher
//! `do_interrupt` in [`crate::irq`]. The frame layout here and the struct
//! definition must move in lockstep.
//!
//! `isr_return` is a public label: the clone trampoline and `resume_frame`
//! jump to it with `esp` pointing at a fabricated frame to enter a task for
//! the first time.

// Vectors that push a hardware error code: 8, 10-14, 17, 21. Everything
// else gets a zero pushed to keep the frame uniform.
#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    r#"
.macro isr_noerr num
    .globl vector_\num
vector_\num:
    push 0
    push \num
    jmp isr_common
.endm

.macro isr_err num
    .globl vector_\num
vector_\num:
    push \num
    jmp isr_common
.endm

    .section .text

    isr_noerr 0
    isr_noerr 1
    isr_noerr 2
    isr_noerr 3
    isr_noerr 4
    isr_noerr 5
    isr_noerr 6
    isr_noerr 7
    isr_err   8
    isr_noerr 9
    isr_err   10
    isr_err   11
    isr_err   12
    isr_err   13
    isr_err   14
    isr_noerr 16
    isr_err   17
    isr_noerr 18
    isr_noerr 19
    isr_noerr 20
    isr_err   21

    isr_noerr 32
    isr_noerr 33
    isr_noerr 34
    isr_noerr 35
    isr_noerr 36
    isr_noerr 37
    isr_noerr 38
    isr_noerr 39
    isr_noerr 40
    isr_noerr 41
    isr_noerr 42
    isr_noerr 43
    isr_noerr 44
    isr_noerr 45
    isr_noerr 46
    isr_noerr 47

    isr_noerr 128
    isr_noerr 130

    .globl isr_common
isr_common:
    pushal
    push ds
    push es
    push fs
    push gs

    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax

    push esp
    call do_interrupt
    add esp, 4

    .globl isr_return
isr_return:
    pop gs
    pop fs
    pop es
    pop ds
    popal
    add esp, 8
    iretd
"#
);
