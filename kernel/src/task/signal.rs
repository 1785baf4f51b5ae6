//! Signal generation and delivery.
//!
//! Per task: a pending mask, a blocked mask, a forced mask and a bounded
//! queue of `SigInfo` records. A signal is deliverable when its bit is in
//! `pending & !blocked`, or in `forced` (force-delivered signals bypass
//! ignore, handlers and masking -- they terminate). Delivery happens only
//! at the return-to-user boundary, where the trap frame is available for
//! rewriting.

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::arch::x86::context::TrapFrame;
use crate::arch::x86::cpu::{EFLAGS_BASE, EFLAGS_IF};
use crate::error::{Errno, KernelResult};
use crate::mm::user;

use super::{exit, sched, Abi, Pid, Task, TaskState};

/// Number of signals; valid numbers are `1..NSIG`.
pub const NSIG: u8 = 32;

/// A signal number, guaranteed in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sig(u8);

#[allow(missing_docs)]
impl Sig {
    pub const HUP: Sig = Sig(1);
    pub const INT: Sig = Sig(2);
    pub const QUIT: Sig = Sig(3);
    pub const ILL: Sig = Sig(4);
    pub const TRAP: Sig = Sig(5);
    pub const ABRT: Sig = Sig(6);
    pub const BUS: Sig = Sig(7);
    pub const FPE: Sig = Sig(8);
    pub const KILL: Sig = Sig(9);
    pub const USR1: Sig = Sig(10);
    pub const SEGV: Sig = Sig(11);
    pub const USR2: Sig = Sig(12);
    pub const PIPE: Sig = Sig(13);
    pub const ALRM: Sig = Sig(14);
    pub const TERM: Sig = Sig(15);
    pub const CHLD: Sig = Sig(17);
    pub const CONT: Sig = Sig(18);
    pub const STOP: Sig = Sig(19);
    pub const TSTP: Sig = Sig(20);

    pub fn new(num: u32) -> Option<Sig> {
        if num >= 1 && num < NSIG as u32 {
            Some(Sig(num as u8))
        } else {
            None
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn mask(self) -> u32 {
        1 << self.0
    }
}

/// What the kernel does when a signal with default disposition arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefaultAction {
    Ignore,
    Kill,
}

fn default_action(sig: Sig) -> DefaultAction {
    match sig {
        Sig::HUP | Sig::INT | Sig::ILL | Sig::ABRT | Sig::BUS | Sig::KILL | Sig::SEGV
        | Sig::PIPE | Sig::TERM => DefaultAction::Kill,
        _ => DefaultAction::Ignore,
    }
}

/// Per-signal disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Default,
    Ignore,
    /// User handler entry point.
    Handler(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub disposition: Disposition,
    pub mask: u32,
    pub flags: u32,
}

impl SigAction {
    pub const fn default() -> Self {
        Self {
            disposition: Disposition::Default,
            mask: 0,
            flags: 0,
        }
    }
}

/// Reference-counted signal-action table, shared by `CLONE_SIGHAND`.
pub struct SigActions {
    actions: Mutex<[SigAction; NSIG as usize]>,
}

impl SigActions {
    pub fn new() -> Self {
        Self {
            actions: Mutex::new([SigAction::default(); NSIG as usize]),
        }
    }

    pub fn get(&self, sig: Sig) -> SigAction {
        self.actions.lock()[sig.0 as usize]
    }

    pub fn set(&self, sig: Sig, action: SigAction) -> SigAction {
        let mut table = self.actions.lock();
        core::mem::replace(&mut table[sig.0 as usize], action)
    }

    /// Deep copy, for clone without `CLONE_SIGHAND`.
    pub fn clone_table(&self) -> Self {
        Self {
            actions: Mutex::new(*self.actions.lock()),
        }
    }

    /// Exec semantics: handlers reset to default, explicit ignores stay.
    pub fn reset_for_exec(&self) {
        for action in self.actions.lock().iter_mut() {
            if matches!(action.disposition, Disposition::Handler(_)) {
                *action = SigAction::default();
            }
        }
    }
}

impl Default for SigActions {
    fn default() -> Self {
        Self::new()
    }
}

/// One queued signal record.
#[derive(Debug, Clone, Copy)]
pub struct SigInfo {
    pub sig: Sig,
    /// Sender PID (0 for the kernel).
    pub pid: Pid,
    /// Packed wait status, for SIGCHLD.
    pub status: i32,
}

impl SigInfo {
    pub fn kernel(sig: Sig) -> Self {
        Self {
            sig,
            pid: 0,
            status: 0,
        }
    }
}

/// Maximum queued infos per task.
const SIGQUEUE_MAX: usize = 32;

/// Pending/blocked/forced state. Lives under an `IrqLock` because senders
/// may run in interrupt context.
pub struct SigPending {
    pub pending: u32,
    pub blocked: u32,
    pub forced: u32,
    infos: VecDeque<SigInfo>,
}

impl SigPending {
    pub fn new() -> Self {
        Self {
            pending: 0,
            blocked: 0,
            forced: 0,
            infos: VecDeque::new(),
        }
    }

    pub fn deliverable_mask(&self) -> u32 {
        (self.pending & !self.blocked) | self.forced
    }

    fn queue(&mut self, info: SigInfo) {
        if self.infos.len() < SIGQUEUE_MAX {
            self.infos.push_back(info);
        }
    }

    /// Lowest deliverable signal number, with its queued info consumed.
    fn take_next(&mut self) -> Option<(SigInfo, bool)> {
        let mask = self.deliverable_mask();
        if mask == 0 {
            return None;
        }
        let num = mask.trailing_zeros();
        let sig = Sig::new(num)?;
        let forced = self.forced & sig.mask() != 0;
        self.pending &= !sig.mask();
        self.forced &= !sig.mask();
        let info = self.take_info(sig).unwrap_or(SigInfo::kernel(sig));
        Some((info, forced))
    }

    fn take_info(&mut self, sig: Sig) -> Option<SigInfo> {
        let pos = self.infos.iter().position(|i| i.sig == sig)?;
        self.infos.remove(pos)
    }

    /// Non-consuming look at a queued info for `sig`.
    pub fn peek_info(&self, sig: Sig) -> Option<SigInfo> {
        self.infos.iter().find(|i| i.sig == sig).copied()
    }

    /// Consume one specific pending signal (kernel-side wait paths).
    pub fn take(&mut self, sig: Sig) -> Option<SigInfo> {
        if self.pending & sig.mask() == 0 {
            return None;
        }
        self.pending &= !sig.mask();
        self.forced &= !sig.mask();
        Some(self.take_info(sig).unwrap_or(SigInfo::kernel(sig)))
    }

    pub fn is_pending(&self, sig: Sig) -> bool {
        self.pending & sig.mask() != 0
    }
}

impl Default for SigPending {
    fn default() -> Self {
        Self::new()
    }
}

/// Is any deliverable signal pending?
pub fn signal_pending(task: &Task) -> bool {
    task.pending.lock().deliverable_mask() != 0
}

/// Is a signal pending that will terminate the task no matter what?
pub fn fatal_signal_pending(task: &Task) -> bool {
    let pending = task.pending.lock();
    pending.forced != 0 || (pending.pending & !pending.blocked) & Sig::KILL.mask() != 0
}

/// Send a signal with an info record.
pub fn send_sig_info(task: &Task, info: SigInfo) {
    let actions = task.sigactions.lock().clone();
    if actions.get(info.sig).disposition == Disposition::Ignore {
        // Ignored non-forced signals leave pending state unchanged.
        return;
    }
    {
        let mut pending = task.pending.lock();
        if pending.pending & info.sig.mask() == 0 {
            pending.queue(info);
        }
        pending.pending |= info.sig.mask();
    }
    if task.state() == TaskState::Interruptible {
        sched::wake_up_process(task);
    }
}

pub fn send_sig(task: &Task, sig: Sig) {
    send_sig_info(task, SigInfo::kernel(sig));
}

/// Force-deliver: bypasses ignore, handlers and the blocked mask; the
/// target dies before its next return to user.
pub fn force_sig(task: &Task, sig: Sig) {
    {
        let mut pending = task.pending.lock();
        pending.pending |= sig.mask();
        pending.forced |= sig.mask();
        pending.queue(SigInfo::kernel(sig));
    }
    if task.state() == TaskState::Interruptible {
        sched::wake_up_process(task);
    }
}

/// Force a signal on the current task.
pub fn force_sig_current(sig: Sig) {
    force_sig(sched::current(), sig);
}

/// Send to every member of a process group.
pub fn send_sig_pg(pgid: Pid, info: SigInfo) -> KernelResult<()> {
    let mut hit = false;
    super::for_each_task(|task| {
        if task.pgid() == pgid {
            send_sig_info(task, info);
            hit = true;
        }
    });
    if hit {
        Ok(())
    } else {
        Err(Errno::ESRCH)
    }
}

/// Signal context pushed on the user stack before invoking a handler.
/// `sigreturn` restores exactly these registers.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SigContext {
    ebx: u32,
    ecx: u32,
    edx: u32,
    esi: u32,
    edi: u32,
    ebp: u32,
    eax: u32,
    eip: u32,
    eflags: u32,
    esp: u32,
}

impl SigContext {
    fn capture(frame: &TrapFrame, user_esp: u32) -> Self {
        Self {
            ebx: frame.ebx,
            ecx: frame.ecx,
            edx: frame.edx,
            esi: frame.esi,
            edi: frame.edi,
            ebp: frame.ebp,
            eax: frame.eax,
            eip: frame.eip,
            eflags: frame.eflags,
            esp: user_esp,
        }
    }
}

/// EFLAGS bits user context may restore (arithmetic + direction).
const EFLAGS_USER_MASK: u32 = 0x0dd5;

/// Syscall numbers the trampolines invoke.
const LINUX_SIGRETURN_NR: u32 = 173; // rt_sigreturn
const LEGACY_SIGRETURN_NR: u32 = 10;

/// `mov eax, imm32; int 0x80` -- the sigreturn trampoline, pushed onto the
/// user stack so the handler's `ret` lands on it.
fn trampoline_code(abi: Abi) -> [u8; 7] {
    let nr = match abi {
        Abi::Linux => LINUX_SIGRETURN_NR,
        Abi::Legacy => LEGACY_SIGRETURN_NR,
    };
    let imm = nr.to_le_bytes();
    [0xb8, imm[0], imm[1], imm[2], imm[3], 0xcd, 0x80]
}

/// Map a signal to the legacy ABI's numbering. Signals the legacy ABI
/// cannot express have no handler path there.
fn legacy_signum(sig: Sig) -> Option<u32> {
    match sig {
        Sig::FPE => Some(0),
        Sig::SEGV => Some(1),
        Sig::INT => Some(2),
        Sig::ALRM => Some(3),
        Sig::USR1 => Some(4),
        _ => None,
    }
}

/// Inverse of [`legacy_signum`], for the legacy set_handler syscall.
pub fn legacy_sig_from(num: u32) -> Option<Sig> {
    match num {
        0 => Some(Sig::FPE),
        1 => Some(Sig::SEGV),
        2 => Some(Sig::INT),
        3 => Some(Sig::ALRM),
        4 => Some(Sig::USR1),
        _ => None,
    }
}

fn push_user(frame: &mut TrapFrame, bytes: &[u8]) -> KernelResult<u32> {
    let esp = (frame.esp as usize)
        .checked_sub(bytes.len())
        .ok_or(Errno::EFAULT)?;
    user::copy_to_user(esp, bytes)?;
    frame.esp = esp as u32;
    Ok(frame.esp)
}

/// Build the user signal frame and redirect `eip` to the handler.
///
/// Stack, from the handler's point of view: return address (trampoline),
/// signal number, signal context, trampoline code.
fn setup_handler_frame(
    frame: &mut TrapFrame,
    sig: Sig,
    handler: usize,
    abi: Abi,
) -> KernelResult<()> {
    let saved_esp = frame.esp;

    push_user(frame, &trampoline_code(abi))?;
    let trampoline = frame.esp;

    let context = SigContext::capture(frame, saved_esp);
    // SAFETY: SigContext is plain data.
    let context_bytes = unsafe {
        core::slice::from_raw_parts(
            &context as *const SigContext as *const u8,
            core::mem::size_of::<SigContext>(),
        )
    };
    push_user(frame, context_bytes)?;

    let signum: u32 = match abi {
        Abi::Linux => sig.number() as u32,
        Abi::Legacy => legacy_signum(sig).ok_or(Errno::EINVAL)?,
    };
    push_user(frame, &signum.to_le_bytes())?;
    push_user(frame, &trampoline.to_le_bytes())?;

    frame.eip = handler as u32;
    Ok(())
}

/// The return-to-user signal hook. Runs every trap exit; picks pending
/// unblocked signals lowest-first until one is delivered or none remain.
pub fn deliver_signals(frame: &mut TrapFrame) {
    let Some(task) = sched::try_current() else {
        return;
    };

    loop {
        let Some((info, forced)) = task.pending.lock().take_next() else {
            return;
        };
        let sig = info.sig;

        if forced {
            // Fatal set: forced signals terminate before the next user
            // instruction, regardless of handlers or dispositions.
            exit::do_exit_signal(sig);
        }

        let action = task.sigactions.lock().get(sig);
        match action.disposition {
            Disposition::Ignore => continue,
            Disposition::Default => match default_action(sig) {
                DefaultAction::Ignore => continue,
                DefaultAction::Kill => exit::do_exit_signal(sig),
            },
            Disposition::Handler(handler) => {
                match setup_handler_frame(frame, sig, handler, task.abi()) {
                    Ok(()) => return,
                    Err(_) => {
                        // Unable to reach the user stack: escalate.
                        force_sig(task, Sig::SEGV);
                        continue;
                    }
                }
            }
        }
    }
}

/// `sigreturn`: restore the register frame saved by
/// [`setup_handler_frame`]. The context sits just above the signal number
/// the handler's stack frame still points at.
pub fn sigreturn(frame: &mut TrapFrame) {
    let context_ptr = frame.esp as usize + core::mem::size_of::<u32>();
    let context: SigContext = match user::read_user(context_ptr) {
        Ok(c) => c,
        Err(_) => {
            force_sig_current(Sig::SEGV);
            return;
        }
    };

    frame.ebx = context.ebx;
    frame.ecx = context.ecx;
    frame.edx = context.edx;
    frame.esi = context.esi;
    frame.edi = context.edi;
    frame.ebp = context.ebp;
    frame.eax = context.eax;
    frame.eip = context.eip;
    frame.esp = context.esp;
    // Never trust user eflags wholesale: arithmetic bits only, IF forced on.
    frame.eflags = (context.eflags & EFLAGS_USER_MASK) | EFLAGS_IF | EFLAGS_BASE;
}

/// Fork copies the pending set; exec clears it.
pub fn copy_pending_for_fork(parent: &Task, child: &Task) {
    let parent_pending = parent.pending.lock();
    let mut child_pending = child.pending.lock();
    child_pending.pending = parent_pending.pending;
    child_pending.blocked = parent_pending.blocked;
    child_pending.forced = parent_pending.forced;
    child_pending.infos = parent_pending.infos.clone();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deliverable_respects_blocked_but_not_forced() {
        let mut pending = SigPending::new();
        pending.pending = Sig::USR1.mask() | Sig::TERM.mask();
        pending.blocked = Sig::USR1.mask() | Sig::TERM.mask();
        assert_eq!(pending.deliverable_mask(), 0);
        pending.forced = Sig::KILL.mask();
        pending.pending |= Sig::KILL.mask();
        assert_eq!(pending.deliverable_mask(), Sig::KILL.mask());
    }

    #[test]
    fn lowest_signal_first() {
        let mut pending = SigPending::new();
        pending.pending = Sig::TERM.mask() | Sig::INT.mask();
        pending.queue(SigInfo::kernel(Sig::TERM));
        pending.queue(SigInfo::kernel(Sig::INT));
        let (info, forced) = pending.take_next().unwrap();
        assert_eq!(info.sig, Sig::INT);
        assert!(!forced);
        let (info, _) = pending.take_next().unwrap();
        assert_eq!(info.sig, Sig::TERM);
        assert!(pending.take_next().is_none());
    }

    #[test]
    fn trampoline_encodes_int80() {
        let code = trampoline_code(Abi::Legacy);
        assert_eq!(code[0], 0xb8); // mov eax, imm32
        assert_eq!(u32::from_le_bytes([code[1], code[2], code[3], code[4]]), 10);
        assert_eq!(&code[5..], &[0xcd, 0x80]); // int 0x80
    }

    #[test]
    fn legacy_signum_mapping_roundtrips() {
        for num in 0..5 {
            let sig = legacy_sig_from(num).unwrap();
            assert_eq!(legacy_signum(sig), Some(num));
        }
        assert_eq!(legacy_sig_from(5), None);
        assert_eq!(legacy_signum(Sig::TERM), None);
    }

    #[test]
    fn default_actions_match_contract() {
        assert_eq!(default_action(Sig::KILL), DefaultAction::Kill);
        assert_eq!(default_action(Sig::SEGV), DefaultAction::Kill);
        assert_eq!(default_action(Sig::CHLD), DefaultAction::Ignore);
        assert_eq!(default_action(Sig::USR1), DefaultAction::Ignore);
    }
}
