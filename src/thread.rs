use crate::args::ArgSpec;
use crate::config::Config;
use crate::msg::{self, MsgType, TaskMsg};
use crate::session::{self, Session};
use crate::shmem::Shmem;
use crate::util;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::Once;

pub const ARGBUF_SIZE: usize = 1024;
pub const INVALID_DYNIDX: u32 = u32::max_value();

bitflags! {
    /// Per-frame state accumulated between entry and exit.
    pub struct RecordFlags: u32 {
        /// Filtered out; the frame only keeps depth bookkeeping.
        const NORECORD = 1 << 0;
        /// Pushed while recording was globally off.
        const DISABLED = 1 << 1;
        /// Matched an include filter; exit must undo in_count.
        const FILTERED = 1 << 2;
        /// Matched an exclude filter; exit must undo out_count.
        const NOTRACE  = 1 << 3;
        /// Return slots were repaired for foreign unwinding.
        const RECOVER  = 1 << 4;
        /// Entry arguments staged in the argbuf slot.
        const ARGUMENT = 1 << 5;
        /// Return value wanted; args spec kept on the frame.
        const RETVAL   = 1 << 6;
        /// Force emission regardless of the duration threshold.
        const TRACE    = 1 << 7;
        /// Entry record already serialized.
        const WRITTEN  = 1 << 8;
    }
}

/// One tracer-owned frame mirroring a real call-stack frame.
pub struct RetStack {
    pub depth: usize,
    pub dyn_idx: u32,
    /// Stack slot holding the (hijacked) return address. Null for the
    /// compiler-instrumented protocol, which never rewrites slots.
    pub parent_loc: *mut u64,
    pub parent_ip: u64,
    pub child_ip: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub flags: RecordFlags,
    pub filter_depth: i32,
    pub pargs: Option<Arc<Vec<ArgSpec>>>,
}

impl Default for RetStack {
    fn default() -> RetStack {
        RetStack {
            depth: 0,
            dyn_idx: INVALID_DYNIDX,
            parent_loc: std::ptr::null_mut(),
            parent_ip: 0,
            child_ip: 0,
            start_time: 0,
            end_time: 0,
            flags: RecordFlags::empty(),
            filter_depth: 0,
            pargs: None,
        }
    }
}

/// Filter counters live per thread; `depth` is the budget remaining for
/// the current subtree and `saved_depth` what to restore on exit.
#[derive(Default)]
pub struct FilterState {
    pub in_count: i32,
    pub out_count: i32,
    pub depth: i32,
    pub saved_depth: i32,
}

pub struct ThreadData {
    /// Record stack top.
    pub idx: usize,
    /// Depth counted only over frames we will emit.
    pub record_idx: usize,
    tid: libc::pid_t,
    pub rstack: Vec<RetStack>,
    pub argbuf: Vec<u8>,
    pub filter: FilterState,
    /// Snapshot of the global enable flag, to detect toggles.
    pub enable_cached: bool,
    pub shmem: Shmem,
    pub max_stack: usize,
    pub default_depth: i32,
    pub threshold: u64,
}

impl ThreadData {
    pub fn new(cfg: &Config) -> ThreadData {
        let mut rstack = Vec::with_capacity(cfg.max_stack);
        rstack.resize_with(cfg.max_stack, RetStack::default);

        ThreadData {
            idx: 0,
            record_idx: 0,
            tid: 0,
            rstack,
            argbuf: vec![0; cfg.max_stack * ARGBUF_SIZE],
            filter: FilterState {
                depth: cfg.depth,
                ..Default::default()
            },
            enable_cached: crate::mcount::enabled(),
            shmem: Shmem::new(cfg.bufsize),
            max_stack: cfg.max_stack,
            default_depth: cfg.depth,
            threshold: cfg.threshold,
        }
    }

    /// Lazily cached OS thread id.
    pub fn tid(&mut self) -> libc::pid_t {
        if self.tid == 0 {
            self.tid = util::gettid();
        }
        self.tid
    }

    /// The fork child no longer is the thread the cache was filled for.
    pub fn reset_tid(&mut self) {
        self.tid = 0;
    }

    pub fn argbuf_slot_mut(&mut self, frame_idx: usize) -> &mut [u8] {
        let start = frame_idx * ARGBUF_SIZE;
        &mut self.argbuf[start..start + ARGBUF_SIZE]
    }

    /// Length of the staged wire payload (length prefix included) for a
    /// frame whose arguments or retval were saved.
    pub fn argbuf_payload_len(&self, frame_idx: usize) -> usize {
        let start = frame_idx * ARGBUF_SIZE;
        let total = u16::from_le_bytes([self.argbuf[start], self.argbuf[start + 1]]) as usize;
        2 + total
    }

    /// Write the saved return addresses back into their stack slots so
    /// a foreign unwinder (longjmp, exceptions) sees the real stack.
    pub fn restore(&mut self) {
        for i in (0..self.idx).rev() {
            let frame = &self.rstack[i];
            if !frame.parent_loc.is_null() {
                unsafe { *frame.parent_loc = frame.parent_ip };
            }
        }
    }

    /// Re-install the return trampoline over every live slot, undoing
    /// `restore`.
    pub fn reset(&mut self, trampoline: u64) {
        for i in (0..self.idx).rev() {
            let frame = &self.rstack[i];
            if !frame.parent_loc.is_null() {
                unsafe { *frame.parent_loc = trampoline };
            }
        }
    }

    #[cfg(test)]
    pub fn push_for_test(&mut self, child_ip: u64, start_time: u64) -> usize {
        let idx = self.idx;
        self.idx += 1;
        let depth = self.record_idx;
        self.record_idx += 1;
        let frame = &mut self.rstack[idx];
        *frame = RetStack::default();
        frame.depth = depth;
        frame.child_ip = child_ip;
        frame.start_time = start_time;
        idx
    }

    #[cfg(test)]
    pub fn pop_for_test(&mut self) {
        self.idx -= 1;
        self.record_idx -= 1;
    }

    #[cfg(test)]
    pub fn unlink_ring_for_test(&mut self, tid: libc::pid_t) {
        self.shmem.clear();
        for idx in 0..16 {
            let _ = nix::sys::mman::shm_unlink(crate::shmem::buffer_name(tid, idx).as_str());
        }
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        let tid = self.tid();
        self.shmem.finish(tid);
    }
}

thread_local! {
    static MTD: RefCell<Option<Box<ThreadData>>> = RefCell::new(None);
    static RECURSION_GUARD: Cell<bool> = Cell::new(false);
}

/// True while a hook for this thread is already on the stack, or when
/// the thread's TLS is being torn down. Checking and setting never
/// allocates.
pub fn guard_get() -> bool {
    RECURSION_GUARD.try_with(|g| g.get()).unwrap_or(true)
}

pub fn guard_set(value: bool) {
    let _ = RECURSION_GUARD.try_with(|g| g.set(value));
}

pub fn is_initialized() -> bool {
    MTD.try_with(|m| m.borrow().is_some()).unwrap_or(false)
}

pub fn with<R>(f: impl FnOnce(&mut ThreadData) -> R) -> Option<R> {
    MTD.try_with(|m| m.borrow_mut().as_mut().map(|d| f(d)))
        .ok()
        .flatten()
}

pub(crate) fn install(data: Box<ThreadData>) {
    let _ = MTD.try_with(|m| *m.borrow_mut() = Some(data));
}

pub fn take() -> Option<Box<ThreadData>> {
    MTD.try_with(|m| m.borrow_mut().take()).ok().flatten()
}

static INIT_FILE_ONCE: Once = Once::new();

/// First hook on a thread lands here: allocate the thread state, run the
/// process-wide file init exactly once, set up the ring, and announce
/// the thread to the recorder.
pub fn prepare(cfg: &Config) {
    let mut mtdp = Box::new(ThreadData::new(cfg));
    let tid = mtdp.tid();
    let pid = nix::unistd::getpid().as_raw();

    INIT_FILE_ONCE.call_once(|| {
        let sess = Session::get();
        let task = TaskMsg {
            time: util::gettime(),
            pid,
            tid,
        };
        msg::send_session(sess.name(), session::exename(), &task);
        session::record_proc_maps(&cfg.dir, sess.name());
    });

    mtdp.shmem.prepare(tid);
    install(mtdp);

    // time should be taken after the session message went out
    let task = TaskMsg {
        time: util::gettime(),
        pid,
        tid,
    };
    msg::send_task(MsgType::Tid, &task);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        let mut cfg = Config::default();
        cfg.max_stack = 8;
        cfg.bufsize = 4096;
        cfg
    }

    #[test]
    fn stack_and_argbuf_sized_by_config() {
        let mtdp = ThreadData::new(&small_config());
        assert_eq!(mtdp.rstack.len(), 8);
        assert_eq!(mtdp.argbuf.len(), 8 * ARGBUF_SIZE);
        assert_eq!(mtdp.filter.depth, crate::config::DEFAULT_DEPTH);
        assert_eq!(mtdp.idx, 0);
    }

    #[test]
    fn guard_is_allocation_free_state() {
        assert!(!guard_get());
        guard_set(true);
        assert!(guard_get());
        guard_set(false);
        assert!(!guard_get());
    }

    #[test]
    fn matched_push_pop_restores_idx() {
        let mut mtdp = ThreadData::new(&small_config());
        assert_eq!(mtdp.idx, 0);
        mtdp.push_for_test(1, 1);
        mtdp.push_for_test(2, 2);
        assert_eq!(mtdp.idx, 2);
        mtdp.pop_for_test();
        mtdp.pop_for_test();
        assert_eq!(mtdp.idx, 0);
        assert_eq!(mtdp.record_idx, 0);
    }

    #[test]
    fn restore_and_reset_rewrite_slots() {
        let mut mtdp = ThreadData::new(&small_config());
        let mut slot_a: u64 = 0xaaaa;
        let mut slot_b: u64 = 0xbbbb;
        let trampoline = 0x7ead_0000u64;

        let a = mtdp.push_for_test(0x1000, 1);
        mtdp.rstack[a].parent_loc = &mut slot_a;
        mtdp.rstack[a].parent_ip = 0xaaaa;
        slot_a = trampoline;
        let b = mtdp.push_for_test(0x2000, 2);
        mtdp.rstack[b].parent_loc = &mut slot_b;
        mtdp.rstack[b].parent_ip = 0xbbbb;
        slot_b = trampoline;

        // restore puts the original addresses back
        mtdp.restore();
        assert_eq!(slot_a, 0xaaaa);
        assert_eq!(slot_b, 0xbbbb);

        // reset re-hijacks; restore-then-reset equals reset alone
        mtdp.reset(trampoline);
        assert_eq!(slot_a, trampoline);
        assert_eq!(slot_b, trampoline);

        // reset-then-restore yields the pre-hijack stack again
        mtdp.restore();
        assert_eq!(slot_a, 0xaaaa);
        assert_eq!(slot_b, 0xbbbb);
    }
}
