use crate::arch::{self, Regs};
use crate::config::Config;
use crate::filter::{self, FilterResult};
use crate::log::LogLevel::LogDebug;
use crate::msg::{self, MsgType, TaskMsg};
use crate::session;
use crate::symtab;
use crate::thread::{self, RecordFlags, INVALID_DYNIDX};
use crate::trigger::{self, Trigger, TriggerTable};
use crate::util;
use std::sync::atomic::{compiler_fence, AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);
static SETUP_DONE: AtomicBool = AtomicBool::new(false);
static FINISHED: AtomicBool = AtomicBool::new(false);

/// Recording on/off. Triggers flip this from traced code; readers
/// tolerate stale values by design.
pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn set_enabled(on: bool) {
    ENABLED.store(on, Ordering::Relaxed);
}

pub fn setup_done() -> bool {
    SETUP_DONE.load(Ordering::SeqCst)
}

/// Every hook bails out here while the library is not ready, is being
/// torn down, or the thread is already inside a hook (reentry through
/// the traced program's allocator).
fn should_stop() -> bool {
    thread::guard_get() || !SETUP_DONE.load(Ordering::Relaxed) || FINISHED.load(Ordering::Relaxed)
}

fn hook_entry(parent_loc: *mut u64, child: u64, regs: Option<&Regs>) -> i32 {
    if should_stop() {
        return -1;
    }

    thread::guard_set(true);

    if !thread::is_initialized() {
        thread::prepare(Config::get());
    }

    let table = trigger::active();
    let result = thread::with(|mtdp| {
        let mut tr = Trigger::default();
        if filter::entry_filter_check(mtdp, child, &mut tr, table) == FilterResult::Out {
            return -1;
        }

        // fixup the parent_loc in an arch-dependent way (if needed)
        let parent_loc = arch::parent_location(parent_loc, child);

        let idx = mtdp.idx;
        mtdp.idx += 1;

        let frame = &mut mtdp.rstack[idx];
        frame.depth = mtdp.record_idx;
        frame.dyn_idx = INVALID_DYNIDX;
        frame.parent_loc = parent_loc;
        frame.parent_ip = unsafe { *parent_loc };
        frame.child_ip = child;
        frame.start_time = util::gettime();
        frame.end_time = 0;
        frame.flags = RecordFlags::empty();
        frame.filter_depth = 0;
        frame.pargs = None;

        // hijack the return address
        unsafe { *parent_loc = arch::return_trampoline() };

        filter::entry_filter_record(mtdp, idx, &tr, regs, table);
        0
    })
    .unwrap_or(-1);

    thread::guard_set(false);
    result
}

fn hook_exit(retval: i64) -> u64 {
    thread::guard_set(true);

    let retaddr = thread::with(|mtdp| {
        if mtdp.idx == 0 {
            fatal!("return hook without a live frame");
        }
        let idx = mtdp.idx - 1;

        mtdp.rstack[idx].end_time = util::gettime();
        filter::exit_filter_record(mtdp, idx, Some(retval));

        let retaddr = mtdp.rstack[idx].parent_ip;

        compiler_fence(Ordering::SeqCst);

        mtdp.idx -= 1;
        retaddr
    });

    thread::guard_set(false);

    match retaddr {
        Some(retaddr) => retaddr,
        None => fatal!("return hook without thread state"),
    }
}

/// The compiler-instrumented protocol: no register capture and no
/// return-address rewriting, so filtered frames are still pushed (with
/// NORECORD) to keep the exit side symmetric.
fn cygprof_hook_entry(parent: u64, child: u64) -> i32 {
    if should_stop() {
        return -1;
    }

    thread::guard_set(true);

    if !thread::is_initialized() {
        thread::prepare(Config::get());
    }

    let table = trigger::active();
    let result = thread::with(|mtdp| {
        let mut tr = Trigger::default();
        let filtered = filter::entry_filter_check(mtdp, child, &mut tr, table);

        let idx = mtdp.idx;
        mtdp.idx += 1;

        let frame = &mut mtdp.rstack[idx];
        frame.depth = mtdp.record_idx;
        frame.dyn_idx = INVALID_DYNIDX;
        frame.parent_loc = std::ptr::null_mut();
        frame.parent_ip = parent;
        frame.child_ip = child;
        frame.end_time = 0;
        frame.filter_depth = 0;
        frame.pargs = None;

        if filtered == FilterResult::In {
            frame.start_time = util::gettime();
            frame.flags = RecordFlags::empty();
        } else {
            frame.start_time = 0;
            frame.flags = RecordFlags::NORECORD;
        }

        filter::entry_filter_record(mtdp, idx, &tr, None, table);
        0
    })
    .unwrap_or(-1);

    thread::guard_set(false);
    result
}

fn cygprof_hook_exit() {
    if should_stop() {
        return;
    }

    thread::guard_set(true);

    if !thread::is_initialized() {
        thread::prepare(Config::get());
    }

    let _ = thread::with(|mtdp| {
        if mtdp.idx == 0 {
            return;
        }
        let idx = mtdp.idx - 1;

        if !mtdp.rstack[idx].flags.contains(RecordFlags::NORECORD) {
            mtdp.rstack[idx].end_time = util::gettime();
        }

        filter::exit_filter_record(mtdp, idx, None);

        compiler_fence(Ordering::SeqCst);

        mtdp.idx -= 1;
    });

    thread::guard_set(false);
}

extern "C" fn atfork_prepare_handler() {
    let task = TaskMsg {
        time: util::gettime(),
        pid: nix::unistd::getpid().as_raw(),
        tid: 0,
    };
    msg::send_task(MsgType::ForkStart, &task);
}

extern "C" fn atfork_child_handler() {
    if !thread::is_initialized() {
        thread::prepare(Config::get());
    }

    let _ = thread::with(|mtdp| {
        // The inherited ring still belongs to the parent's session;
        // drop it quietly and start over under our own tid.
        mtdp.reset_tid();
        mtdp.shmem.clear();
        let tid = mtdp.tid();
        mtdp.shmem.prepare(tid);
    });

    let task = TaskMsg {
        time: util::gettime(),
        pid: nix::unistd::getppid().as_raw(),
        tid: nix::unistd::getpid().as_raw(),
    };
    msg::send_task(MsgType::ForkEnd, &task);
}

fn build_trigger_table(cfg: &Config) -> TriggerTable {
    symtab::with_service(|service| {
        service.load_symtabs(session::exename(), cfg.demangle);

        let mut table = TriggerTable::new();
        trigger::setup_filter(cfg.filter.as_deref(), service, None, &mut table);
        trigger::setup_trigger(cfg.trigger.as_deref(), service, None, &mut table);
        trigger::setup_argument(cfg.argument.as_deref(), service, None, &mut table);
        trigger::setup_retval(cfg.retval.as_deref(), service, None, &mut table);

        if cfg.plthook {
            trigger::setup_filter(cfg.filter.as_deref(), service, Some("PLT"), &mut table);
            trigger::setup_trigger(cfg.trigger.as_deref(), service, Some("PLT"), &mut table);
            trigger::setup_argument(cfg.argument.as_deref(), service, Some("PLT"), &mut table);
            trigger::setup_retval(cfg.retval.as_deref(), service, Some("PLT"), &mut table);

            if service.hook_pltgot(session::exename()).is_err() {
                log!(LogDebug, "error when hooking plt: skipping...");
            }
        }

        table
    })
}

/// Library init: environment intake, trigger tables, fork handlers.
/// Idempotent and guarded against reentry; hooks start firing once the
/// setup flag is published.
pub fn startup() {
    if SETUP_DONE.load(Ordering::SeqCst) || thread::guard_get() {
        return;
    }

    thread::guard_set(true);

    let cfg = Config::get();
    log!(LogDebug, "initializing mcount library");

    if let Some(fd) = cfg.pipe_fd {
        msg::adopt_pipe(fd);
    }
    if cfg.disabled {
        set_enabled(false);
    }

    trigger::publish(build_trigger_table(cfg));

    unsafe {
        libc::pthread_atfork(
            Some(atfork_prepare_handler),
            None,
            Some(atfork_child_handler),
        )
    };

    compiler_fence(Ordering::SeqCst);

    SETUP_DONE.store(true, Ordering::SeqCst);
    thread::guard_set(false);
}

/// Library teardown: finish this thread's ring, close the pipe, drop
/// the trigger table. Hooks are no-ops afterwards.
pub fn cleanup() {
    if FINISHED.swap(true, Ordering::SeqCst) {
        return;
    }

    drop(thread::take());
    msg::close_pipe();
    trigger::release();
}

/*
 * external interfaces
 */

#[no_mangle]
pub unsafe extern "C" fn mcount_entry(
    parent_loc: *mut libc::c_ulong,
    child: libc::c_ulong,
    regs: *const Regs,
) -> libc::c_int {
    hook_entry(parent_loc as *mut u64, child as u64, regs.as_ref())
}

#[no_mangle]
pub extern "C" fn mcount_exit(retval: libc::c_long) -> libc::c_ulong {
    hook_exit(retval as i64) as libc::c_ulong
}

#[no_mangle]
pub extern "C" fn __cyg_profile_func_enter(child: *mut libc::c_void, parent: *mut libc::c_void) {
    cygprof_hook_entry(parent as u64, child as u64);
}

#[no_mangle]
pub extern "C" fn __cyg_profile_func_exit(_child: *mut libc::c_void, _parent: *mut libc::c_void) {
    cygprof_hook_exit();
}

/// Write the saved return addresses back over the trampoline so foreign
/// stack walkers (longjmp, exceptions) see the real stack.
#[no_mangle]
pub extern "C" fn mcount_restore() {
    let _ = thread::with(|mtdp| mtdp.restore());
}

/// Undo `mcount_restore`: re-install the trampoline on every live slot.
#[no_mangle]
pub extern "C" fn mcount_reset() {
    let _ = thread::with(|mtdp| mtdp.reset(arch::return_trampoline()));
}

#[no_mangle]
pub extern "C" fn mcount_startup() {
    startup();
}

#[no_mangle]
pub extern "C" fn mcount_cleanup() {
    cleanup();
}

/*
 * Initializer and Finalizer
 */

#[cfg(not(test))]
mod lifecycle {
    extern "C" fn mcount_init() {
        super::startup();
    }

    extern "C" fn mcount_fini() {
        super::cleanup();
    }

    #[used]
    #[link_section = ".init_array"]
    static INIT: extern "C" fn() = mcount_init;

    #[used]
    #[link_section = ".fini_array"]
    static FINI: extern "C" fn() = mcount_fini;
}
