use crate::args::ArgSpec;
use crate::log::LogLevel::LogDebug;
use crate::symtab::SymbolService;
use std::collections::BTreeMap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

bitflags! {
    pub struct TriggerFlags: u32 {
        const FILTER    = 1 << 0;
        const DEPTH     = 1 << 1;
        const TRACE_ON  = 1 << 2;
        const TRACE_OFF = 1 << 3;
        const ARGUMENT  = 1 << 4;
        const RETVAL    = 1 << 5;
        const RECOVER   = 1 << 6;
        const TRACE     = 1 << 7;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FilterMode {
    None,
    In,
    Out,
}

impl Default for FilterMode {
    fn default() -> FilterMode {
        FilterMode::None
    }
}

/// Everything a matched address tells the per-call evaluator.
#[derive(Clone, Default)]
pub struct Trigger {
    pub flags: TriggerFlags,
    pub fmode: FilterMode,
    pub depth: i32,
    pub pargs: Option<Arc<Vec<ArgSpec>>>,
}

impl Default for TriggerFlags {
    fn default() -> TriggerFlags {
        TriggerFlags::empty()
    }
}

struct TableEntry {
    end: u64,
    trigger: Trigger,
}

/// Address-range lookup built once at init and read lock-free from the
/// hooks afterwards.
pub struct TriggerTable {
    entries: BTreeMap<u64, TableEntry>,
    pub mode: FilterMode,
}

impl TriggerTable {
    pub fn new() -> TriggerTable {
        TriggerTable {
            entries: BTreeMap::new(),
            mode: FilterMode::None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge an update into the trigger covering `[start, end)`.
    /// Overlapping registrations for the same start address accumulate,
    /// which is how a function picks up e.g. a filter and an argument
    /// spec at once.
    pub fn add(&mut self, start: u64, end: u64, update: impl FnOnce(&mut Trigger)) {
        let entry = self.entries.entry(start).or_insert(TableEntry {
            end,
            trigger: Trigger::default(),
        });
        if end > entry.end {
            entry.end = end;
        }
        update(&mut entry.trigger);
    }

    /// Fill `tr` from the trigger whose range covers `ip`. Returns
    /// whether anything matched.
    pub fn match_ip(&self, ip: u64, tr: &mut Trigger) -> bool {
        if let Some((_, entry)) = self.entries.range(..=ip).next_back() {
            if ip < entry.end {
                tr.flags |= entry.trigger.flags;
                tr.fmode = entry.trigger.fmode;
                if entry.trigger.flags.contains(TriggerFlags::DEPTH) {
                    tr.depth = entry.trigger.depth;
                }
                if entry.trigger.pargs.is_some() {
                    tr.pargs = entry.trigger.pargs.clone();
                }
                return true;
            }
        }
        false
    }

    fn append_arg(&mut self, start: u64, end: u64, flag: TriggerFlags, spec: ArgSpec) {
        self.add(start, end, |t| {
            t.flags |= flag;
            let pargs = t.pargs.get_or_insert_with(|| Arc::new(Vec::new()));
            Arc::make_mut(pargs).push(spec);
        });
    }
}

/// Resolve one name from a spec string to address ranges. Hex literals
/// stand for themselves; anything else is the symbol service's problem.
fn resolve_name(service: &dyn SymbolService, name: &str, section: Option<&str>) -> Vec<(u64, u64)> {
    if let Some(hex) = name.strip_prefix("0x") {
        if let Ok(addr) = u64::from_str_radix(hex, 16) {
            return vec![(addr, addr + 1)];
        }
    }
    service.resolve(name, section)
}

fn entries(spec: Option<&str>) -> impl Iterator<Item = &str> {
    spec.unwrap_or("").split(';').filter(|e| !e.is_empty())
}

/// `FTRACE_FILTER`: names to include, `!name` to exclude. Any include
/// puts the thread filter into IN mode.
pub fn setup_filter(
    spec: Option<&str>,
    service: &dyn SymbolService,
    section: Option<&str>,
    table: &mut TriggerTable,
) {
    for entry in entries(spec) {
        let (name, fmode) = match entry.strip_prefix('!') {
            Some(name) => (name, FilterMode::Out),
            None => (entry, FilterMode::In),
        };

        let ranges = resolve_name(service, name, section);
        if ranges.is_empty() {
            log!(LogDebug, "cannot resolve filter: {}", name);
            continue;
        }
        for (start, end) in ranges {
            table.add(start, end, |t| {
                t.flags |= TriggerFlags::FILTER;
                t.fmode = fmode;
            });
        }

        if fmode == FilterMode::In {
            table.mode = FilterMode::In;
        } else if table.mode == FilterMode::None {
            table.mode = FilterMode::Out;
        }
    }
}

/// `FTRACE_TRIGGER`: `name@action,...` with actions `depth=N`,
/// `trace_on`, `trace_off`, `recover`, `trace`, `filter`, `notrace`.
pub fn setup_trigger(
    spec: Option<&str>,
    service: &dyn SymbolService,
    section: Option<&str>,
    table: &mut TriggerTable,
) {
    for entry in entries(spec) {
        let mut parts = entry.splitn(2, '@');
        let name = parts.next().unwrap();
        let actions = match parts.next() {
            Some(actions) => actions,
            None => continue,
        };

        let ranges = resolve_name(service, name, section);
        if ranges.is_empty() {
            log!(LogDebug, "cannot resolve trigger: {}", name);
            continue;
        }

        for action in actions.split(',').filter(|a| !a.is_empty()) {
            for &(start, end) in &ranges {
                apply_trigger_action(table, start, end, action);
            }
            match action {
                "filter" => table.mode = FilterMode::In,
                "notrace" if table.mode == FilterMode::None => table.mode = FilterMode::Out,
                _ => (),
            }
        }
    }
}

fn apply_trigger_action(table: &mut TriggerTable, start: u64, end: u64, action: &str) {
    if let Some(value) = action.strip_prefix("depth=") {
        match value.parse::<i32>() {
            Ok(depth) => table.add(start, end, |t| {
                t.flags |= TriggerFlags::DEPTH;
                t.depth = depth;
            }),
            Err(_) => log!(LogDebug, "ignoring bad depth trigger: {}", action),
        }
        return;
    }

    match action {
        "trace_on" => table.add(start, end, |t| t.flags |= TriggerFlags::TRACE_ON),
        "trace_off" => table.add(start, end, |t| t.flags |= TriggerFlags::TRACE_OFF),
        "recover" => table.add(start, end, |t| t.flags |= TriggerFlags::RECOVER),
        "trace" => table.add(start, end, |t| t.flags |= TriggerFlags::TRACE),
        "filter" => table.add(start, end, |t| {
            t.flags |= TriggerFlags::FILTER;
            t.fmode = FilterMode::In;
        }),
        "notrace" => table.add(start, end, |t| {
            t.flags |= TriggerFlags::FILTER;
            t.fmode = FilterMode::Out;
        }),
        _ => log!(LogDebug, "ignoring unknown trigger action: {}", action),
    }
}

/// `FTRACE_ARGUMENT`: `name@arg1,arg2/s,...`.
pub fn setup_argument(
    spec: Option<&str>,
    service: &dyn SymbolService,
    section: Option<&str>,
    table: &mut TriggerTable,
) {
    for entry in entries(spec) {
        let mut parts = entry.splitn(2, '@');
        let name = parts.next().unwrap();
        let tokens = match parts.next() {
            Some(tokens) => tokens,
            None => continue,
        };

        let ranges = resolve_name(service, name, section);
        if ranges.is_empty() {
            log!(LogDebug, "cannot resolve argument spec: {}", name);
            continue;
        }

        for token in tokens.split(',').filter(|t| !t.is_empty()) {
            match ArgSpec::parse(token) {
                Some(arg) if !arg.is_retval() => {
                    for &(start, end) in &ranges {
                        table.append_arg(start, end, TriggerFlags::ARGUMENT, arg);
                    }
                }
                _ => log!(LogDebug, "ignoring bad argument spec: {}", token),
            }
        }
    }
}

/// `FTRACE_RETVAL`: `name` or `name@retval/<fmt>`.
pub fn setup_retval(
    spec: Option<&str>,
    service: &dyn SymbolService,
    section: Option<&str>,
    table: &mut TriggerTable,
) {
    for entry in entries(spec) {
        let mut parts = entry.splitn(2, '@');
        let name = parts.next().unwrap();

        let arg = match parts.next() {
            None => Some(ArgSpec::retval()),
            Some(token) => ArgSpec::parse(token).filter(|a| a.is_retval()),
        };
        let arg = match arg {
            Some(arg) => arg,
            None => {
                log!(LogDebug, "ignoring bad retval spec: {}", entry);
                continue;
            }
        };

        let ranges = resolve_name(service, name, section);
        if ranges.is_empty() {
            log!(LogDebug, "cannot resolve retval spec: {}", name);
            continue;
        }
        for (start, end) in ranges {
            table.append_arg(start, end, TriggerFlags::RETVAL, arg);
        }
    }
}

/// The published table. Swapped only by init and teardown; hooks read
/// it lock-free.
static ACTIVE_TABLE: AtomicPtr<TriggerTable> = AtomicPtr::new(ptr::null_mut());

pub fn publish(table: TriggerTable) {
    let fresh = Box::into_raw(Box::new(table));
    let old = ACTIVE_TABLE.swap(fresh, Ordering::SeqCst);
    if !old.is_null() {
        unsafe { drop(Box::from_raw(old)) };
    }
}

pub fn active() -> Option<&'static TriggerTable> {
    unsafe { ACTIVE_TABLE.load(Ordering::Acquire).as_ref() }
}

pub fn release() {
    let old = ACTIVE_TABLE.swap(ptr::null_mut(), Ordering::SeqCst);
    if !old.is_null() {
        unsafe { drop(Box::from_raw(old)) };
    }
}
