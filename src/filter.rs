use crate::arch::{self, Regs};
use crate::args;
use crate::log::LogLevel::LogDebug3;
use crate::mcount;
use crate::record;
use crate::thread::{RecordFlags, ThreadData};
use crate::trigger::{FilterMode, Trigger, TriggerFlags, TriggerTable};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FilterResult {
    In,
    Out,
}

/// Decide whether this call gets a recorded frame, updating the thread
/// filter state from the matched trigger.
pub fn entry_filter_check(
    mtdp: &mut ThreadData,
    child: u64,
    tr: &mut Trigger,
    table: Option<&TriggerTable>,
) -> FilterResult {
    log!(LogDebug3, "<{}> enter {:x}", mtdp.idx, child);

    if mtdp.idx >= mtdp.max_stack {
        fatal!("too deeply nested calls: {}", mtdp.idx);
    }

    // save original depth to restore at exit time
    mtdp.filter.saved_depth = mtdp.filter.depth;

    // already inside a notrace subtree
    if mtdp.filter.out_count > 0 {
        return FilterResult::Out;
    }

    let mode = match table {
        Some(table) => {
            table.match_ip(child, tr);
            table.mode
        }
        None => FilterMode::None,
    };

    log!(
        LogDebug3,
        " tr.flags: {:x}, filter mode: {:?}, count: {}/{}",
        tr.flags.bits(),
        mode,
        mtdp.filter.in_count,
        mtdp.filter.out_count
    );

    if tr.flags.contains(TriggerFlags::FILTER) {
        match tr.fmode {
            FilterMode::In => mtdp.filter.in_count += 1,
            FilterMode::Out => mtdp.filter.out_count += 1,
            FilterMode::None => (),
        }
        // apply default filter depth when match
        mtdp.filter.depth = mtdp.default_depth;
    } else if mode == FilterMode::In && mtdp.filter.in_count == 0 {
        return FilterResult::Out;
    }

    if tr
        .flags
        .intersects(TriggerFlags::DEPTH | TriggerFlags::TRACE_ON | TriggerFlags::TRACE_OFF)
    {
        if tr.flags.contains(TriggerFlags::DEPTH) {
            mtdp.filter.depth = tr.depth;
        }
        if tr.flags.contains(TriggerFlags::TRACE_ON) {
            mcount::set_enabled(true);
        }
        if tr.flags.contains(TriggerFlags::TRACE_OFF) {
            mcount::set_enabled(false);
        }
    }

    if !mcount::enabled() {
        return FilterResult::In;
    }

    // A depth-capped frame opens its own subtree: the cap counts the
    // levels below it, so the frame itself is not charged.
    if tr.flags.contains(TriggerFlags::DEPTH) {
        return FilterResult::In;
    }

    if mtdp.filter.depth <= 0 {
        return FilterResult::Out;
    }

    mtdp.filter.depth -= 1;
    FilterResult::In
}

/// Save the decision onto the freshly pushed frame and run entry-time
/// side effects (argument staging, enable-toggle flush, slot recovery).
pub fn entry_filter_record(
    mtdp: &mut ThreadData,
    frame_idx: usize,
    tr: &Trigger,
    regs: Option<&Regs>,
    table: Option<&TriggerTable>,
) {
    let mode = table.map(|t| t.mode).unwrap_or(FilterMode::None);

    if mtdp.filter.out_count > 0
        || (mtdp.filter.in_count == 0 && mode == FilterMode::In)
    {
        mtdp.rstack[frame_idx].flags.insert(RecordFlags::NORECORD);
    }
    mtdp.rstack[frame_idx].filter_depth = mtdp.filter.saved_depth;

    if tr
        .flags
        .intersects(TriggerFlags::FILTER | TriggerFlags::RETVAL | TriggerFlags::TRACE)
    {
        if tr.flags.contains(TriggerFlags::FILTER) {
            let flag = match tr.fmode {
                FilterMode::In => RecordFlags::FILTERED,
                _ => RecordFlags::NOTRACE,
            };
            mtdp.rstack[frame_idx].flags.insert(flag);
        }

        // keep the spec list around for the exit-side retval capture
        if tr.flags.contains(TriggerFlags::RETVAL) {
            mtdp.rstack[frame_idx].pargs = tr.pargs.clone();
            mtdp.rstack[frame_idx].flags.insert(RecordFlags::RETVAL);
        }

        if tr.flags.contains(TriggerFlags::TRACE) {
            mtdp.rstack[frame_idx].flags.insert(RecordFlags::TRACE);
        }
    }

    if mtdp.rstack[frame_idx].flags.contains(RecordFlags::NORECORD) {
        return;
    }

    mtdp.record_idx += 1;

    if !mcount::enabled() {
        mtdp.rstack[frame_idx].flags.insert(RecordFlags::DISABLED);
    } else if tr.flags.contains(TriggerFlags::ARGUMENT) {
        if let (Some(regs), Some(pargs)) = (regs, tr.pargs.clone()) {
            args::save_argument(mtdp, frame_idx, &pargs, regs);
        }
    }

    if mtdp.enable_cached != mcount::enabled() {
        // Flush the pending stack when recording just turned off; the
        // turn-on direction is handled on the exit path through the
        // DISABLED flag.
        if !mcount::enabled() {
            record::record_trace_data(mtdp, frame_idx, None);
        }

        mtdp.enable_cached = mcount::enabled();
    }

    if tr.flags.contains(TriggerFlags::RECOVER) {
        mtdp.restore();
        let parent_loc = mtdp.rstack[frame_idx].parent_loc;
        if !parent_loc.is_null() {
            unsafe { *parent_loc = arch::return_trampoline() };
        }
        mtdp.rstack[frame_idx].flags.insert(RecordFlags::RECOVER);
    }
}

/// Undo the entry-side counter changes and emit the frame if it crossed
/// the duration threshold (or was forced).
pub fn exit_filter_record(mtdp: &mut ThreadData, frame_idx: usize, retval: Option<i64>) {
    log!(
        LogDebug3,
        "<{}> exit  {:x}",
        mtdp.idx,
        mtdp.rstack[frame_idx].child_ip
    );

    let flags = mtdp.rstack[frame_idx].flags;

    if flags.intersects(RecordFlags::FILTERED | RecordFlags::NOTRACE | RecordFlags::RECOVER) {
        if flags.contains(RecordFlags::FILTERED) {
            mtdp.filter.in_count -= 1;
        } else if flags.contains(RecordFlags::NOTRACE) {
            mtdp.filter.out_count -= 1;
        }

        if flags.contains(RecordFlags::RECOVER) {
            mtdp.reset(arch::return_trampoline());
        }
    }

    mtdp.filter.depth = mtdp.rstack[frame_idx].filter_depth;

    if flags.contains(RecordFlags::NORECORD) {
        return;
    }

    if mtdp.record_idx > 0 {
        mtdp.record_idx -= 1;
    }

    let retval = if flags.contains(RecordFlags::RETVAL) {
        retval
    } else {
        None
    };

    let frame = &mtdp.rstack[frame_idx];
    let over_threshold = frame.end_time.wrapping_sub(frame.start_time) > mtdp.threshold;
    if over_threshold || flags.intersects(RecordFlags::WRITTEN | RecordFlags::TRACE) {
        if !mcount::enabled() {
            return;
        }

        record::record_trace_data(mtdp, frame_idx, retval);
    }
}
