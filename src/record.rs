use crate::args;
use crate::log::LogLevel::LogDebug3;
use crate::thread::{RecordFlags, ThreadData};
use crate::util::align;
use bit_field::BitField;
use static_assertions::const_assert_eq;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u16)]
pub enum RecordType {
    Entry = 0,
    Exit = 1,
    Lost = 2,
}

/// Marker stored in the spare bits of every record so the recorder can
/// tell live records from zeroed buffer space.
pub const RECORD_MARKER: u8 = 0b101;

/// One wire record: a 64-bit timestamp and a packed word carrying
/// `type:2 marker:3 more:1 depth:10 addr:48`. The packed form is what
/// keeps the record at 16 bytes; the accessors expose the logical
/// widths (type u16, more u8, depth u16, addr u64).
#[repr(C)]
#[derive(Copy, Clone)]
pub struct WireRecord {
    pub time: u64,
    word: u64,
}

pub const WIRE_RECORD_SIZE: usize = 16;
const_assert_eq!(std::mem::size_of::<WireRecord>(), WIRE_RECORD_SIZE);

impl WireRecord {
    pub const WIRE_SIZE: usize = WIRE_RECORD_SIZE;

    pub fn new(time: u64, ty: RecordType, more: bool, depth: u16, addr: u64) -> WireRecord {
        let mut word = 0u64;
        word.set_bits(0..2, ty as u64);
        word.set_bits(2..5, RECORD_MARKER as u64);
        word.set_bits(5..6, more as u64);
        word.set_bits(6..16, (depth & 0x3ff) as u64);
        word.set_bits(16..64, addr & ((1u64 << 48) - 1));
        WireRecord { time, word }
    }

    /// The synthetic record standing in for dropped records; `addr`
    /// carries the drop count.
    pub fn lost(count: u64) -> WireRecord {
        WireRecord::new(0, RecordType::Lost, false, 0, count)
    }

    pub fn record_type(&self) -> RecordType {
        match self.word.get_bits(0..2) {
            0 => RecordType::Entry,
            1 => RecordType::Exit,
            _ => RecordType::Lost,
        }
    }

    pub fn marker(&self) -> u8 {
        self.word.get_bits(2..5) as u8
    }

    pub fn more(&self) -> u8 {
        self.word.get_bits(5..6) as u8
    }

    pub fn depth(&self) -> u16 {
        self.word.get_bits(6..16) as u16
    }

    pub fn addr(&self) -> u64 {
        self.word.get_bits(16..64)
    }
}

/// Serialize one frame of the record stack into the current buffer,
/// rotating first when it does not fit. Returns Err when the ring is in
/// its lost state so the caller can account the remaining records.
pub fn record_ret_stack(
    mtdp: &mut ThreadData,
    ty: RecordType,
    frame_idx: usize,
) -> Result<(), ()> {
    let tid = mtdp.tid();

    let with_payload = match ty {
        RecordType::Entry => mtdp.rstack[frame_idx]
            .flags
            .contains(RecordFlags::ARGUMENT),
        RecordType::Exit => mtdp.rstack[frame_idx].flags.contains(RecordFlags::RETVAL),
        RecordType::Lost => false,
    };
    let payload_len = if with_payload {
        mtdp.argbuf_payload_len(frame_idx)
    } else {
        0
    };

    let size = WIRE_RECORD_SIZE + payload_len;
    let maxsize = mtdp.shmem.max_payload();

    let full = match mtdp.shmem.curr_buf() {
        Some(buf) => buf.size() + size > maxsize,
        None => true,
    };
    if full {
        if mtdp.shmem.curr >= 0 {
            mtdp.shmem.finish_buffer(tid, mtdp.shmem.curr as usize);
        }
        mtdp.shmem.rotate(tid);

        if mtdp.shmem.curr < 0 {
            mtdp.shmem.losts += 1;
            return Err(());
        }
    }

    let frame = &mtdp.rstack[frame_idx];
    let timestamp = match ty {
        RecordType::Exit => frame.end_time,
        _ => frame.start_time,
    };
    let record = WireRecord::new(
        timestamp,
        ty,
        with_payload,
        frame.depth as u16,
        frame.child_ip,
    );
    let child_ip = frame.child_ip;
    let depth = frame.depth;

    {
        let buf = mtdp.shmem.curr_buf().unwrap();
        let mut offset = buf.size();
        unsafe {
            std::ptr::write_unaligned(buf.data().add(offset) as *mut WireRecord, record);
        }
        offset += WIRE_RECORD_SIZE;
        buf.set_size(offset);
    }
    mtdp.rstack[frame_idx].flags.insert(RecordFlags::WRITTEN);

    if with_payload {
        let payload_start = frame_idx * crate::thread::ARGBUF_SIZE;
        let buf = mtdp.shmem.curr_buf().unwrap();
        let offset = buf.size();
        unsafe {
            std::ptr::copy_nonoverlapping(
                mtdp.argbuf[payload_start..payload_start + payload_len].as_ptr(),
                buf.data().add(offset),
                payload_len,
            );
        }
        buf.set_size(offset + align(payload_len, 8));
    }

    log!(
        LogDebug3,
        "rstack[{}] {} {:x}",
        depth,
        if ty == RecordType::Entry {
            "ENTRY"
        } else {
            "EXIT "
        },
        child_ip
    );
    Ok(())
}

fn skipped(flags: RecordFlags) -> bool {
    flags.intersects(RecordFlags::NORECORD | RecordFlags::DISABLED)
}

/// Emit the records a finished (or flushed) frame owes the recorder.
///
/// Entries are deferred until a frame actually needs recording, so this
/// walks back along the record stack and first emits ENTRY records for
/// every ancestor that has not been written yet, then the frame's own
/// ENTRY and, when `end_time` is set, its EXIT. A rotation failure mid
/// walk accounts everything not yet emitted as lost.
pub fn record_trace_data(mtdp: &mut ThreadData, frame_idx: usize, retval: Option<i64>) {
    debug_assert!(frame_idx < mtdp.rstack.len());

    let mut count = 0usize;
    let mut first_unwritten: Option<usize> = None;

    if !mtdp.rstack[frame_idx]
        .flags
        .contains(RecordFlags::WRITTEN)
    {
        let mut walk = frame_idx;
        if !skipped(mtdp.rstack[walk].flags) {
            count += 1;
        }

        while walk > 0 {
            let prev = walk - 1;
            if mtdp.rstack[prev].flags.contains(RecordFlags::WRITTEN) {
                break;
            }
            if !skipped(mtdp.rstack[prev].flags) {
                count += 1;
            }
            walk = prev;
        }
        first_unwritten = Some(walk);
    }

    if mtdp.rstack[frame_idx].end_time != 0 {
        count += 1; // for exit
    }

    log!(
        LogDebug3,
        "task {} recording {} records",
        mtdp.tid(),
        count
    );

    if let Some(mut walk) = first_unwritten {
        while walk < frame_idx {
            if !skipped(mtdp.rstack[walk].flags) {
                if record_ret_stack(mtdp, RecordType::Entry, walk).is_err() {
                    mtdp.shmem.losts += (count - 1) as u32;
                    return;
                }
                count -= 1;
            }
            walk += 1;
        }
    }

    if !mtdp.rstack[frame_idx]
        .flags
        .intersects(RecordFlags::WRITTEN | RecordFlags::NORECORD | RecordFlags::DISABLED)
    {
        if record_ret_stack(mtdp, RecordType::Entry, frame_idx).is_err() {
            return;
        }
        count -= 1;
    }

    if mtdp.rstack[frame_idx].end_time != 0 {
        if let Some(value) = retval {
            args::save_retval(mtdp, frame_idx, value);
        }

        if record_ret_stack(mtdp, RecordType::Exit, frame_idx).is_err() {
            return;
        }
        count -= 1;
    }

    debug_assert_eq!(count, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::util;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.bufsize = 4096;
        cfg.max_stack = 16;
        cfg
    }

    fn read_records(mtdp: &ThreadData) -> Vec<WireRecord> {
        let buf = mtdp.shmem.curr_buf().unwrap();
        let mut records = Vec::new();
        let mut offset = 0;
        while offset + WIRE_RECORD_SIZE <= buf.size() {
            let rec: WireRecord =
                unsafe { std::ptr::read_unaligned(buf.data().add(offset) as *const WireRecord) };
            offset += WIRE_RECORD_SIZE;
            if rec.more() != 0 {
                // skip the payload: u16 total prefix + fields, 8-aligned
                let total = unsafe {
                    std::ptr::read_unaligned(buf.data().add(offset) as *const u16)
                } as usize;
                offset += align(2 + total, 8);
            }
            records.push(rec);
        }
        records
    }

    #[test]
    fn packed_word_roundtrip() {
        let rec = WireRecord::new(12345, RecordType::Exit, true, 0x155, 0x7fff_dead_beef);
        assert_eq!(rec.time, 12345);
        assert_eq!(rec.record_type(), RecordType::Exit);
        assert_eq!(rec.marker(), RECORD_MARKER);
        assert_eq!(rec.more(), 1);
        assert_eq!(rec.depth(), 0x155);
        assert_eq!(rec.addr(), 0x7fff_dead_beef);
    }

    #[test]
    fn depth_and_addr_are_masked() {
        let rec = WireRecord::new(0, RecordType::Entry, false, 0xffff, u64::max_value());
        assert_eq!(rec.depth(), 0x3ff);
        assert_eq!(rec.addr(), (1u64 << 48) - 1);
    }

    #[test]
    fn entry_exit_pair_reaches_buffer() {
        let tid = util::gettid();
        let mut mtdp = ThreadData::new(&test_config());
        mtdp.shmem.prepare(tid);

        let idx = mtdp.push_for_test(0x4000, 100);
        mtdp.rstack[idx].end_time = 250;

        record_trace_data(&mut mtdp, idx, None);

        let records = read_records(&mtdp);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type(), RecordType::Entry);
        assert_eq!(records[0].time, 100);
        assert_eq!(records[0].addr(), 0x4000);
        assert_eq!(records[1].record_type(), RecordType::Exit);
        assert_eq!(records[1].time, 250);
        assert!(mtdp.rstack[idx].flags.contains(RecordFlags::WRITTEN));

        mtdp.unlink_ring_for_test(tid);
    }

    #[test]
    fn leaf_exit_coalesces_unwritten_ancestors() {
        let tid = util::gettid();
        let mut mtdp = ThreadData::new(&test_config());
        mtdp.shmem.prepare(tid);

        let a = mtdp.push_for_test(0xa000, 10);
        let b = mtdp.push_for_test(0xb000, 20);
        let c = mtdp.push_for_test(0xc000, 30);
        mtdp.rstack[c].end_time = 40;

        record_trace_data(&mut mtdp, c, None);

        let records = read_records(&mtdp);
        let kinds: Vec<(RecordType, u64, u64)> = records
            .iter()
            .map(|r| (r.record_type(), r.addr(), r.time))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (RecordType::Entry, 0xa000, 10),
                (RecordType::Entry, 0xb000, 20),
                (RecordType::Entry, 0xc000, 30),
                (RecordType::Exit, 0xc000, 40),
            ]
        );
        assert!(mtdp.rstack[a].flags.contains(RecordFlags::WRITTEN));
        assert!(mtdp.rstack[b].flags.contains(RecordFlags::WRITTEN));

        // A later exit of b must not repeat the already-written entry.
        mtdp.rstack[b].end_time = 50;
        record_trace_data(&mut mtdp, b, None);
        let records = read_records(&mtdp);
        assert_eq!(records.len(), 5);
        assert_eq!(records[4].record_type(), RecordType::Exit);
        assert_eq!(records[4].addr(), 0xb000);

        mtdp.unlink_ring_for_test(tid);
    }

    #[test]
    fn coalescing_skips_filtered_ancestors() {
        let tid = util::gettid();
        let mut mtdp = ThreadData::new(&test_config());
        mtdp.shmem.prepare(tid);

        let a = mtdp.push_for_test(0xa000, 10);
        let b = mtdp.push_for_test(0xb000, 20);
        mtdp.rstack[b].flags.insert(RecordFlags::NORECORD);
        let c = mtdp.push_for_test(0xc000, 30);
        mtdp.rstack[c].end_time = 40;

        record_trace_data(&mut mtdp, c, None);

        let records = read_records(&mtdp);
        let addrs: Vec<u64> = records.iter().map(|r| r.addr()).collect();
        assert_eq!(addrs, vec![0xa000, 0xc000, 0xc000]);
        assert!(!mtdp.rstack[b].flags.contains(RecordFlags::WRITTEN));
        let _ = a;

        mtdp.unlink_ring_for_test(tid);
    }

    #[test]
    fn buffer_full_rotates_midstream() {
        let tid = util::gettid();
        let mut cfg = test_config();
        // room for the header plus three records per buffer
        cfg.bufsize = crate::shmem::BUFFER_HDR_SIZE + 3 * WIRE_RECORD_SIZE;
        let mut mtdp = ThreadData::new(&cfg);
        mtdp.shmem.prepare(tid);

        for ip in 0..4u64 {
            let idx = mtdp.push_for_test(0x1000 + ip, 10 + ip);
            mtdp.rstack[idx].end_time = 20 + ip;
            record_trace_data(&mut mtdp, idx, None);
            mtdp.pop_for_test();
        }

        // 8 records at 3 per buffer forces rotations; current buffer
        // holds the remainder.
        assert!(mtdp.shmem.nr_buf() >= 2);
        assert_eq!(mtdp.shmem.losts, 0);
        let records = read_records(&mtdp);
        assert_eq!(records.len(), 2);

        mtdp.unlink_ring_for_test(tid);
    }
}
