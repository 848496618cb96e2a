use crate::log::LogLevel::{LogDebug, LogDebug2};
use crate::msg;
use crate::record::WireRecord;
use crate::scoped_fd::ScopedFd;
use crate::session::Session;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::sync::atomic::{AtomicU32, Ordering};

pub const BUFFER_FL_NEW: u32 = 1 << 0;
pub const BUFFER_FL_WRITTEN: u32 = 1 << 1;
pub const BUFFER_FL_RECORDING: u32 = 1 << 2;

pub const BUFFER_HDR_SIZE: usize = 8;

/// Header at the start of every shared-memory buffer. `flag` is the
/// handoff point between us and the recorder: we fetch-or RECORDING
/// when adopting a buffer, the recorder rewrites the whole flag to
/// WRITTEN when it has drained it. `size` counts payload bytes and is
/// producer-owned while RECORDING is set.
#[repr(C)]
pub struct BufferHeader {
    pub flag: AtomicU32,
    pub size: AtomicU32,
}

impl BufferHeader {
    pub fn data(&self) -> *mut u8 {
        unsafe { (self as *const BufferHeader as *mut u8).add(BUFFER_HDR_SIZE) }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed) as usize
    }

    pub fn set_size(&self, size: usize) {
        self.size.store(size as u32, Ordering::Relaxed);
    }
}

/// Shared-memory object name for one buffer of one thread's ring.
pub fn buffer_name(tid: libc::pid_t, idx: usize) -> String {
    format!("/ftrace-{}-{}-{:03}", Session::get().name(), tid, idx)
}

/// A per-thread ring of shared-memory buffers. Buffer slots are reused
/// across rotations; the ring grows on demand and opportunistically
/// drops its tail once the recorder has drained enough of it.
pub struct Shmem {
    bufsize: usize,
    buffers: Vec<*mut BufferHeader>,
    /// Index of the buffer currently RECORDING, or -1 after a failed
    /// allocation (every record is then rejected and counted lost).
    pub curr: isize,
    /// Rotation count, for debug output only.
    seqnum: u32,
    /// Records dropped since the last successful rotation.
    pub losts: u32,
    max_buf: usize,
}

impl Shmem {
    pub fn new(bufsize: usize) -> Shmem {
        Shmem {
            bufsize,
            buffers: Vec::new(),
            curr: -1,
            seqnum: 0,
            losts: 0,
            max_buf: 0,
        }
    }

    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Payload capacity of one buffer.
    pub fn max_payload(&self) -> usize {
        self.bufsize - BUFFER_HDR_SIZE
    }

    pub fn nr_buf(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, idx: usize) -> &BufferHeader {
        unsafe { &*self.buffers[idx] }
    }

    pub fn curr_buf(&self) -> Option<&BufferHeader> {
        if self.curr < 0 {
            None
        } else {
            Some(self.buffer(self.curr as usize))
        }
    }

    fn allocate_buffer(&self, tid: libc::pid_t, idx: usize) -> Option<*mut BufferHeader> {
        let name = buffer_name(tid, idx);

        let fd = match shm_open(
            name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_TRUNC,
            Mode::from_bits_truncate(0o600),
        ) {
            Ok(fd) => ScopedFd::from_raw(fd),
            Err(_) => {
                log!(LogDebug, "failed to open shmem buffer: {}", name);
                return None;
            }
        };

        if nix::unistd::ftruncate(fd.get(), self.bufsize as libc::off_t).is_err() {
            log!(LogDebug, "failed to resize shmem buffer: {}", name);
            return None;
        }

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                self.bufsize,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.get(),
                0,
            )
        };

        match ptr {
            Ok(addr) => {
                let buffer = addr as *mut BufferHeader;
                // mark it's a new buffer
                unsafe { (*buffer).flag.store(BUFFER_FL_NEW, Ordering::Relaxed) };
                Some(buffer)
            }
            Err(_) => {
                log!(LogDebug, "failed to mmap shmem buffer: {}", name);
                None
            }
        }
    }

    /// Allocate the initial two buffers and start recording into the
    /// first one. Allocation trouble leaves the ring in the lost-record
    /// state rather than touching the traced program.
    pub fn prepare(&mut self, tid: libc::pid_t) {
        log!(LogDebug2, "preparing shmem buffers");

        for idx in 0..2 {
            match self.allocate_buffer(tid, idx) {
                Some(buffer) => self.buffers.push(buffer),
                None => break,
            }
        }
        self.max_buf = self.buffers.len();

        if self.buffers.is_empty() {
            self.curr = -1;
            return;
        }

        // set idx 0 as current buffer
        msg::send_rec_start(&buffer_name(tid, 0));
        self.curr = 0;
        self.buffer(0)
            .flag
            .store(BUFFER_FL_RECORDING, Ordering::Relaxed);
    }

    /// Move recording to the first buffer the recorder is done with, or
    /// grow the ring by one. Pending lost records are flushed into the
    /// head of the newly adopted buffer.
    pub fn rotate(&mut self, tid: libc::pid_t) {
        // always use first buffer available
        let mut idx = self.buffers.len();
        for i in 0..self.buffers.len() {
            if self.buffer(i).flag.load(Ordering::Relaxed) & BUFFER_FL_RECORDING == 0 {
                idx = i;
                break;
            }
        }

        if idx == self.buffers.len() {
            match self.allocate_buffer(tid, idx) {
                Some(buffer) => {
                    self.buffers.push(buffer);
                    if self.buffers.len() > self.max_buf {
                        self.max_buf = self.buffers.len();
                    }
                }
                None => {
                    self.curr = -1;
                    return;
                }
            }
        }

        // Start the buffer and mark it recording; the recorder's writer
        // clears the bit from its side when draining.
        self.buffer(idx).flag.fetch_or(BUFFER_FL_RECORDING, Ordering::SeqCst);

        self.seqnum += 1;
        self.curr = idx as isize;
        self.buffer(idx).set_size(0);

        self.shrink(idx);

        let name = buffer_name(tid, idx);
        log!(LogDebug2, "new buffer: [{}] {}", idx, name);
        msg::send_rec_start(&name);

        if self.losts > 0 {
            let lost = WireRecord::lost(self.losts as u64);
            unsafe {
                std::ptr::write_unaligned(self.buffer(idx).data() as *mut WireRecord, lost);
            }
            msg::send_lost(self.losts);

            self.buffer(idx).set_size(WireRecord::WIRE_SIZE);
            self.losts = 0;
        }
    }

    /// Drop the tail buffer if the recorder has drained at least three
    /// buffers past the current one and the tail itself is drained.
    fn shrink(&mut self, idx: usize) {
        let nr_buf = self.buffers.len();
        if idx + 3 > nr_buf {
            return;
        }

        let written = (idx + 1..nr_buf)
            .filter(|&i| self.buffer(i).flag.load(Ordering::Relaxed) == BUFFER_FL_WRITTEN)
            .count();
        let last = nr_buf - 1;
        if written >= 3 && self.buffer(last).flag.load(Ordering::Relaxed) == BUFFER_FL_WRITTEN {
            let buffer = self.buffers.pop().unwrap();
            unsafe {
                let _ = munmap(buffer as *mut libc::c_void, self.bufsize);
            }
        }
    }

    /// Tell the recorder one buffer is done.
    pub fn finish_buffer(&self, tid: libc::pid_t, idx: usize) {
        msg::send_rec_end(&buffer_name(tid, idx));
    }

    /// Announce the end of every buffer still marked RECORDING, then
    /// unmap the ring.
    pub fn finish(&mut self, tid: libc::pid_t) {
        for i in 0..self.buffers.len() {
            if self.buffer(i).flag.load(Ordering::Relaxed) & BUFFER_FL_RECORDING != 0 {
                self.finish_buffer(tid, i);
            }
        }

        log!(
            LogDebug,
            "shmem finish: tid: {}, seqnum = {}, nr_buf = {} max_buf = {}",
            tid,
            self.seqnum,
            self.buffers.len(),
            self.max_buf
        );
        self.clear();
    }

    /// Unmap all buffers without telling the recorder anything. Used by
    /// the fork child, whose inherited mappings still belong to the
    /// parent's session.
    pub fn clear(&mut self) {
        log!(LogDebug2, "releasing all shmem buffers");

        for buffer in self.buffers.drain(..) {
            unsafe {
                let _ = munmap(buffer as *mut libc::c_void, self.bufsize);
            }
        }
        self.curr = -1;
    }
}

impl Drop for Shmem {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use crate::util;

    fn unlink_ring(tid: libc::pid_t, max_idx: usize) {
        for idx in 0..=max_idx {
            let _ = nix::sys::mman::shm_unlink(buffer_name(tid, idx).as_str());
        }
    }

    #[test]
    fn prepare_marks_first_buffer_recording() {
        let tid = util::gettid();
        let mut ring = Shmem::new(4096);
        ring.prepare(tid);

        assert_eq!(ring.nr_buf(), 2);
        assert_eq!(ring.curr, 0);
        assert_eq!(
            ring.buffer(0).flag.load(Ordering::Relaxed),
            BUFFER_FL_RECORDING
        );
        assert_eq!(ring.buffer(1).flag.load(Ordering::Relaxed), BUFFER_FL_NEW);

        // The objects are real and visible under their public names.
        let fd = shm_open(
            buffer_name(tid, 0).as_str(),
            OFlag::O_RDONLY,
            Mode::empty(),
        )
        .unwrap();
        let _ = nix::unistd::close(fd);

        ring.clear();
        unlink_ring(tid, 1);
    }

    #[test]
    fn rotate_prefers_free_buffer_then_grows() {
        let tid = util::gettid();
        let mut ring = Shmem::new(4096);
        ring.prepare(tid);

        ring.rotate(tid);
        assert_eq!(ring.curr, 1);
        assert_eq!(ring.nr_buf(), 2);

        // Both buffers held by us now; the ring must grow.
        ring.rotate(tid);
        assert_eq!(ring.curr, 2);
        assert_eq!(ring.nr_buf(), 3);

        // Recorder drains buffer 0; it is preferred over growing.
        ring.buffer(0)
            .flag
            .store(BUFFER_FL_WRITTEN, Ordering::Relaxed);
        ring.rotate(tid);
        assert_eq!(ring.curr, 0);
        assert_eq!(ring.nr_buf(), 3);
        assert_eq!(
            ring.buffer(0).flag.load(Ordering::Relaxed),
            BUFFER_FL_WRITTEN | BUFFER_FL_RECORDING
        );
        assert_eq!(ring.buffer(0).size(), 0);

        ring.clear();
        unlink_ring(tid, 2);
    }

    #[test]
    fn shrink_drops_written_tail() {
        let tid = util::gettid();
        let mut ring = Shmem::new(4096);
        ring.prepare(tid);

        // First rotation reuses the spare buffer, the next two grow.
        for _ in 0..3 {
            ring.rotate(tid);
        }
        assert_eq!(ring.nr_buf(), 4);
        assert_eq!(ring.curr, 3);

        // Recorder drains everything; adopting buffer 0 sees three
        // WRITTEN buffers past it, tail included, and drops the tail.
        for i in 0..4 {
            ring.buffer(i)
                .flag
                .store(BUFFER_FL_WRITTEN, Ordering::Relaxed);
        }
        ring.rotate(tid);
        assert_eq!(ring.curr, 0);
        assert_eq!(ring.nr_buf(), 3);

        ring.clear();
        unlink_ring(tid, 3);
    }

    #[test]
    fn shrink_needs_three_written_past_current() {
        let tid = util::gettid();
        let mut ring = Shmem::new(4096);
        ring.prepare(tid);
        for _ in 0..3 {
            ring.rotate(tid);
        }
        assert_eq!(ring.nr_buf(), 4);

        // Only two drained past the adopted buffer: no shrink.
        for i in 0..3 {
            ring.buffer(i)
                .flag
                .store(BUFFER_FL_WRITTEN, Ordering::Relaxed);
        }
        ring.rotate(tid);
        assert_eq!(ring.curr, 0);
        assert_eq!(ring.nr_buf(), 4);

        ring.clear();
        unlink_ring(tid, 3);
    }

    #[test]
    fn shrink_spares_undrained_tail() {
        let tid = util::gettid();
        let mut ring = Shmem::new(4096);
        ring.prepare(tid);
        for _ in 0..4 {
            ring.rotate(tid);
        }
        assert_eq!(ring.nr_buf(), 5);
        assert_eq!(ring.curr, 4);

        // Three WRITTEN past the adopted buffer, but the tail is still
        // in the recorder's hands.
        for i in 0..4 {
            ring.buffer(i)
                .flag
                .store(BUFFER_FL_WRITTEN, Ordering::Relaxed);
        }
        ring.rotate(tid);
        assert_eq!(ring.curr, 0);
        assert_eq!(ring.nr_buf(), 5);

        ring.clear();
        unlink_ring(tid, 4);
    }

    #[test]
    fn pending_losts_flush_into_next_buffer() {
        let tid = util::gettid();
        let mut ring = Shmem::new(4096);
        ring.prepare(tid);

        ring.curr = -1;
        ring.losts = 17;

        ring.rotate(tid);
        assert_eq!(ring.losts, 0);
        assert!(ring.curr >= 0);

        let buf = ring.curr_buf().unwrap();
        assert_eq!(buf.size(), WireRecord::WIRE_SIZE);
        let rec = unsafe { std::ptr::read_unaligned(buf.data() as *const WireRecord) };
        assert_eq!(rec.time, 0);
        assert_eq!(rec.record_type(), RecordType::Lost);
        assert_eq!(rec.addr(), 17);
        assert_eq!(rec.more(), 0);

        ring.clear();
        unlink_ring(tid, 2);
    }
}
