use crate::log::LogLevel::LogDebug;
use nix::sys::uio::{writev, IoVec};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

pub const MSG_MAGIC: u32 = 0xface;
pub const MSG_HDR_SIZE: usize = 12;

/// Control message kinds understood by the recorder.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MsgType {
    RecStart = 1,
    RecEnd = 2,
    Tid = 3,
    ForkStart = 4,
    ForkEnd = 5,
    Session = 6,
    Lost = 7,
}

/// The control pipe fd; -1 when the recorder did not hand us one, in
/// which case every send is a no-op.
static PIPE_FD: AtomicI32 = AtomicI32::new(-1);

pub fn set_pipe(fd: RawFd) {
    PIPE_FD.store(fd, Ordering::SeqCst);
}

pub fn pipe_fd() -> Option<RawFd> {
    let fd = PIPE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        None
    } else {
        Some(fd)
    }
}

pub fn close_pipe() {
    let fd = PIPE_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        let _ = nix::unistd::close(fd);
    }
}

/// `FTRACE_PIPE` must name a FIFO; anything else is ignored.
pub fn adopt_pipe(fd: RawFd) {
    match nix::sys::stat::fstat(fd) {
        Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFIFO => set_pipe(fd),
        _ => log!(LogDebug, "ignore invalid pipe fd: {}", fd),
    }
}

/// Per-task payload shared by TID and the fork messages.
#[derive(Copy, Clone, Default)]
pub struct TaskMsg {
    pub time: u64,
    pub pid: i32,
    pub tid: i32,
}

impl TaskMsg {
    pub const WIRE_SIZE: usize = 16;

    fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.time.to_le_bytes());
        buf[8..12].copy_from_slice(&self.pid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.tid.to_le_bytes());
        buf
    }
}

/// Session announcement payload: task info, 16 hex digit session id,
/// then the executable name. The fixed part stays padded to 8 bytes so
/// `len` equals what the recorder's struct view expects.
fn session_payload(sid: &str, exe: &str, task: &TaskMsg) -> Vec<u8> {
    debug_assert_eq!(sid.len(), 16);

    let mut payload = Vec::with_capacity(TaskMsg::WIRE_SIZE + 24 + exe.len());
    payload.extend_from_slice(&task.to_bytes());
    payload.extend_from_slice(sid.as_bytes());
    payload.extend_from_slice(&(exe.len() as u32).to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(exe.as_bytes());
    payload
}

fn header(ty: MsgType, len: usize) -> [u8; MSG_HDR_SIZE] {
    let mut hdr = [0u8; MSG_HDR_SIZE];
    hdr[0..4].copy_from_slice(&MSG_MAGIC.to_le_bytes());
    hdr[4..8].copy_from_slice(&(ty as u32).to_le_bytes());
    hdr[8..12].copy_from_slice(&(len as u32).to_le_bytes());
    hdr
}

/// One framed message, one vectored write. A short write would leave
/// the recorder desynchronized, so it is fatal on the producer side.
pub(crate) fn send_to(fd: RawFd, ty: MsgType, payload: &[u8]) {
    let hdr = header(ty, payload.len());
    let iov = [IoVec::from_slice(&hdr), IoVec::from_slice(payload)];
    match writev(fd, &iov) {
        Ok(n) if n == MSG_HDR_SIZE + payload.len() => (),
        _ => fatal!("writing control message to pipe"),
    }
}

pub fn send(ty: MsgType, payload: &[u8]) {
    let fd = match pipe_fd() {
        Some(fd) => fd,
        None => return,
    };
    send_to(fd, ty, payload);
}

pub fn send_task(ty: MsgType, task: &TaskMsg) {
    send(ty, &task.to_bytes());
}

pub fn send_session(sid: &str, exe: &str, task: &TaskMsg) {
    send(MsgType::Session, &session_payload(sid, exe, task));
}

pub fn send_rec_start(buffer_name: &str) {
    send(MsgType::RecStart, buffer_name.as_bytes());
}

pub fn send_rec_end(buffer_name: &str) {
    send(MsgType::RecEnd, buffer_name.as_bytes());
}

pub fn send_lost(count: u32) {
    send(MsgType::Lost, &count.to_le_bytes());
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scoped_fd::ScopedFd;
    use nix::unistd::{pipe, read};
    use std::convert::TryInto;

    /// Reads one framed message back the way the recorder would.
    pub(crate) fn read_frame(fd: RawFd) -> (u32, Vec<u8>) {
        let mut hdr = [0u8; MSG_HDR_SIZE];
        let mut got = 0;
        while got < hdr.len() {
            got += read(fd, &mut hdr[got..]).unwrap();
        }
        let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        assert_eq!(magic, MSG_MAGIC);
        let ty = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
        let len = u32::from_le_bytes(hdr[8..12].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        let mut got = 0;
        while got < len {
            got += read(fd, &mut payload[got..]).unwrap();
        }
        (ty, payload)
    }

    #[test]
    fn task_frame_layout() {
        let (rx, tx) = pipe().unwrap();
        let _rx = ScopedFd::from_raw(rx);
        let _tx = ScopedFd::from_raw(tx);

        let task = TaskMsg {
            time: 0x1122334455667788,
            pid: 42,
            tid: 43,
        };
        send_to(tx, MsgType::Tid, &task.to_bytes());

        let (ty, payload) = read_frame(rx);
        assert_eq!(ty, MsgType::Tid as u32);
        assert_eq!(payload.len(), TaskMsg::WIRE_SIZE);
        assert_eq!(
            u64::from_le_bytes(payload[0..8].try_into().unwrap()),
            0x1122334455667788
        );
        assert_eq!(i32::from_le_bytes(payload[8..12].try_into().unwrap()), 42);
        assert_eq!(i32::from_le_bytes(payload[12..16].try_into().unwrap()), 43);
    }

    #[test]
    fn adopt_rejects_non_fifo() {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;

        let fd = open("/dev/null", OFlag::O_WRONLY, Mode::empty()).unwrap();
        adopt_pipe(fd);
        assert!(pipe_fd().is_none());
        let _ = nix::unistd::close(fd);
    }

    #[test]
    fn session_frame_layout() {
        let (rx, tx) = pipe().unwrap();
        let _rx = ScopedFd::from_raw(rx);
        let _tx = ScopedFd::from_raw(tx);

        let task = TaskMsg {
            time: 7,
            pid: 1,
            tid: 2,
        };
        send_to(
            tx,
            MsgType::Session,
            &session_payload("0123456789abcdef", "/bin/true", &task),
        );

        let (ty, payload) = read_frame(rx);
        assert_eq!(ty, MsgType::Session as u32);
        assert_eq!(payload.len(), 16 + 16 + 8 + "/bin/true".len());
        assert_eq!(&payload[16..32], b"0123456789abcdef");
        assert_eq!(
            u32::from_le_bytes(payload[32..36].try_into().unwrap()),
            "/bin/true".len() as u32
        );
        assert_eq!(&payload[40..], b"/bin/true");
    }
}
