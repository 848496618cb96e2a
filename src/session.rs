use crate::util;
use std::fs::File;
use std::io;

/// Process-wide tracing session: a 64-bit random id rendered as 16 hex
/// digits. Created lazily on first use, once per process.
pub struct Session {
    pub id: u64,
    name: String,
}

lazy_static! {
    static ref SESSION: Session = {
        let id = util::good_random();
        Session {
            id,
            name: format!("{:016x}", id),
        }
    };
    static ref EXENAME: String = util::read_exename();
}

impl Session {
    pub fn get() -> &'static Session {
        &*SESSION
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub fn exename() -> &'static str {
    &*EXENAME
}

/// Snapshot `/proc/self/maps` to `<dir>/sid-<sid>.map` so the recorder
/// can resolve addresses later. Called once at first-thread init; a
/// failure here means the session cannot be recorded at all.
pub fn record_proc_maps(dirname: &str, sess_id: &str) {
    if let Err(e) = copy_proc_maps(dirname, sess_id) {
        fatal!("cannot write session maps file: {}", e);
    }
}

fn copy_proc_maps(dirname: &str, sess_id: &str) -> io::Result<()> {
    let mut maps = File::open("/proc/self/maps")?;
    let path = format!("{}/sid-{}.map", dirname, sess_id);
    let mut out = File::create(&path)?;
    io::copy(&mut maps, &mut out)?;
    Ok(())
}
