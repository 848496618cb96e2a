use backtrace::Backtrace;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::io::{BufWriter, Result};
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
    LogDebug2,
    LogDebug3,
}

pub use LogLevel::*;

/// Domain letters accepted in `FTRACE_DEBUG_DOMAIN`, mapped to the module
/// whose debug verbosity they control. Unknown letters are ignored.
const DEBUG_DOMAINS: &[(char, &str)] = &[
    ('m', "mcount"),
    ('s', "shmem"),
    ('f', "filter"),
    ('t', "trigger"),
    ('r', "record"),
    ('a', "args"),
    ('p', "msg"),
];

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    // Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
    color: bool,
}

fn debug_level(digit: u32) -> LogLevel {
    match digit {
        0 => LogInfo,
        1 => LogDebug,
        2 => LogDebug2,
        _ => LogDebug3,
    }
}

/// `FTRACE_DEBUG_DOMAIN` holds `<domain letter><level digit>` pairs,
/// e.g. `s3f1` for shmem at level 3 and filter at level 1.
fn build_debug_domain(spec: &str, level_map: &mut HashMap<String, LogLevel>) {
    let chars: Vec<char> = spec.chars().collect();
    for pair in chars.chunks(2) {
        if pair.len() != 2 {
            break;
        }
        let digit = match pair[1].to_digit(10) {
            Some(d) => d,
            None => continue,
        };
        if let Some((_, module)) = DEBUG_DOMAINS.iter().find(|(c, _)| *c == pair[0]) {
            level_map.insert((*module).to_owned(), debug_level(digit));
        }
    }
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut f: Box<dyn Write + Send> = Box::new(io::stderr());
        if let Ok(fd_str) = std::env::var("FTRACE_LOGFD") {
            if let Ok(fd) = fd_str.parse::<i32>() {
                // minimal sanity check before adopting the fd
                if nix::sys::stat::fstat(fd).is_ok() {
                    let file = unsafe { File::from_raw_fd(fd) };
                    f = Box::new(BufWriter::with_capacity(1024, file));
                }
            }
        }

        let mut default_level = LogInfo;
        if let Ok(debug_str) = std::env::var("FTRACE_DEBUG") {
            if let Ok(level) = debug_str.parse::<u32>() {
                default_level = debug_level(level);
            }
        }

        let mut level_map = HashMap::new();
        if default_level > LogInfo {
            if let Ok(domain_str) = std::env::var("FTRACE_DEBUG_DOMAIN") {
                build_debug_domain(&domain_str, &mut level_map);
            }
        }

        let color = std::env::var("FTRACE_COLOR")
            .map(|s| s != "0")
            .unwrap_or(false);

        Mutex::new(LogGlobals {
            level_map,
            log_file: f,
            default_level,
            color,
        })
    };
}

/// Given a module name, what is its log level?
fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    match l.level_map.get(module_name) {
        Some(level) => *level,
        None => l.default_level,
    }
}

/// Given a filename what is the corresponding module name?
fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug | LogDebug2 | LogDebug3 => "DEBUG",
    }
}

fn log_color(level: LogLevel) -> &'static str {
    match level {
        LogFatal | LogError => "\x1b[31m",
        LogWarn => "\x1b[33m",
        _ => "\x1b[2m",
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(level: LogLevel, filename: &str, line: u32) -> NewLineTerminatingOstream {
        let lock = LOG_GLOBALS.lock().unwrap();
        let module = filename_to_module_name(filename);
        let enabled = level == LogFatal || level <= get_log_level(&module, &lock);
        let mut this = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            if level >= LogDebug {
                write!(this, "[{}] ", module).unwrap();
            } else {
                let color = this.lock.color;
                write_prefix(&mut this, level, filename, line, color);
            }
        }

        this
    }
}

fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32, color: bool) {
    if color {
        write!(stream, "{}[{}]\x1b[0m ", log_color(level), log_name(level)).unwrap();
    } else {
        write!(stream, "[{}] ", log_name(level)).unwrap();
    }
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Need to pretend these were written. Otherwise we get a `Err` value
        // Custom { kind: WriteZero, error: "failed to write whole buffer" }
        Ok(buf.len())
    }
}

pub fn log(log_level: LogLevel, filename: &str, line: u32) -> NewLineTerminatingOstream {
    NewLineTerminatingOstream::new(log_level, filename, line)
}

macro_rules! log {
    ($log_level:expr, $($args:tt)*) => {{
        use std::io::Write;
        let mut stream = crate::log::log(
            $log_level,
            file!(),
            line!()
        );
        write!(stream, $($args)*).unwrap()
    }};
}

macro_rules! fatal {
    ($($args:tt)+) => {{
        {
            use std::io::Write;
            let mut stream = crate::log::log(
                crate::log::LogLevel::LogFatal,
                file!(),
                line!()
            );
            write!(stream, $($args)+).unwrap();
        }
        crate::log::notifying_abort(backtrace::Backtrace::new());
    }};
}

pub fn notifying_abort(bt: Backtrace) -> ! {
    dump_mcount_stack(bt);
    std::process::abort();
}

fn dump_mcount_stack(bt: Backtrace) {
    write!(io::stderr(), "=== Start mcount backtrace:\n").unwrap();
    write!(io::stderr(), "{:?}", bt).unwrap();
    write!(io::stderr(), "=== End mcount backtrace\n").unwrap();
}
