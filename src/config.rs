use std::os::unix::io::RawFd;

lazy_static! {
    static ref CONFIG: Config = Config::from_env();
}

pub const SHMEM_BUFFER_SIZE: usize = 128 * 1024;
pub const RSTACK_MAX: usize = 1024;
pub const DEFAULT_DEPTH: i32 = 1024;
pub const DEFAULT_DIR: &str = "ftrace.data";

/// Runtime configuration taken from the environment once at startup.
/// Everything that owns per-thread resources takes a `&Config` so tests
/// can run with their own values.
#[derive(Clone)]
pub struct Config {
    /// File descriptor of the control pipe to the recorder, if any.
    /// Validated to be a FIFO before first use.
    pub pipe_fd: Option<RawFd>,
    /// Output directory for the session map file.
    pub dir: String,
    /// Size in bytes of each shared-memory buffer.
    pub bufsize: usize,
    /// Record-stack depth per thread.
    pub max_stack: usize,
    /// Minimum duration (ns) for a frame to be emitted.
    pub threshold: u64,
    /// Default trigger depth applied when a filter matches.
    pub depth: i32,
    /// Start with recording disabled.
    pub disabled: bool,
    /// Hook the PLT/GOT and install per-PLT triggers.
    pub plthook: bool,
    /// Ask the symbol service to demangle names it resolves.
    pub demangle: bool,
    pub filter: Option<String>,
    pub trigger: Option<String>,
    pub argument: Option<String>,
    pub retval: Option<String>,
}

impl Config {
    pub fn get() -> &'static Config {
        &*CONFIG
    }

    pub fn from_env() -> Config {
        let mut cfg = Config::default();

        if let Ok(s) = std::env::var("FTRACE_PIPE") {
            cfg.pipe_fd = s.parse::<RawFd>().ok();
        }
        if let Ok(s) = std::env::var("FTRACE_DIR") {
            cfg.dir = s;
        }
        if let Ok(s) = std::env::var("FTRACE_BUFFER") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.bufsize = v;
            }
        }
        if let Ok(s) = std::env::var("FTRACE_MAX_STACK") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_stack = v;
            }
        }
        if let Ok(s) = std::env::var("FTRACE_THRESHOLD") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.threshold = v;
            }
        }
        if let Ok(s) = std::env::var("FTRACE_DEPTH") {
            if let Ok(v) = s.parse::<i32>() {
                cfg.depth = v;
            }
        }
        cfg.disabled = std::env::var_os("FTRACE_DISABLED").is_some();
        cfg.plthook = std::env::var_os("FTRACE_PLTHOOK").is_some();
        cfg.demangle = std::env::var("FTRACE_DEMANGLE")
            .map(|s| s != "0")
            .unwrap_or(false);
        cfg.filter = std::env::var("FTRACE_FILTER").ok();
        cfg.trigger = std::env::var("FTRACE_TRIGGER").ok();
        cfg.argument = std::env::var("FTRACE_ARGUMENT").ok();
        cfg.retval = std::env::var("FTRACE_RETVAL").ok();

        cfg
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pipe_fd: None,
            dir: DEFAULT_DIR.to_owned(),
            bufsize: SHMEM_BUFFER_SIZE,
            max_stack: RSTACK_MAX,
            threshold: 0,
            depth: DEFAULT_DEPTH,
            disabled: false,
            plthook: false,
            demangle: false,
            filter: None,
            trigger: None,
            argument: None,
            retval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.bufsize, SHMEM_BUFFER_SIZE);
        assert_eq!(cfg.max_stack, RSTACK_MAX);
        assert_eq!(cfg.threshold, 0);
        assert_eq!(cfg.depth, DEFAULT_DEPTH);
        assert_eq!(cfg.dir, DEFAULT_DIR);
        assert!(cfg.pipe_fd.is_none());
        assert!(!cfg.disabled);
    }

    #[test]
    fn env_intake() {
        // Only this test reads these variables, so the set/unset pairs
        // cannot race with anything else in the binary.
        std::env::set_var("FTRACE_BUFFER", "4096");
        std::env::set_var("FTRACE_MAX_STACK", "64");
        std::env::set_var("FTRACE_THRESHOLD", "1000");
        std::env::set_var("FTRACE_DEPTH", "3");
        std::env::set_var("FTRACE_DISABLED", "1");
        std::env::set_var("FTRACE_FILTER", "main");
        let cfg = Config::from_env();
        std::env::remove_var("FTRACE_BUFFER");
        std::env::remove_var("FTRACE_MAX_STACK");
        std::env::remove_var("FTRACE_THRESHOLD");
        std::env::remove_var("FTRACE_DEPTH");
        std::env::remove_var("FTRACE_DISABLED");
        std::env::remove_var("FTRACE_FILTER");

        assert_eq!(cfg.bufsize, 4096);
        assert_eq!(cfg.max_stack, 64);
        assert_eq!(cfg.threshold, 1000);
        assert_eq!(cfg.depth, 3);
        assert!(cfg.disabled);
        assert_eq!(cfg.filter.as_deref(), Some("main"));
    }
}
