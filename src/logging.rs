//! Log initialization: severity threshold, terminal echo, syslog routing.

use std::io::{self, Write};
use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::cli::LogLevel;

static SYSLOG_OPEN: Once = Once::new();

/// Writer that forwards formatted log lines to syslog, optionally echoing
/// them to stderr as well.
#[derive(Clone, Copy)]
struct LogWriter {
    syslog: bool,
    echo: bool,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.echo {
            io::stderr().write_all(buf)?;
        }
        if self.syslog {
            SYSLOG_OPEN.call_once(|| unsafe {
                libc::openlog(b"csptp\0".as_ptr() as *const _, libc::LOG_PID, libc::LOG_DAEMON);
            });
            if let Ok(line) = std::ffi::CString::new(buf.strip_suffix(b"\n").unwrap_or(buf)) {
                unsafe {
                    libc::syslog(libc::LOG_INFO, b"%s\0".as_ptr() as *const _, line.as_ptr());
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.echo {
            io::stderr().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. Without `--syslog` the output goes to the
/// terminal; with it, `echo` keeps the terminal copy.
pub fn init(level: LogLevel, syslog: bool, echo: bool) -> anyhow::Result<()> {
    let writer = LogWriter { syslog, echo: echo || !syslog };
    let filter = EnvFilter::from_default_env().add_directive(level.directive().parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || writer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("log init: {err}"))?;
    Ok(())
}
