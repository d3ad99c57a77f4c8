use std::{fmt, io::Write};

use log::Level;

/// Forwards every line to the `log` facade at `level`.
///
/// ```rust
/// use logpipe::{LogPipe, log_func};
///
/// let mut pipe = LogPipe::new().with_tag("worker");
/// let _stderr = pipe.must_add_tagged("worker:stderr", log_func(log::Level::Warn));
/// ```
pub fn log_func(level: Level) -> impl FnMut(fmt::Arguments<'_>) + Send + 'static {
    move |args| log::log!(level, "{args}")
}

/// Prints every line to stdout.
pub fn stdout_func() -> impl FnMut(fmt::Arguments<'_>) + Send + 'static {
    |args| {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{args}").ok();
    }
}

/// Prints every line to stderr.
pub fn stderr_func() -> impl FnMut(fmt::Arguments<'_>) + Send + 'static {
    |args| {
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{args}").ok();
    }
}
