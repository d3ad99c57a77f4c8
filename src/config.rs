use std::sync::LazyLock;

use derive_from_env::FromEnv;

/// Longest line accepted by default, excluding its newline.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(FromEnv)]
#[from_env(prefix = "LOGPIPE")]
#[allow(non_snake_case)]
pub struct LogPipeConfig {
    /// Must match [`DEFAULT_MAX_LINE_BYTES`].
    #[from_env(default = "65536")]
    pub MAX_LINE_BYTES: usize,
}

pub static LOGPIPE_CONFIG: LazyLock<LogPipeConfig> = LazyLock::new(|| {
    LogPipeConfig::from_env().unwrap_or_else(|err| {
        log::warn!("invalid LOGPIPE_* environment, using defaults: {err:?}");
        LogPipeConfig {
            MAX_LINE_BYTES: DEFAULT_MAX_LINE_BYTES,
        }
    })
});

#[test]
fn test_default_max_line_bytes() {
    if std::env::var_os("LOGPIPE_MAX_LINE_BYTES").is_none() {
        let config = LogPipeConfig::from_env().unwrap();
        assert_eq!(config.MAX_LINE_BYTES, DEFAULT_MAX_LINE_BYTES);
        assert_eq!(LOGPIPE_CONFIG.MAX_LINE_BYTES, DEFAULT_MAX_LINE_BYTES);
    }
}
