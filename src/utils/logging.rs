//! Structured wallet logging
//!
//! Every `log_*!` call becomes one `tracing` event. Field values are classed
//! by their key before they are rendered:
//!
//! - secrets (passphrases, mnemonics, WIFs, seeds, private keys) never leave
//!   the process; only their length is logged
//! - wallet addresses keep the hrp and a short tail
//! - txids and block hashes are shortened
//!
//! Level filtering and output format belong to the installed subscriber; the
//! binary installs one through [`init_logging`].

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// How a field value is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldClass {
    Secret,
    Address,
    Hash,
    Plain,
}

const SECRET_KEYS: &[&str] = &["passphrase", "mnemonic", "wif", "seed", "secret", "private", "staking_key"];
const ADDRESS_KEYS: &[&str] = &["address", "recipient", "destination"];
const HASH_KEYS: &[&str] = &["txid", "hash", "block"];

impl FieldClass {
    fn of(key: &str) -> Self {
        let key = key.to_ascii_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| key.contains(w));
        if has(SECRET_KEYS) {
            FieldClass::Secret
        } else if has(ADDRESS_KEYS) {
            FieldClass::Address
        } else if has(HASH_KEYS) {
            FieldClass::Hash
        } else {
            FieldClass::Plain
        }
    }

    fn render(self, value: &str) -> String {
        let value = value.trim();
        match self {
            FieldClass::Secret if value.is_empty() => "<empty>".to_string(),
            FieldClass::Secret => format!("<redacted {} chars>", value.chars().count()),
            FieldClass::Address => shorten(value, value.find('1').map_or(4, |sep| sep + 2), 4),
            FieldClass::Hash => shorten(value, 8, 4),
            FieldClass::Plain => value.to_string(),
        }
    }
}

/// Keep `head` leading and `tail` trailing characters of long values
fn shorten(value: &str, head: usize, tail: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= head + tail + 3 {
        return value.to_string();
    }
    let start: String = chars[..head].iter().collect();
    let end: String = chars[chars.len() - tail..].iter().collect();
    format!("{}..{}", start, end)
}

/// One pending log event; built by the `log_*!` macros
#[derive(Debug)]
pub struct LogEntry {
    level: LogLevel,
    module: &'static str,
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl LogEntry {
    pub fn new(level: LogLevel, module: &'static str, message: impl Into<String>) -> Self {
        Self {
            level,
            module,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        let rendered = FieldClass::of(key).render(&value.to_string());
        self.fields.push((key, rendered));
        self
    }

    pub fn log(self) {
        let fields = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        let module = self.module;
        match self.level {
            LogLevel::Debug => tracing::debug!(module, fields = %fields, "{}", self.message),
            LogLevel::Info => tracing::info!(module, fields = %fields, "{}", self.message),
            LogLevel::Warn => tracing::warn!(module, fields = %fields, "{}", self.message),
            LogLevel::Error => tracing::error!(module, fields = %fields, "{}", self.message),
        }
    }
}

/// Install the stderr subscriber. `RUST_LOG` overrides `filter`.
pub fn init_logging(filter: &str) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    // Already installed by a host or an earlier call
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[doc(hidden)]
#[macro_export]
macro_rules! __wallet_log {
    ($level:ident, $module:expr, $msg:expr $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::utils::logging::LogEntry::new($crate::utils::logging::LogLevel::$level, $module, $msg)
            $(.field(stringify!($key), &$value))*
            .log()
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($args:tt)*) => { $crate::__wallet_log!(Debug, $($args)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($args:tt)*) => { $crate::__wallet_log!(Info, $($args)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($args:tt)*) => { $crate::__wallet_log!(Warn, $($args)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($args:tt)*) => { $crate::__wallet_log!(Error, $($args)*) };
}
