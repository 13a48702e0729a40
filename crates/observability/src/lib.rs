//! Process-wide tracing setup shared by the API binary and worker processes.

pub mod tracing;

pub use self::tracing::LogFormat;

/// Install logging filtered by `RUST_LOG` (default `info`), JSON unless
/// `DIRPACK_LOG_FORMAT=pretty`.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    tracing::init(LogFormat::from_env());
}
