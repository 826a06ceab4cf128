//! Runtime configuration knobs

use std::sync::OnceLock;

/// Directory the receiver materializes incoming paths under when `--dir` is
/// not given.
pub const DEFAULT_RECEIVE_DIR: &str = "received";

/// Environment variable that globally disables the compressed flag on the
/// sender. Accepted values: `1` or `ON`.
pub const DISABLE_COMPRESSION_ENV: &str = "SLING_DISABLE_COMPRESSION";

/// Whether the sender may flag files as compressed. Read once and cached;
/// never mutated after initialization.
pub fn compression_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        match std::env::var(DISABLE_COMPRESSION_ENV) {
            Ok(value) => value != "1" && value != "ON",
            Err(_) => true,
        }
    })
}
