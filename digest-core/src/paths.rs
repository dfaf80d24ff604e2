//! Filesystem layout under `<home>/.weekly-digest/`.
//!
//! ```text
//! ~/.weekly-digest/
//!   config.yaml     (mode 0600)
//!   state.db        (ledger)
//!   digest.sock     (daemon control socket)
//!   audio/          (local audio uploads)
//!   logs/
//!     digest.log
//!     digest-err.log
//! ```
//!
//! Every helper takes an explicit `home` so tests can root the layout in a
//! `TempDir`.

use std::path::{Path, PathBuf};

pub const DIGEST_DIR: &str = ".weekly-digest";
pub const CONFIG_FILE: &str = "config.yaml";
pub const LEDGER_FILE: &str = "state.db";
pub const DAEMON_SOCKET: &str = "digest.sock";
pub const DAEMON_STDOUT_LOG: &str = "digest.log";
pub const DAEMON_STDERR_LOG: &str = "digest-err.log";

pub fn digest_root(home: &Path) -> PathBuf {
    home.join(DIGEST_DIR)
}

pub fn config_path(home: &Path) -> PathBuf {
    digest_root(home).join(CONFIG_FILE)
}

pub fn ledger_path(home: &Path) -> PathBuf {
    digest_root(home).join(LEDGER_FILE)
}

pub fn socket_path(home: &Path) -> PathBuf {
    digest_root(home).join(DAEMON_SOCKET)
}

pub fn audio_dir(home: &Path) -> PathBuf {
    digest_root(home).join("audio")
}

pub fn logs_dir(home: &Path) -> PathBuf {
    digest_root(home).join("logs")
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}
