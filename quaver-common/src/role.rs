//! Process role and fatal-error reporting
//!
//! A single process-wide flag distinguishes the server role (background
//! audio process, reports through the structured logger) from the client
//! role (foreground terminal process, reports on stderr). The flag is set
//! exactly once at startup; before that, fatal reporting assumes the client
//! role so early startup failures still reach the user.

use std::sync::OnceLock;
use tracing::error;

/// Exit status used for fatal process-level conditions, distinct from the
/// generic failure status returned by the CLI on ordinary errors.
pub const FATAL_EXIT_CODE: i32 = 2;

/// Which half of the player this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Background process owning the audio device and caches
    Server,
    /// Foreground terminal process
    Client,
}

static ROLE: OnceLock<ProcessRole> = OnceLock::new();

/// Set the process role. Later calls are ignored; the first caller wins.
pub fn set_role(role: ProcessRole) {
    let _ = ROLE.set(role);
}

/// The current process role (Client until `set_role` is called).
pub fn role() -> ProcessRole {
    ROLE.get().copied().unwrap_or(ProcessRole::Client)
}

/// Report a fatal condition and terminate the process.
///
/// Server processes log through tracing so the message lands wherever the
/// subscriber routes it; client processes write a plain diagnostic to
/// stderr. Either way the process exits with [`FATAL_EXIT_CODE`].
pub fn fatal(message: &str) -> ! {
    match role() {
        ProcessRole::Server => error!("FATAL: {}", message),
        ProcessRole::Client => eprintln!("quaver: fatal: {}", message),
    }
    std::process::exit(FATAL_EXIT_CODE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_set_wins() {
        set_role(ProcessRole::Server);
        set_role(ProcessRole::Client);
        assert_eq!(role(), ProcessRole::Server);
    }
}
