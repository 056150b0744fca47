//! Phase names, cache keys and timing defaults shared across backends.

use std::time::Duration;

/// Processes in any of these phases are considered finished.
///
/// Finished processes are left out of listings unless the caller asks
/// for them explicitly.
pub const FINAL_PROCESS_PHASES: [&str; 4] = ["", "clean", "cleanrm", "postrm"];

/// Package name used for records synthesized from pipeline events rather
/// than from an ebuild.
pub const PIPELINE_PACKAGE: &str = "pipeline";

/// Cache key holding the serialized process table.
pub const TABLE_KEY: &str = "table";

/// Cache key used by the cooperative table lock.
pub const LOCK_KEY: &str = "lock";

/// Cache key marking that an expiry scan ran recently.
pub const PURGED_KEY: &str = "purged";

/// How long a blocked lock acquirer sleeps before checking again.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
