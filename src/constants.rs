use std::time::Duration;

/// Interpreter names probed in order when no explicit interpreter is configured
/// (or the configured one does not answer `--version`).
pub const INTERPRETER_CANDIDATES: [&str; 3] = ["python3", "python", "py"];

/// Returned by the resolver when every candidate fails its probe.
pub const FALLBACK_INTERPRETER: &str = "python3";

pub const VERSION_ARG: &str = "--version";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub const PACKAGE_MANAGER_MODULE_ARGS: [&str; 2] = ["-m", "pip"];
pub const INSTALL_SUBCOMMAND: &str = "install";
pub const INSTALL_FLAGS: [&str; 2] = ["--quiet", "--user"];
pub const DISABLE_VERSION_CHECK_FLAG: &str = "--disable-pip-version-check";
pub const LIST_PACKAGES_ARGS: [&str; 2] = ["list", "--format=json"];

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONCURRENT: usize = 2;
pub const DEFAULT_SCRIPT_EXTENSION: &str = "py";

/// How long a naturally exited process gets to flush its remaining output.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Exit code reported for runs that never produced one of their own.
pub const NO_EXIT_CODE: i32 = -1;

pub const NO_LIBRARIES_MSG: &str = "No libraries provided for installation";
