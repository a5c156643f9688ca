//! Fatal Error Reporting
//!
//! Conditions the runtime cannot recover from (an unresolvable dependency
//! cycle, a witness table with a hole in it, a descriptor instantiated with the
//! wrong number of arguments) end here. The report is logged, handed to any
//! registered hooks, written to stderr and then the process is terminated
//! according to the configured [`FatalPolicy`].
//!
//! # Example
//!
//! ```rust,ignore
//! use metadata_runtime::fatal::add_fatal_hook;
//!
//! add_fatal_hook(|report| {
//!     crash_reporter::record(report.message());
//! });
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::RuntimeError;

/// Counter for fatal errors reported in this process.
static FATAL_COUNT: AtomicU64 = AtomicU64::new(0);

type FatalHook = Arc<dyn Fn(&FatalReport) + Send + Sync>;

/// Registry of fatal hooks.
static FATAL_HOOKS: OnceLock<Mutex<Vec<FatalHook>>> = OnceLock::new();

fn get_fatal_hooks() -> &'static Mutex<Vec<FatalHook>> {
    FATAL_HOOKS.get_or_init(|| Mutex::new(Vec::new()))
}

/// What happens once a fatal error has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Abort the process.
    #[default]
    Abort,
    /// Panic with the diagnostic as payload. Only the offending thread unwinds.
    Panic,
}

impl FatalPolicy {
    /// Parse a policy from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "abort" => Some(FatalPolicy::Abort),
            "panic" | "unwind" => Some(FatalPolicy::Panic),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FatalPolicy::Abort => "abort",
            FatalPolicy::Panic => "panic",
        }
    }
}

/// A fatal error as seen by hooks.
#[derive(Debug, Clone)]
pub struct FatalReport {
    message: String,
    count: u64,
    thread_name: Option<String>,
}

impl FatalReport {
    /// The full diagnostic text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// How many fatal errors this process has reported, this one included.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Name of the reporting thread, if it has one.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }
}

/// Register a hook that runs before the process is terminated.
pub fn add_fatal_hook<F>(hook: F)
where
    F: Fn(&FatalReport) + Send + Sync + 'static,
{
    get_fatal_hooks().lock().push(Arc::new(hook));
}

/// Remove all registered fatal hooks.
pub fn clear_fatal_hooks() {
    get_fatal_hooks().lock().clear();
}

/// Number of fatal errors reported so far.
pub fn fatal_count() -> u64 {
    FATAL_COUNT.load(Ordering::Relaxed)
}

/// Report `error` and terminate according to `policy`.
pub fn fatal_error(policy: FatalPolicy, error: &RuntimeError, max_diagnostic_bytes: usize) -> ! {
    let message = error.diagnostic(max_diagnostic_bytes);
    let count = FATAL_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    let report = FatalReport {
        message,
        count,
        thread_name: std::thread::current().name().map(str::to_owned),
    };

    tracing::error!(count, policy = policy.as_str(), "{}", report.message);

    // Hooks run without the registry lock so they may register further hooks.
    let hooks: Vec<FatalHook> = get_fatal_hooks().lock().clone();
    for hook in hooks {
        hook(&report);
    }

    match policy {
        FatalPolicy::Abort => {
            eprintln!("{}", report.message);
            std::process::abort()
        }
        FatalPolicy::Panic => std::panic::panic_any(report.message),
    }
}
