//! Identifiers for processes, clients, cycles and jobs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a view process within a processor.
    ViewProcessId,
    "process"
);
define_id!(
    /// Identifies a view client within a processor.
    ViewClientId,
    "client"
);
define_id!(
    /// Identifies one computation cycle. Unique across all processes of a processor.
    CycleId,
    "cycle"
);
define_id!(
    /// Identifies one calculation job.
    JobId,
    "job"
);

/// Monotonic id source shared by everything created from one processor.
#[derive(Debug, Default)]
pub(crate) struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Name of a view definition, as understood by the [`ViewCompiler`](crate::ViewCompiler).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ViewDefinitionId(Arc<str>);

impl ViewDefinitionId {
    /// Create a definition id from its name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The definition name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewDefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ViewDefinitionId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identifies the set of function implementations a graph was compiled against.
///
/// Whenever functions are redeployed the compiler reports a new id, and nothing computed
/// under an older id is treated as reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionInitId(pub u64);

impl fmt::Display for FunctionInitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "init-{}", self.0)
    }
}
