//! Container runtime: process supervision, lifecycle state machine and the
//! blob store backing image archives.

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod lifecycle;
pub mod storage;
pub mod supervisor;

pub use backend::{BackendKind, ContainerBackend, DockerCliBackend, HostProcessBackend};
pub use lifecycle::{LifecycleEngine, LifecycleSettings};
pub use storage::BlobStore;
pub use supervisor::{LaunchSpec, Spawned, Supervisor, TaskOutput, TaskSpec};

/// Opaque reference to a process owned by the [`Supervisor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessHandle(pub(crate) u64);

impl ProcessHandle {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signal deliverable to a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Term,
    Kill,
    Int,
    Hup,
    Stop,
    Cont,
}

impl Signal {
    /// Numeric value on Linux
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Hup => 1,
            Self::Int => 2,
            Self::Kill => 9,
            Self::Term => 15,
            Self::Cont => 18,
            Self::Stop => 19,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
            Self::Int => "SIGINT",
            Self::Hup => "SIGHUP",
            Self::Stop => "SIGSTOP",
            Self::Cont => "SIGCONT",
        }
    }

    /// Accepts `SIGTERM`, `TERM`, `term` or `15`
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "TERM" | "15" => Some(Self::Term),
            "KILL" | "9" => Some(Self::Kill),
            "INT" | "2" => Some(Self::Int),
            "HUP" | "1" => Some(Self::Hup),
            "STOP" | "19" => Some(Self::Stop),
            "CONT" | "18" => Some(Self::Cont),
            _ => None,
        }
    }

    pub(crate) fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as N;
        match self {
            Self::Term => N::SIGTERM,
            Self::Kill => N::SIGKILL,
            Self::Int => N::SIGINT,
            Self::Hup => N::SIGHUP,
            Self::Stop => N::SIGSTOP,
            Self::Cont => N::SIGCONT,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
