//! Outbound network gating. Dependency installation during the Build phase
//! may always reach the package index; user code at Runtime gets egress only
//! when the configuration version opted in explicitly.

use std::fmt;

use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Which side of the environment lifecycle is asking for the network.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ExecutionPhase {
    /// Dependency resolution and installation.
    Build,
    /// User transformation and hook code.
    Runtime,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionPhase::Build => write!(f, "build"),
            ExecutionPhase::Runtime => write!(f, "runtime"),
        }
    }
}

/// Immutable egress decision scoped to one phase of one environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetworkCapability {
    phase: ExecutionPhase,
    allowed: bool,
}

impl NetworkCapability {
    /// Resolve the policy: Build always has egress, Runtime only with the
    /// configuration version's explicit opt-in. Absence of opt-in is denial.
    pub fn scope(phase: ExecutionPhase, explicit_opt_in: bool) -> Self {
        let allowed = match phase {
            ExecutionPhase::Build => true,
            ExecutionPhase::Runtime => explicit_opt_in,
        };
        Self { phase, allowed }
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    pub fn allows_egress(&self) -> bool {
        self.allowed
    }
}

/// The only socket factory handed to environment and hook code. Denials are
/// deterministic and never depend on whether the destination is reachable.
#[derive(Clone, Copy, Debug)]
pub struct GuardedConnector {
    capability: NetworkCapability,
}

impl GuardedConnector {
    pub fn new(capability: NetworkCapability) -> Self {
        Self { capability }
    }

    pub fn capability(&self) -> NetworkCapability {
        self.capability
    }

    /// Open an outbound TCP connection, or fail with `PolicyViolation` before
    /// touching the network when egress is denied for this phase.
    pub async fn connect<A>(&self, addr: A) -> Result<TcpStream>
    where
        A: ToSocketAddrs + fmt::Debug,
    {
        if !self.capability.allows_egress() {
            return Err(EngineError::PolicyViolation {
                detail: format!(
                    "egress to {addr:?} denied in {} phase without network opt-in",
                    self.capability.phase
                ),
            });
        }
        debug!(
            target: "engine::netpolicy",
            phase = %self.capability.phase,
            ?addr,
            "outbound connection permitted"
        );
        Ok(TcpStream::connect(addr).await?)
    }
}
