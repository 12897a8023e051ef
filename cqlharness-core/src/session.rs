//! Session Trait - client connection to the engine
//!
//! The harness never speaks the wire protocol itself. It submits statements
//! through a [`Session`] produced by a [`SessionFactory`], both supplied by
//! the caller (typically a thin wrapper over a CQL driver).

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of executing one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// `false` when a conditional statement (`IF NOT EXISTS`, LWT) was not applied.
    pub applied: bool,
}

impl ExecutionOutcome {
    pub fn applied() -> Self {
        Self { applied: true }
    }

    pub fn not_applied() -> Self {
        Self { applied: false }
    }
}

/// Where a session should connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub cluster_name: String,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.cluster_name)
    }
}

/// A live client session.
///
/// Implementations must be shareable across tasks; the orchestrator hands
/// the same session to every caller.
#[async_trait]
pub trait Session: Send + Sync {
    /// Identity used to deduplicate shutdown registrations.
    fn id(&self) -> String;

    async fn execute(&self, statement: &str) -> Result<ExecutionOutcome>;

    /// Close the session. Should be idempotent.
    async fn close(&self) -> Result<()>;
}

/// Opens sessions against a running engine.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Session>>;
}
