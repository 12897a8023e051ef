//! Script replay over a live session.
//!
//! Statements run one after the other, each awaited before the next is sent.
//! The first failing statement halts the script; there is no partial-script
//! recovery.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::template::TemplateVariables;
use super::tokenizer::{tokenize, tokenize_raw};
use super::ResourceLocator;
use crate::error::{HarnessError, Result, ScriptError};
use crate::metrics::HarnessMetrics;
use crate::session::{ExecutionOutcome, Session};

/// Replays statements and script files against one session.
#[derive(Clone)]
pub struct ScriptExecutor {
    session: Arc<dyn Session>,
    locator: ResourceLocator,
    metrics: Arc<HarnessMetrics>,
}

impl ScriptExecutor {
    pub fn new(session: Arc<dyn Session>, locator: ResourceLocator) -> Self {
        Self::with_metrics(session, locator, HarnessMetrics::new())
    }

    pub fn with_metrics(
        session: Arc<dyn Session>,
        locator: ResourceLocator,
        metrics: Arc<HarnessMetrics>,
    ) -> Self {
        Self {
            session,
            locator,
            metrics,
        }
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Execute one statement.
    pub async fn execute(&self, statement: &str) -> Result<ExecutionOutcome> {
        trace!(statement, "Executing statement");
        let outcome = self
            .session
            .execute(statement)
            .await
            .map_err(HarnessError::Session)?;
        self.metrics.record_statement();
        Ok(outcome)
    }

    /// Execute one statement on a spawned task.
    pub fn execute_async(
        &self,
        statement: impl Into<String>,
    ) -> JoinHandle<anyhow::Result<ExecutionOutcome>> {
        let session = Arc::clone(&self.session);
        let metrics = Arc::clone(&self.metrics);
        let statement = statement.into();
        tokio::spawn(async move {
            trace!(statement = %statement, "Executing statement asynchronously");
            let outcome = session.execute(&statement).await?;
            metrics.record_statement();
            Ok(outcome)
        })
    }

    /// Replay a plain script. `${...}` text is sent as written.
    ///
    /// Returns the number of statements executed.
    pub async fn execute_script(&self, location: &str) -> Result<usize> {
        info!(location, "Executing CQL script");
        let text = self.locator.read_to_string(location)?;
        let statements = tokenize_raw(text.lines())?;
        self.execute_statements(location, &statements).await
    }

    /// Replay a script after substituting `vars` into its placeholders.
    pub async fn execute_script_template(
        &self,
        location: &str,
        vars: &TemplateVariables,
    ) -> Result<usize> {
        info!(location, variables = vars.len(), "Executing CQL script template");
        let text = self.locator.read_to_string(location)?;
        let statements = tokenize(text.lines(), vars)?;
        self.execute_statements(location, &statements).await
    }

    /// Execute `statements` in order, stopping at the first failure.
    ///
    /// `location` only names the source in logs and errors.
    pub async fn execute_statements(&self, location: &str, statements: &[String]) -> Result<usize> {
        debug!(location, statements = statements.len(), "Replaying statements");
        for (index, statement) in statements.iter().enumerate() {
            trace!(location, index = index + 1, statement = %statement, "Executing statement");
            if let Err(source) = self.session.execute(statement).await {
                return Err(ScriptError::Execution {
                    location: location.to_string(),
                    index: index + 1,
                    statement: statement.clone(),
                    source,
                }
                .into());
            }
            self.metrics.record_statement();
        }
        self.metrics.record_script_replayed();
        Ok(statements.len())
    }
}
