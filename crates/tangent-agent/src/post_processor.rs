//! Post-processors applied to a run's aggregated result.

use async_trait::async_trait;

use crate::agent::{Agent, AgentResult};
use crate::error::AgentError;

/// Transforms the aggregated result of a run; processors compose in
/// registration order.
///
/// A processor that declares streaming support is allowed on streaming runs
/// unconditionally. Non-streaming processors are rejected at streaming entry
/// unless the caller opts in with `allow_non_streaming`, in which case they
/// run once on the aggregated result when the stream is finished.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(
        &self,
        result: AgentResult,
        agent: &Agent,
    ) -> Result<AgentResult, AgentError>;

    fn supports_streaming(&self) -> bool {
        false
    }
}
