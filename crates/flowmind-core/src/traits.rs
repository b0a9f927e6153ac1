use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::*;

/// Model capability: streaming generation with optional tools and output schema.
pub trait ModelClient: Send + Sync + 'static {
    /// Send a request and receive a stream of deltas.
    fn generate(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Tool: an externally provided capability invoked by name.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls and Tool nodes).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// JSON Schema for the tool's result, if it declares one.
    fn output_schema(&self) -> Option<serde_json::Value> {
        None
    }

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}
