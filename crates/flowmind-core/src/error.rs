use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error("Invalid flow: {0}")]
    Structural(String),

    #[error("Invalid expression `{expr}`: {message}")]
    Expression { expr: String, message: String },

    #[error("No outgoing edge matched for node '{node}' (tried: {})", .conditions.join(", "))]
    NoMatchingEdge {
        node: String,
        conditions: Vec<String>,
    },

    #[error("Node '{node}' reached its loop limit ({limit}) on counter '{counter}'")]
    LoopLimitExceeded {
        node: String,
        limit: u64,
        counter: String,
    },

    #[error("Run exceeded the step budget ({0} node executions)")]
    StepBudgetExceeded(usize),

    // State errors
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Type mismatch for '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: String,
        found: String,
    },

    // Model errors
    #[error("Model transport error: {0}")]
    ModelTransport(String),

    #[error("Structured output parse error in node '{node}': {message}")]
    StructuredOutputParse { node: String, message: String },

    #[error("Node '{node}' exceeded max tool-call steps ({max_steps})")]
    ToolLoopExceeded { node: String, max_steps: usize },

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool invocation failed: {tool}: {message}")]
    ToolInvocation { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Approval denied for tool {tool}: {reason}")]
    ToolApprovalDenied { tool: String, reason: String },

    // Fan-out errors
    #[error("Fan-out item {index} failed: {message}")]
    FanoutItem { index: usize, message: String },

    // Run control
    #[error("Invalid resume: {0}")]
    InvalidResume(String),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Errors the engine retries locally before failing the run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ModelTransport(_) | Self::StructuredOutputParse { .. }
        )
    }

    /// A short hint for the flow author, shown alongside fatal errors.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Structural(_) => Some("Fix the node/edge definitions; nothing was executed."),
            Self::Expression { .. } => Some(
                "Conditions support ==, !=, <, <=, >, >=, in, not in, and, or, not, len() and literals.",
            ),
            Self::NoMatchingEdge { .. } => {
                Some("Add a fallback condition such as `true` as the last entry.")
            }
            Self::LoopLimitExceeded { .. } => Some(
                "Guard the loop-back edge with the counter, e.g. `counter < limit`, so another edge is taken.",
            ),
            Self::UnknownVariable(_) => {
                Some("Set the variable before it is referenced, or seed it from run parameters.")
            }
            Self::StructuredOutputParse { .. } => Some(
                "Tighten the prompt or output field descriptions so the model answers with the declared JSON fields.",
            ),
            Self::ToolLoopExceeded { .. } => {
                Some("Raise max_steps for the node or narrow its tool whitelist.")
            }
            Self::ModelTransport(_) => {
                Some("Check the model provider's availability, credentials and rate limits.")
            }
            Self::StepBudgetExceeded(_) => {
                Some("The flow may be looping; add a limit to the nodes on the cycle.")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
