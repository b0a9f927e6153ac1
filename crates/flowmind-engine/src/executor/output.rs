use flowmind_core::error::Result;

use super::NodeOutput;
use crate::graph::OutputConfig;
use crate::state::{interpolate, VarLookup};

/// Interpolate each configured line. Never touches state.
pub(crate) fn run(config: &OutputConfig, vars: &dyn VarLookup) -> Result<NodeOutput> {
    let lines = config
        .values
        .iter()
        .map(|line| interpolate(line, vars))
        .collect::<Result<Vec<_>>>()?;
    Ok(NodeOutput {
        lines,
        ..NodeOutput::default()
    })
}
