use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use flowmind_core::error::{FlowError, Result};

use super::edge::Edge;
use super::node::{InputOptions, Node, NodeKind, UpdateAction};
use crate::expr::Condition;
use crate::state::VarLookup;

/// Entry sentinel.
pub const START: &str = "START";
/// Exit sentinel.
pub const END: &str = "END";

/// A flow as authored: nodes plus edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl FlowDefinition {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }
}

/// One outgoing route, with its condition parsed.
#[derive(Debug, Clone)]
pub enum Route {
    Always { to: String },
    When { condition: Condition, to: String },
}

/// A validated flow, ready to run.
#[derive(Debug, Clone)]
pub struct Flow {
    description: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    routes: HashMap<String, Vec<Route>>,
}

impl Flow {
    /// Validate a definition and build its routing table.
    ///
    /// Every problem found is reported in a single `Structural` error.
    pub fn compile(definition: FlowDefinition) -> Result<Self> {
        let mut problems = Vec::new();

        let mut index = HashMap::new();
        for (i, node) in definition.nodes.iter().enumerate() {
            if node.name.trim().is_empty() {
                problems.push(format!("node #{i} has an empty name"));
                continue;
            }
            if node.name == START || node.name == END {
                problems.push(format!("node name '{}' is reserved", node.name));
                continue;
            }
            if index.insert(node.name.clone(), i).is_some() {
                problems.push(format!("duplicate node name '{}'", node.name));
            }
        }

        for node in &definition.nodes {
            check_node(node, &mut problems);
        }

        let mut routes: HashMap<String, Vec<Route>> = HashMap::new();
        for edge in &definition.edges {
            if edge.from == END {
                problems.push("END cannot have outgoing edges".to_string());
                continue;
            }
            if edge.from != START && !index.contains_key(&edge.from) {
                problems.push(format!("edge from unknown node '{}'", edge.from));
                continue;
            }
            match (&edge.to, edge.conditions.is_empty()) {
                (Some(_), false) => {
                    problems.push(format!(
                        "edge from '{}' sets both `to` and `conditions`",
                        edge.from
                    ));
                    continue;
                }
                (None, true) => {
                    problems.push(format!("edge from '{}' has no target", edge.from));
                    continue;
                }
                _ => {}
            }
            for target in edge.targets() {
                if target == START {
                    problems.push(format!("edge from '{}' leads back to START", edge.from));
                } else if target != END && !index.contains_key(target) {
                    problems.push(format!(
                        "edge from '{}' leads to unknown node '{target}'",
                        edge.from
                    ));
                }
            }

            let list = routes.entry(edge.from.clone()).or_default();
            if matches!(list.last(), Some(Route::Always { .. })) {
                problems.push(format!(
                    "edge from '{}' is unreachable: an unconditional edge precedes it",
                    edge.from
                ));
            }
            if let Some(to) = &edge.to {
                list.push(Route::Always { to: to.clone() });
            }
            for target in &edge.conditions {
                match Condition::parse(&target.condition) {
                    Ok(condition) => list.push(Route::When {
                        condition,
                        to: target.to.clone(),
                    }),
                    Err(e) => problems.push(format!("edge from '{}': {e}", edge.from)),
                }
            }
        }

        if !routes.contains_key(START) {
            problems.push("START has no outgoing edge".to_string());
        }
        for node in &definition.nodes {
            if !routes.contains_key(&node.name) {
                problems.push(format!("node '{}' has no outgoing edge", node.name));
            }
        }

        // Reachability, breadth-first from START.
        let mut seen: HashSet<&str> = HashSet::from([START]);
        let mut queue: VecDeque<&str> = VecDeque::from([START]);
        while let Some(current) = queue.pop_front() {
            for route in routes.get(current).into_iter().flatten() {
                let to = match route {
                    Route::Always { to } | Route::When { to, .. } => to.as_str(),
                };
                if seen.insert(to) {
                    queue.push_back(to);
                }
            }
        }
        for node in &definition.nodes {
            if !seen.contains(node.name.as_str()) {
                problems.push(format!("node '{}' is unreachable from START", node.name));
            }
        }

        if !problems.is_empty() {
            return Err(FlowError::Structural(problems.join("; ")));
        }

        debug!(
            nodes = definition.nodes.len(),
            edges = definition.edges.len(),
            "Flow compiled"
        );

        Ok(Self {
            description: definition.description,
            nodes: definition.nodes,
            index,
            routes,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn routes(&self, from: &str) -> &[Route] {
        self.routes.get(from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pick the next node: the first unconditional route or true condition.
    pub fn select_route(&self, from: &str, vars: &dyn VarLookup) -> Result<&str> {
        let mut tried = Vec::new();
        for route in self.routes(from) {
            match route {
                Route::Always { to } => return Ok(to),
                Route::When { condition, to } => {
                    if condition.evaluate(vars)? {
                        debug!(from, to = %to, condition = condition.source(), "Edge condition matched");
                        return Ok(to);
                    }
                    tried.push(condition.source().to_string());
                }
            }
        }
        Err(FlowError::NoMatchingEdge {
            node: from.to_string(),
            conditions: tried,
        })
    }

    /// Every tool a run of this flow may call.
    pub fn tool_names(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Tool(config) => {
                    names.insert(config.tool.as_str());
                }
                NodeKind::Llm(config) => names.extend(config.tools.iter().map(String::as_str)),
                _ => {}
            }
        }
        names
    }
}

fn check_node(node: &Node, problems: &mut Vec<String>) {
    let name = &node.name;

    match (node.limit, &node.limit_counter_field) {
        (Some(0), _) => problems.push(format!("node '{name}': limit must be at least 1")),
        (Some(_), None) | (None, Some(_)) => problems.push(format!(
            "node '{name}': `limit` and `limit_counter_field` must be set together"
        )),
        _ => {}
    }

    let mut seen_fields = HashSet::new();
    for field in &node.output {
        if !seen_fields.insert(field.name.as_str()) {
            problems.push(format!("node '{name}': duplicate output field '{}'", field.name));
        }
    }

    match &node.kind {
        NodeKind::Input(config) => {
            if node.output.is_empty() {
                problems.push(format!("input node '{name}' must declare an output field"));
            }
            if let Some(InputOptions::List(options)) = &config.options {
                if options.is_empty() {
                    problems.push(format!("input node '{name}' has an empty options list"));
                }
            }
        }
        NodeKind::Llm(config) => {
            if config.max_steps == Some(0) {
                problems.push(format!("node '{name}': max_steps must be at least 1"));
            }
            for (field, tool) in &config.raw_tool_output {
                if node.field(field).is_none() {
                    problems.push(format!(
                        "node '{name}': raw_tool_output field '{field}' is not a declared output"
                    ));
                }
                if !config.tools.contains(tool) {
                    problems.push(format!(
                        "node '{name}': raw_tool_output tool '{tool}' is not in the tool whitelist"
                    ));
                }
            }
        }
        NodeKind::Tool(config) => {
            if config.tool.trim().is_empty() {
                problems.push(format!("tool node '{name}' names no tool"));
            }
        }
        NodeKind::Output(_) => {}
        NodeKind::UpdateState(config) => match config.action {
            Some(action) => {
                if node.output.len() != 1 {
                    problems.push(format!(
                        "node '{name}': {action:?} requires exactly one output field, found {}",
                        node.output.len()
                    ));
                }
                if action != UpdateAction::Increment
                    && config.source.is_none()
                    && config.value.is_none()
                {
                    problems.push(format!("node '{name}': {action:?} needs a `source` or a `value`"));
                }
                if action == UpdateAction::Increment
                    && config.value.as_ref().is_some_and(|v| !v.is_number())
                {
                    problems.push(format!("node '{name}': increment `value` must be a number"));
                }
            }
            None => {
                if config.values.is_empty() {
                    problems.push(format!("node '{name}': update_state has nothing to assign"));
                }
            }
        },
    }

    if let Some(foreach) = &node.foreach {
        if !matches!(node.kind, NodeKind::Llm(_) | NodeKind::Tool(_)) {
            problems.push(format!(
                "node '{name}': foreach is only supported on llm and tool nodes"
            ));
        }
        if node.requires_approval() {
            problems.push(format!(
                "node '{name}': foreach cannot be combined with require_approval"
            ));
        }
        if foreach.max_workers == Some(0) {
            problems.push(format!("node '{name}': foreach.max_workers must be at least 1"));
        }
        if foreach.items_key().is_empty() || foreach.output.trim().is_empty() {
            problems.push(format!("node '{name}': foreach needs `items` and `output`"));
        }
    }
}
