use serde::{Deserialize, Serialize};

/// An edge leaving a node: either a single unconditional target or an
/// ordered list of conditional targets where the first true condition wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source node name (or `START`).
    pub from: String,
    /// Unconditional target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Conditional targets, tried in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionalTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalTarget {
    pub condition: String,
    pub to: String,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Some(to.into()),
            conditions: vec![],
        }
    }

    /// Start a conditional edge; add targets with [`Edge::when`].
    pub fn branch(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: None,
            conditions: vec![],
        }
    }

    /// Append a conditional target.
    pub fn when(mut self, condition: impl Into<String>, to: impl Into<String>) -> Self {
        self.conditions.push(ConditionalTarget {
            condition: condition.into(),
            to: to.into(),
        });
        self
    }

    /// Every target this edge can lead to.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.to
            .as_deref()
            .into_iter()
            .chain(self.conditions.iter().map(|c| c.to.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_builders() {
        let e = Edge::always("a", "b");
        assert_eq!(e.from, "a");
        assert_eq!(e.to.as_deref(), Some("b"));
        assert!(e.conditions.is_empty());

        let e = Edge::branch("a").when("x > 1", "b").when("true", "c");
        assert!(e.to.is_none());
        assert_eq!(e.targets().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn test_deserialize_conditional() {
        let edge: Edge = serde_json::from_value(serde_json::json!({
            "from": "review",
            "conditions": [
                {"condition": "approved", "to": "END"},
                {"condition": "true", "to": "draft"}
            ]
        }))
        .unwrap();
        assert_eq!(edge.conditions.len(), 2);
        assert_eq!(edge.conditions[1].to, "draft");
    }
}
