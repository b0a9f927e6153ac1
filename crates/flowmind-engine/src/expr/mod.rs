//! Condition language for conditional edges.
//!
//! The grammar covers literals, variable paths, comparisons,
//! membership (`in` / `not in`), boolean connectives and `len(...)`.
//! Conditions are parsed once when a flow is compiled and evaluated against
//! a read-only view of run state; evaluation never mutates anything.

mod eval;
mod lexer;
mod parser;

use serde_json::Value;

use flowmind_core::error::{FlowError, Result};

use crate::state::VarLookup;

pub use eval::{truthy, values_equal};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

/// One step of a variable path: `.field`, `["field"]` or `[index]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(i64),
}

/// Parsed condition AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path { root: String, segments: Vec<Segment> },
    List(Vec<Expr>),
    Len(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// A compiled edge condition: the original text plus its AST.
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse a condition string. Unsupported syntax is an error.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = lexer::tokenize(source).map_err(|message| FlowError::Expression {
            expr: source.to_string(),
            message,
        })?;
        let expr = parser::Parser::new(tokens)
            .parse()
            .map_err(|message| FlowError::Expression {
                expr: source.to_string(),
                message,
            })?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate against a read-only view of state; the result's truthiness decides.
    pub fn evaluate(&self, vars: &dyn VarLookup) -> Result<bool> {
        let value = eval::Evaluator::new(&self.source, vars).eval(&self.expr)?;
        Ok(truthy(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use serde_json::json;

    fn state(value: Value) -> StateStore {
        StateStore::from_map(
            value
                .as_object()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn check(src: &str, vars: &StateStore) -> bool {
        Condition::parse(src).unwrap().evaluate(vars).unwrap()
    }

    #[test]
    fn comparisons() {
        let vars = state(json!({"a": 2, "score": 7.5, "name": "ada"}));
        assert!(check("a > 1", &vars));
        assert!(!check("a >= 3", &vars));
        assert!(check("score <= 7.5", &vars));
        assert!(check("a == 2.0", &vars));
        assert!(check("name == 'ada'", &vars));
        assert!(check("name != \"bob\"", &vars));
        assert!(check("name < 'b'", &vars));
    }

    #[test]
    fn boolean_logic_and_truthiness() {
        let vars = state(json!({"done": false, "items": [], "title": "x", "n": 0}));
        assert!(check("not done", &vars));
        assert!(check("!items", &vars));
        assert!(check("title and not n", &vars));
        assert!(check("done or title", &vars));
        assert!(check("(done || n) == false", &vars));
        assert!(check("true", &vars));
    }

    #[test]
    fn negative_literals_follow_keywords() {
        let vars = state(json!({"a": 2, "b": 0, "x": 1, "y": 5}));
        assert!(check("a == 1 or -1 < b", &vars));
        assert!(check("x in [1] and -2 < y", &vars));
        assert!(!check("not -1", &vars));
    }

    #[test]
    fn membership() {
        let vars = state(json!({
            "tags": ["rust", "async"],
            "text": "hello world",
            "user": {"role": "admin"}
        }));
        assert!(check("'rust' in tags", &vars));
        assert!(check("'go' not in tags", &vars));
        assert!(check("'world' in text", &vars));
        assert!(check("'role' in user", &vars));
        assert!(check("user.role in ['admin', 'owner']", &vars));
    }

    #[test]
    fn len_function() {
        let vars = state(json!({"items": [1, 2, 3], "name": "héllo", "m": {"a": 1}}));
        assert!(check("len(items) == 3", &vars));
        assert!(check("len(name) == 5", &vars));
        assert!(check("len(m) > 0", &vars));
        assert!(check("len([]) == 0", &vars));
    }

    #[test]
    fn paths_and_indexes() {
        let vars = state(json!({"rows": [{"id": 1}, {"id": 2}]}));
        assert!(check("rows[1].id == 2", &vars));
        assert!(check("rows[-1]['id'] == 2", &vars));
    }

    #[test]
    fn missing_variable_is_unknown_variable() {
        let vars = StateStore::new();
        let err = Condition::parse("x > 1").unwrap().evaluate(&vars).unwrap_err();
        assert!(matches!(err, FlowError::UnknownVariable(name) if name == "x"));
    }

    #[test]
    fn type_errors_mention_the_expression() {
        let vars = state(json!({"a": "text"}));
        let err = Condition::parse("a > 1").unwrap().evaluate(&vars).unwrap_err();
        match err {
            FlowError::Expression { expr, message } => {
                assert_eq!(expr, "a > 1");
                assert!(message.contains("cannot compare"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_errors_are_expression_errors() {
        let err = Condition::parse("os.system('rm')").unwrap_err();
        assert!(matches!(err, FlowError::Expression { .. }));
        assert!(Condition::parse("x = 1").is_err());
    }

    #[test]
    fn evaluation_does_not_mutate_state() {
        let vars = state(json!({"a": 1}));
        let before = vars.data().clone();
        assert!(check("a == 1 and len([a]) == 1", &vars));
        assert_eq!(vars.data(), &before);
    }
}
