use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChainError, Result};
use crate::graph;
use crate::script::{CompareOp, Expr};
use crate::Record;

/// Predicado distribuible sobre un elemento (vértice o arista).
///
/// Viaja dentro de la configuración del job como JSON etiquetado: nunca se
/// serializa código, sólo la variante y sus parámetros (o el texto de la
/// expresión en `Scripted`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Constant { value: bool },
    HasLabel { label: String },
    HasProperty { key: String },
    PropertyEquals { key: String, value: Value },
    PropertyCompare { key: String, op: CompareOp, value: Value },
    Scripted { source: String },
}

impl Predicate {
    pub fn scripted(source: impl Into<String>) -> Self {
        Predicate::Scripted {
            source: source.into(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        serde_json::from_str(encoded)
            .map_err(|e| ChainError::Predicate(format!("predicado ilegible: {e}")))
    }

    /// Deja el predicado listo para evaluar (parsea la expresión una sola vez).
    pub fn compile(&self) -> Result<CompiledPredicate> {
        let compiled = match self {
            Predicate::Scripted { source } => {
                let expr = Expr::parse(source)
                    .map_err(|e| ChainError::Predicate(format!("'{source}': {e}")))?;
                CompiledPredicate::Script(expr)
            }
            other => CompiledPredicate::Builtin(other.clone()),
        };
        Ok(compiled)
    }
}

#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    Builtin(Predicate),
    Script(Expr),
}

impl CompiledPredicate {
    pub fn evaluate(&self, element: &Record) -> bool {
        match self {
            CompiledPredicate::Script(expr) => expr.test(element),
            CompiledPredicate::Builtin(p) => match p {
                Predicate::Constant { value } => *value,
                Predicate::HasLabel { label } => {
                    element.get("label").and_then(|l| l.as_str()) == Some(label.as_str())
                }
                Predicate::HasProperty { key } => property(element, key).is_some(),
                Predicate::PropertyEquals { key, value } => property(element, key)
                    .map(|v| CompareOp::Eq.apply(v, value))
                    .unwrap_or(false),
                Predicate::PropertyCompare { key, op, value } => property(element, key)
                    .map(|v| op.apply(v, value))
                    .unwrap_or(false),
                Predicate::Scripted { .. } => false,
            },
        }
    }
}

fn property<'a>(element: &'a Record, key: &str) -> Option<&'a Value> {
    element
        .get("properties")
        .and_then(|props| graph::field(props, key))
}
