use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::conf::Configuration;
use crate::error::{ChainError, Result};
use crate::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    MapOnly,
    MapReduce,
}

/// Etiqueta de tipo para claves/valores. El núcleo sólo la transporta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Null,
    Text,
    Long,
    Double,
    Boolean,
    Vertex,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvTypes {
    pub key: ValueType,
    pub value: ValueType,
}

impl KvTypes {
    pub fn new(key: ValueType, value: ValueType) -> Self {
        Self { key, value }
    }

    /// Forma de los registros de grafo: clave nula, valor vértice.
    pub fn graph() -> Self {
        Self::new(ValueType::Null, ValueType::Vertex)
    }
}

/// Orden total sobre las claves del shuffle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyComparator {
    #[default]
    Natural,
    Reverse,
    /// Compara como número (también strings numéricos); si no, orden natural.
    Numeric,
}

impl KeyComparator {
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        match self {
            KeyComparator::Natural => natural_cmp(a, b),
            KeyComparator::Reverse => natural_cmp(b, a),
            KeyComparator::Numeric => match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => natural_cmp(a, b),
            },
        }
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Orden natural entre valores JSON: primero por tipo, luego por contenido.
pub fn natural_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i.cmp(&j),
            _ => x
                .as_f64()
                .unwrap_or(f64::NAN)
                .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = natural_cmp(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Una transformación pedida por el usuario (map-only o map+reduce).
///
/// Las funciones son referencias por nombre que el motor resuelve con
/// [`crate::registry::StageRegistry`]; `config` es visible sólo para esta etapa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: String,
    pub kind: StageKind,

    /// Nombre del mapper, se serializa como "map".
    #[serde(rename = "map")]
    pub map_fn: String,
    #[serde(rename = "combine", default, skip_serializing_if = "Option::is_none")]
    pub combine_fn: Option<String>,
    #[serde(rename = "reduce", default, skip_serializing_if = "Option::is_none")]
    pub reduce_fn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_comparator: Option<KeyComparator>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_output: Option<KvTypes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_output: Option<KvTypes>,

    #[serde(default)]
    pub config: Configuration,
}

impl StageDescriptor {
    pub fn map(name: impl Into<String>, map_fn: impl Into<String>, output: KvTypes) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::MapOnly,
            map_fn: map_fn.into(),
            combine_fn: None,
            reduce_fn: None,
            sort_comparator: None,
            map_output: Some(output),
            reduce_output: None,
            config: Configuration::new(),
        }
    }

    pub fn map_reduce(
        name: impl Into<String>,
        map_fn: impl Into<String>,
        reduce_fn: impl Into<String>,
        map_output: KvTypes,
        reduce_output: KvTypes,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::MapReduce,
            map_fn: map_fn.into(),
            combine_fn: None,
            reduce_fn: Some(reduce_fn.into()),
            sort_comparator: None,
            map_output: Some(map_output),
            reduce_output: Some(reduce_output),
            config: Configuration::new(),
        }
    }

    pub fn with_combiner(mut self, combine_fn: impl Into<String>) -> Self {
        self.combine_fn = Some(combine_fn.into());
        self
    }

    pub fn with_comparator(mut self, comparator: KeyComparator) -> Self {
        self.sort_comparator = Some(comparator);
        self
    }

    pub fn with_config(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn is_map_reduce(&self) -> bool {
        self.kind == StageKind::MapReduce
    }

    /// Reglas de forma de un descriptor; cualquier violación es un error de compilación.
    pub fn validate(&self) -> Result<()> {
        if self.map_fn.trim().is_empty() {
            return Err(ChainError::Compilation(format!(
                "la etapa '{}' no tiene función de map",
                self.name
            )));
        }

        match self.kind {
            StageKind::MapOnly => {
                if self.combine_fn.is_some()
                    || self.reduce_fn.is_some()
                    || self.sort_comparator.is_some()
                {
                    return Err(ChainError::Compilation(format!(
                        "la etapa map-only '{}' declara combine/reduce/comparador",
                        self.name
                    )));
                }
            }
            StageKind::MapReduce => {
                if self.reduce_fn.is_none() {
                    return Err(ChainError::Compilation(format!(
                        "la etapa map-reduce '{}' no tiene función de reduce",
                        self.name
                    )));
                }
                if self.map_output.is_none() || self.reduce_output.is_none() {
                    return Err(ChainError::Compilation(format!(
                        "la etapa map-reduce '{}' no declara tipos de clave/valor",
                        self.name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn natural_cmp_ordena_por_tipo_y_contenido() {
        assert_eq!(natural_cmp(&json!(null), &json!(1)), Ordering::Less);
        assert_eq!(natural_cmp(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(natural_cmp(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(natural_cmp(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(natural_cmp(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
    }

    #[test]
    fn comparadores_reverse_y_numeric() {
        assert_eq!(
            KeyComparator::Reverse.compare(&json!("a"), &json!("b")),
            Ordering::Greater
        );
        // "10" vs "9": lexicográficamente menor, numéricamente mayor
        assert_eq!(
            KeyComparator::Natural.compare(&json!("10"), &json!("9")),
            Ordering::Less
        );
        assert_eq!(
            KeyComparator::Numeric.compare(&json!("10"), &json!("9")),
            Ordering::Greater
        );
    }

    #[test]
    fn validate_exige_tipos_en_map_reduce() {
        let mut stage = StageDescriptor::map_reduce(
            "count",
            "group-count",
            "sum",
            KvTypes::new(ValueType::Text, ValueType::Long),
            KvTypes::new(ValueType::Text, ValueType::Long),
        );
        assert!(stage.validate().is_ok());

        stage.reduce_output = None;
        assert!(matches!(stage.validate(), Err(ChainError::Compilation(_))));
    }

    #[test]
    fn validate_rechaza_combiner_en_map_only() {
        let stage = StageDescriptor::map("f", "filter", KvTypes::graph()).with_combiner("sum");
        assert!(matches!(stage.validate(), Err(ChainError::Compilation(_))));
    }

    #[test]
    fn descriptor_se_lee_desde_json() {
        let stage: StageDescriptor = serde_json::from_value(json!({
            "name": "contar",
            "kind": "MAP_REDUCE",
            "map": "group-count",
            "combine": "sum",
            "reduce": "sum-side-effect",
            "sort_comparator": "reverse",
            "map_output": { "key": "text", "value": "long" },
            "reduce_output": { "key": "text", "value": "long" },
            "config": { "group-count.property": "label" }
        }))
        .unwrap();

        assert!(stage.is_map_reduce());
        assert_eq!(stage.combine_fn.as_deref(), Some("sum"));
        assert_eq!(stage.sort_comparator, Some(KeyComparator::Reverse));
        assert_eq!(stage.config.get("group-count.property"), Some("label"));
    }
}
