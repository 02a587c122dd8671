//! Expresiones booleanas sobre un elemento del grafo.
//!
//! Gramática:
//! ```text
//! expr    := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | compare
//! compare := operand (("==" | "!=" | "<" | "<=" | ">" | ">=") operand)?
//! operand := literal | path | "(" expr ")"
//! literal := número | "texto" | 'texto' | true | false | null
//! path    := ident ("." ident)*
//! ```
//! La gramática vive en `script.pest`.
//! Un `path` se resuelve contra el elemento (`label`, `properties.age`).
//! No hay llamadas ni asignaciones: evaluar una expresión no tiene efectos.

use pest::{iterators::Pair, Parser};
use pest_derive::Parser;
use serde_json::{json, Value};
use std::cmp::Ordering;

use crate::graph;
use crate::stage::natural_cmp;
use crate::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl CompareOp {
    /// Igualdad estricta; los órdenes sólo entre números o entre strings.
    pub fn apply(&self, left: &Value, right: &Value) -> bool {
        match self {
            CompareOp::Eq => values_equal(left, right),
            CompareOp::Ne => !values_equal(left, right),
            _ => {
                let comparable = matches!(
                    (left, right),
                    (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_))
                );
                if !comparable {
                    return false;
                }
                let ord = natural_cmp(left, right);
                match self {
                    CompareOp::Lt => ord == Ordering::Less,
                    CompareOp::Le => ord != Ordering::Greater,
                    CompareOp::Gt => ord == Ordering::Greater,
                    CompareOp::Ge => ord != Ordering::Less,
                    CompareOp::Eq | CompareOp::Ne => unreachable!(),
                }
            }
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        // 1 == 1.0
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

#[derive(Parser)]
#[grammar = "script.pest"]
struct ScriptParser;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Expr, String> {
        let mut pairs = ScriptParser::parse(Rule::expression, source).map_err(|e| e.to_string())?;
        let root = pairs
            .next()
            .and_then(|p| p.into_inner().next())
            .ok_or_else(|| "expresión vacía".to_string())?;
        build(root)
    }

    /// Evalúa la expresión como booleano.
    pub fn test(&self, element: &Record) -> bool {
        truthy(&self.eval(element))
    }

    fn eval(&self, element: &Record) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(path) => graph::field(element, path).cloned().unwrap_or(Value::Null),
            Expr::Not(inner) => json!(!inner.test(element)),
            Expr::And(l, r) => json!(l.test(element) && r.test(element)),
            Expr::Or(l, r) => json!(l.test(element) || r.test(element)),
            Expr::Compare(l, op, r) => json!(op.apply(&l.eval(element), &r.eval(element))),
        }
    }
}

/* ---------------- árbol de pest → Expr ---------------- */

fn build(pair: Pair<'_, Rule>) -> Result<Expr, String> {
    match pair.as_rule() {
        Rule::or_expr => fold_binary(pair, Expr::Or),
        Rule::and_expr => fold_binary(pair, Expr::And),
        Rule::unary => {
            let mut negations = 0;
            let mut operand = None;
            for inner in pair.into_inner() {
                match inner.as_rule() {
                    Rule::not_op => negations += 1,
                    _ => operand = Some(build(inner)?),
                }
            }
            let mut expr = operand.ok_or_else(|| "falta el operando de '!'".to_string())?;
            for _ in 0..negations {
                expr = Expr::Not(Box::new(expr));
            }
            Ok(expr)
        }
        Rule::compare => {
            let mut inner = pair.into_inner();
            let left = inner
                .next()
                .ok_or_else(|| "comparación vacía".to_string())
                .and_then(build)?;
            match (inner.next(), inner.next()) {
                (Some(op), Some(right)) => Ok(Expr::Compare(
                    Box::new(left),
                    compare_op(op.as_str())?,
                    Box::new(build(right)?),
                )),
                _ => Ok(left),
            }
        }
        Rule::number => {
            let text = pair.as_str();
            let n = text
                .parse::<f64>()
                .map_err(|_| format!("número inválido: {text}"))?;
            Ok(Expr::Literal(number(n)))
        }
        Rule::string => {
            let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
            Ok(Expr::Literal(Value::String(unescape(raw))))
        }
        Rule::boolean => Ok(Expr::Literal(Value::Bool(pair.as_str() == "true"))),
        Rule::null => Ok(Expr::Literal(Value::Null)),
        Rule::path => Ok(Expr::Path(pair.as_str().to_string())),
        other => Err(format!("regla inesperada {other:?}")),
    }
}

/// `a op b op c` asociando a izquierda.
fn fold_binary(
    pair: Pair<'_, Rule>,
    make: fn(Box<Expr>, Box<Expr>) -> Expr,
) -> Result<Expr, String> {
    let mut inner = pair.into_inner();
    let mut left = inner
        .next()
        .ok_or_else(|| "expresión incompleta".to_string())
        .and_then(build)?;
    for next in inner {
        left = make(Box::new(left), Box::new(build(next)?));
    }
    Ok(left)
}

fn compare_op(text: &str) -> Result<CompareOp, String> {
    match text {
        "==" => Ok(CompareOp::Eq),
        "!=" => Ok(CompareOp::Ne),
        "<" => Ok(CompareOp::Lt),
        "<=" => Ok(CompareOp::Le),
        ">" => Ok(CompareOp::Gt),
        ">=" => Ok(CompareOp::Ge),
        other => Err(format!("operador desconocido '{other}'")),
    }
}

/// `\x` queda como `x`.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}
