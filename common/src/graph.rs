//! Acceso mínimo a registros de grafo.
//!
//! Un vértice es un objeto JSON:
//! `{"id": .., "label": .., "properties": {..}, "paths": .., "out_edges": [..], "in_edges": [..]}`.
//! Las aristas tienen la misma forma (sin listas de aristas). `paths` es un
//! contador cuando el seguimiento de caminos está apagado, o la lista de
//! caminos completos cuando está prendido.

use serde_json::{json, Value};

use crate::Record;

pub const PATHS: &str = "paths";
pub const OUT_EDGES: &str = "out_edges";
pub const IN_EDGES: &str = "in_edges";

pub fn path_count(element: &Record) -> u64 {
    match element.get(PATHS) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::Array(paths)) => paths.len() as u64,
        _ => 0,
    }
}

pub fn has_paths(element: &Record) -> bool {
    path_count(element) > 0
}

/// Deja al elemento sin caminos (sigue en el stream, pero "pathless").
pub fn clear_paths(element: &mut Record) {
    let Some(obj) = element.as_object_mut() else {
        return;
    };
    let cleared = match obj.get(PATHS) {
        Some(Value::Array(_)) => json!([]),
        _ => json!(0),
    };
    obj.insert(PATHS.to_string(), cleared);
}

/// Arranca el recorrido en el elemento: un camino `[id]` o un contador en 1.
pub fn start_paths(element: &mut Record, track_paths: bool) {
    let id = element.get("id").cloned().unwrap_or(Value::Null);
    if let Some(obj) = element.as_object_mut() {
        let paths = if track_paths { json!([[id]]) } else { json!(1) };
        obj.insert(PATHS.to_string(), paths);
    }
}

/// Aristas en ambas direcciones.
pub fn edges_mut(vertex: &mut Record) -> impl Iterator<Item = &mut Record> {
    let (out_edges, in_edges) = match vertex.as_object_mut() {
        Some(obj) => {
            let mut out_edges = None;
            let mut in_edges = None;
            for (k, v) in obj.iter_mut() {
                match k.as_str() {
                    OUT_EDGES => out_edges = v.as_array_mut(),
                    IN_EDGES => in_edges = v.as_array_mut(),
                    _ => {}
                }
            }
            (out_edges, in_edges)
        }
        None => (None, None),
    };

    out_edges
        .into_iter()
        .flat_map(|v| v.iter_mut())
        .chain(in_edges.into_iter().flat_map(|v| v.iter_mut()))
}

/// Busca un campo por ruta con puntos, ej: `properties.age`.
pub fn field<'a>(element: &'a Record, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(element, |cur, part| cur.get(part))
}
