use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Activa el seguimiento de caminos en toda la cadena (caro en espacio y tiempo).
pub const PATH_ENABLED: &str = "stagechain.path-enabled";
/// Ubicación explícita del paquete distribuible.
pub const JOB_PACKAGE: &str = "stagechain.job.package";
/// Número de tareas de reduce por job.
pub const REDUCES: &str = "mapreduce.job.reduces";
pub const MAP_OUTPUT_COMPRESS: &str = "mapreduce.map.output.compress";
pub const MAP_OUTPUT_COMPRESS_CODEC: &str = "mapreduce.map.output.compress.codec";

pub const DEFAULT_COMPRESS_CODEC: &str = "deflate";
pub const DEFAULT_REDUCES: usize = 1;

const DASH: char = '-';

/// Mapa de opciones nombre → valor.
///
/// Un job físico lleva una sola `Configuration`; las opciones propias de cada
/// etapa fusionada viajan con el sufijo `-<índice>` (ver [`Configuration::stage_view`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, value.to_string());
    }

    /// Sólo escribe la clave si nadie la configuró antes.
    pub fn set_if_absent(&mut self, key: &str, value: impl Into<String>) {
        if !self.entries.contains_key(key) {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .and_then(|v| v.trim().parse::<bool>().ok())
            .unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(default)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copia todas las entradas de `other` (pisando las existentes).
    pub fn merge(&mut self, other: &Configuration) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    /// Copia `other` agregando el sufijo `-<step>` a cada clave.
    pub fn merge_scoped(&mut self, other: &Configuration, step: usize) {
        for (k, v) in other.iter() {
            self.set(format!("{k}{DASH}{step}"), v);
        }
    }

    /// Vista local de la etapa `step`:
    /// - `k-<step>` se expone como `k` (y gana sobre un `k` global),
    /// - claves sin sufijo numérico se exponen tal cual,
    /// - claves con sufijo de otra etapa quedan ocultas.
    pub fn stage_view(&self, step: usize) -> Configuration {
        let mut globals = Configuration::new();
        let mut scoped = Configuration::new();

        for (key, value) in self.iter() {
            match split_step_suffix(key) {
                Some((base, n)) if n == step => scoped.set(base, value),
                Some(_) => {}
                None => globals.set(key, value),
            }
        }

        globals.merge(&scoped);
        globals
    }
}

impl FromIterator<(String, String)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// `"x-12"` → `Some(("x", 12))`; `"x"` o `"x-a"` → `None`.
fn split_step_suffix(key: &str) -> Option<(&str, usize)> {
    let (base, suffix) = key.rsplit_once(DASH)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse::<usize>().ok().map(|n| (base, n))
}
