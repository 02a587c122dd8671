use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::conf::Configuration;
use crate::Record;

/// Nombre de la salida secundaria (agregados / diagnósticos).
pub const SIDE_EFFECT: &str = "sideeffect";
/// Nombre de la salida de registros de grafo.
pub const GRAPH: &str = "graph";

/// Contadores de un job: grupo → nombre → valor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Counters(BTreeMap<String, BTreeMap<String, u64>>);

impl Counters {
    pub fn increment(&mut self, group: &str, name: &str, amount: u64) {
        *self
            .0
            .entry(group.to_string())
            .or_default()
            .entry(name.to_string())
            .or_insert(0) += amount;
    }

    pub fn get(&self, group: &str, name: &str) -> u64 {
        self.0
            .get(group)
            .and_then(|g| g.get(name))
            .copied()
            .unwrap_or(0)
    }

    pub fn merge(&mut self, other: &Counters) {
        for (group, names) in &other.0 {
            for (name, value) in names {
                self.increment(group, name, *value);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Recorre (grupo, nombre, valor) en orden.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, u64)> {
        self.0.iter().flat_map(|(group, names)| {
            names
                .iter()
                .map(move |(name, value)| (group.as_str(), name.as_str(), *value))
        })
    }
}

/// Lo que una etapa ve de la tarea que la ejecuta.
///
/// Tanto la tarea real como el relay de fusión implementan este trait, así
/// una etapa no sabe si corre sola o fusionada con otras.
pub trait StageContext {
    fn configuration(&self) -> &Configuration;

    /// Emisión principal (hacia la salida del job o hacia el shuffle).
    fn write(&mut self, key: Record, value: Record) -> anyhow::Result<()>;

    /// Emisión a una salida con nombre (`graph`, `sideeffect`).
    fn write_named(&mut self, output: &str, key: Record, value: Record) -> anyhow::Result<()>;

    fn increment_counter(&mut self, group: &str, name: &str, amount: u64);

    fn set_status(&mut self, status: &str);

    fn progress(&mut self);
}

/// Lado map de una etapa.
///
/// Para poder fusionarse, un mapper emite 0 o 1 registros por entrada.
pub trait Mapper: Send {
    fn setup(&mut self, _ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn map(&mut self, key: Record, value: Record, ctx: &mut dyn StageContext) -> anyhow::Result<()>;

    fn cleanup(&mut self, _ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lado reduce (o combine) de una etapa map-reduce.
pub trait Reducer: Send {
    fn setup(&mut self, _ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn reduce(
        &mut self,
        key: Record,
        values: Vec<Record>,
        ctx: &mut dyn StageContext,
    ) -> anyhow::Result<()>;

    fn cleanup(&mut self, _ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Contexto en memoria de una tarea física: junta lo emitido para que el
/// motor lo escriba a disco (o lo mande al shuffle) al terminar.
#[derive(Debug, Default)]
pub struct TaskContext {
    conf: Configuration,
    pub emitted: Vec<(Record, Record)>,
    pub named: BTreeMap<String, Vec<(Record, Record)>>,
    pub counters: Counters,
    pub status: String,
    pub progress_ticks: u64,
}

impl TaskContext {
    pub fn new(conf: Configuration) -> Self {
        Self {
            conf,
            ..Default::default()
        }
    }

    pub fn take_emitted(&mut self) -> Vec<(Record, Record)> {
        std::mem::take(&mut self.emitted)
    }

    pub fn take_named(&mut self) -> BTreeMap<String, Vec<(Record, Record)>> {
        std::mem::take(&mut self.named)
    }
}

impl StageContext for TaskContext {
    fn configuration(&self) -> &Configuration {
        &self.conf
    }

    fn write(&mut self, key: Record, value: Record) -> anyhow::Result<()> {
        self.emitted.push((key, value));
        Ok(())
    }

    fn write_named(&mut self, output: &str, key: Record, value: Record) -> anyhow::Result<()> {
        self.named
            .entry(output.to_string())
            .or_default()
            .push((key, value));
        Ok(())
    }

    fn increment_counter(&mut self, group: &str, name: &str, amount: u64) {
        self.counters.increment(group, name, amount);
    }

    fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
    }

    fn progress(&mut self) {
        self.progress_ticks += 1;
    }
}
