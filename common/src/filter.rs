//! Filtro por predicado que sólo quita estado de caminos.
//!
//! El registro siempre se reemite: el filtro nunca achica el stream, así que
//! cumple la regla de "0 o 1 emisión por entrada" que necesita la fusión.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::conf::Configuration;
use crate::graph;
use crate::predicate::{CompiledPredicate, Predicate};
use crate::stage::{KvTypes, StageDescriptor};
use crate::task::{Mapper, StageContext};
use crate::Record;

pub const ELEMENT: &str = "filter.element";
pub const PREDICATE: &str = "filter.predicate";

pub const COUNTER_GROUP: &str = "filter";
pub const VERTICES_FILTERED: &str = "VERTICES_FILTERED";
pub const EDGES_FILTERED: &str = "EDGES_FILTERED";

pub const MAPPER_NAME: &str = "filter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Vertex,
    Edge,
}

impl ElementKind {
    fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Vertex => "vertex",
            ElementKind::Edge => "edge",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "vertex" => Some(ElementKind::Vertex),
            "edge" => Some(ElementKind::Edge),
            _ => None,
        }
    }
}

/// Configuración de la etapa (queda visible sólo para ella).
pub fn create_configuration(kind: ElementKind, predicate: &Predicate) -> crate::error::Result<Configuration> {
    let mut conf = Configuration::new();
    conf.set(ELEMENT, kind.as_str());
    conf.set(PREDICATE, predicate.encode()?);
    Ok(conf)
}

/// Descriptor map-only listo para agregar a una cadena.
pub fn stage(
    name: impl Into<String>,
    kind: ElementKind,
    predicate: &Predicate,
) -> crate::error::Result<StageDescriptor> {
    Ok(StageDescriptor::map(name, MAPPER_NAME, KvTypes::graph())
        .with_config(create_configuration(kind, predicate)?))
}

#[derive(Default)]
pub struct FilterMap {
    kind: Option<ElementKind>,
    predicate: Option<CompiledPredicate>,
}

impl Mapper for FilterMap {
    fn setup(&mut self, ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        let conf = ctx.configuration();

        let kind = conf
            .get(ELEMENT)
            .ok_or_else(|| anyhow!("falta la opción {ELEMENT}"))?;
        self.kind =
            Some(ElementKind::parse(kind).ok_or_else(|| anyhow!("tipo de elemento inválido: {kind}"))?);

        let encoded = conf
            .get(PREDICATE)
            .ok_or_else(|| anyhow!("falta la opción {PREDICATE}"))?;
        let predicate = Predicate::decode(encoded).context("decodificando predicado del filtro")?;
        self.predicate = Some(predicate.compile()?);
        Ok(())
    }

    fn map(&mut self, key: Record, mut value: Record, ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        let (Some(kind), Some(predicate)) = (self.kind, self.predicate.as_ref()) else {
            return Err(anyhow!("filter usado sin setup"));
        };

        match kind {
            ElementKind::Vertex => {
                if graph::has_paths(&value) && !predicate.evaluate(&value) {
                    graph::clear_paths(&mut value);
                    ctx.increment_counter(COUNTER_GROUP, VERTICES_FILTERED, 1);
                }
            }
            ElementKind::Edge => {
                let mut filtered = 0;
                for edge in graph::edges_mut(&mut value) {
                    if graph::has_paths(edge) && !predicate.evaluate(edge) {
                        graph::clear_paths(edge);
                        filtered += 1;
                    }
                }
                ctx.increment_counter(COUNTER_GROUP, EDGES_FILTERED, filtered);
            }
        }

        ctx.write(key, value)
    }
}
