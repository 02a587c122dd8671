//! Etapas incluidas: identidad, arranque de caminos, conteo agrupado y sumas.

use serde_json::{json, Value};

use crate::conf::{Configuration, PATH_ENABLED};
use crate::graph;
use crate::stage::{KvTypes, StageDescriptor, ValueType};
use crate::task::{Mapper, Reducer, StageContext, GRAPH, SIDE_EFFECT};
use crate::Record;

pub const IDENTITY: &str = "identity";
pub const START_PATHS: &str = "start-paths";
pub const GROUP_COUNT: &str = "group-count";
pub const SUM: &str = "sum";
pub const SUM_SIDE_EFFECT: &str = "sum-side-effect";

/// Campo (ruta con puntos) por el que agrupa `group-count`.
pub const GROUP_COUNT_PROPERTY: &str = "group-count.property";
const DEFAULT_GROUP_PROPERTY: &str = "label";

pub struct IdentityMap;

impl Mapper for IdentityMap {
    fn map(&mut self, key: Record, value: Record, ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        ctx.write(key, value)
    }
}

/// Da estado de caminos a cada vértice: caminos completos si el seguimiento
/// está prendido en la cadena, un contador si no.
#[derive(Default)]
pub struct StartPathsMap {
    track_paths: bool,
}

impl Mapper for StartPathsMap {
    fn setup(&mut self, ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        self.track_paths = ctx.configuration().get_bool(PATH_ENABLED, false);
        Ok(())
    }

    fn map(&mut self, key: Record, mut value: Record, ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        graph::start_paths(&mut value, self.track_paths);
        ctx.write(key, value)
    }
}

/// Lado map de un conteo agrupado.
///
/// Emite `(valor del campo, cantidad de caminos)` al shuffle y reenvía el
/// vértice por la salida `graph`, así el stream de grafo sobrevive al job.
#[derive(Default)]
pub struct GroupCountMap {
    property: String,
}

impl Mapper for GroupCountMap {
    fn setup(&mut self, ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        self.property = ctx
            .configuration()
            .get(GROUP_COUNT_PROPERTY)
            .unwrap_or(DEFAULT_GROUP_PROPERTY)
            .to_string();
        Ok(())
    }

    fn map(&mut self, key: Record, value: Record, ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        let paths = graph::path_count(&value);
        if paths > 0 {
            let group = graph::field(&value, &self.property)
                .cloned()
                .unwrap_or(Value::Null);
            ctx.write(group, json!(paths))?;
        }
        ctx.write_named(GRAPH, key, value)
    }
}

/// Suma los valores de cada clave. Sirve como combiner (`sum`) o como
/// reducer final que escribe a la salida secundaria (`sum-side-effect`).
pub struct SumReducer {
    side_effect: bool,
}

impl SumReducer {
    pub fn primary() -> Self {
        Self { side_effect: false }
    }

    pub fn side_effect() -> Self {
        Self { side_effect: true }
    }
}

impl Reducer for SumReducer {
    fn reduce(&mut self, key: Record, values: Vec<Record>, ctx: &mut dyn StageContext) -> anyhow::Result<()> {
        let total = sum_values(&values);
        if self.side_effect {
            ctx.write_named(SIDE_EFFECT, key, total)
        } else {
            ctx.write(key, total)
        }
    }
}

/// Enteros se suman como u64; si aparece algún decimal, o el total no entra
/// en u64, el total es f64.
fn sum_values(values: &[Record]) -> Value {
    let integer_total = values
        .iter()
        .try_fold(0u64, |acc, v| v.as_u64().and_then(|n| acc.checked_add(n)));
    match integer_total {
        Some(total) => json!(total),
        None => json!(values.iter().filter_map(|v| v.as_f64()).sum::<f64>()),
    }
}

/// Descriptor map-reduce de conteo agrupado por `property`, con el total
/// escrito en la salida secundaria.
pub fn group_count_stage(name: impl Into<String>, property: &str) -> StageDescriptor {
    let mut conf = Configuration::new();
    conf.set(GROUP_COUNT_PROPERTY, property);

    StageDescriptor::map_reduce(
        name,
        GROUP_COUNT,
        SUM_SIDE_EFFECT,
        KvTypes::new(ValueType::Json, ValueType::Long),
        KvTypes::new(ValueType::Json, ValueType::Long),
    )
    .with_combiner(SUM)
    .with_config(conf)
}

pub fn start_paths_stage(name: impl Into<String>) -> StageDescriptor {
    StageDescriptor::map(name, START_PATHS, KvTypes::graph())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;

    #[test]
    fn start_paths_usa_el_flag_global_de_caminos() {
        let mut conf = Configuration::new();
        conf.set_bool(PATH_ENABLED, true);
        let mut ctx = TaskContext::new(conf);

        let mut m = StartPathsMap::default();
        m.setup(&mut ctx).unwrap();
        m.map(json!(null), json!({"id": "v1"}), &mut ctx).unwrap();

        assert_eq!(ctx.emitted[0].1["paths"], json!([["v1"]]));
    }

    #[test]
    fn group_count_emite_al_shuffle_y_reenvia_el_vertice() {
        let mut conf = Configuration::new();
        conf.set(GROUP_COUNT_PROPERTY, "properties.city");
        let mut ctx = TaskContext::new(conf);

        let mut m = GroupCountMap::default();
        m.setup(&mut ctx).unwrap();
        m.map(json!(null), json!({"id": 1, "paths": 2, "properties": {"city": "lima"}}), &mut ctx)
            .unwrap();
        m.map(json!(null), json!({"id": 2, "paths": 0, "properties": {"city": "quito"}}), &mut ctx)
            .unwrap();

        assert_eq!(ctx.emitted, vec![(json!("lima"), json!(2))]);
        assert_eq!(ctx.named[GRAPH].len(), 2);
    }

    #[test]
    fn sum_reducer_escribe_en_principal_o_secundaria() {
        let mut ctx = TaskContext::new(Configuration::new());

        SumReducer::primary()
            .reduce(json!("a"), vec![json!(1), json!(2)], &mut ctx)
            .unwrap();
        SumReducer::side_effect()
            .reduce(json!("b"), vec![json!(1), json!(0.5)], &mut ctx)
            .unwrap();

        assert_eq!(ctx.emitted, vec![(json!("a"), json!(3))]);
        assert_eq!(ctx.named[SIDE_EFFECT], vec![(json!("b"), json!(1.5))]);
    }

    #[test]
    fn suma_que_desborda_u64_pasa_a_decimal() {
        let total = sum_values(&[json!(u64::MAX), json!(2)]);
        assert!(total.is_f64());
        assert_eq!(total.as_f64(), Some(u64::MAX as f64 + 2.0));
        assert_eq!(sum_values(&[json!(1), json!(2)]), json!(3));
    }

    #[test]
    fn group_count_stage_es_valido() {
        let s = group_count_stage("por-ciudad", "properties.city");
        assert!(s.validate().is_ok());
        assert_eq!(s.combine_fn.as_deref(), Some(SUM));
        assert_eq!(s.config.get(GROUP_COUNT_PROPERTY), Some("properties.city"));
    }
}
