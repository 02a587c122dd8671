use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::Arc;

use crate::filter::{self, FilterMap};
use crate::stages::{
    GroupCountMap, IdentityMap, StartPathsMap, SumReducer, GROUP_COUNT, IDENTITY, START_PATHS,
    SUM, SUM_SIDE_EFFECT,
};
use crate::task::{Mapper, Reducer};

pub type MapperFactory = Arc<dyn Fn() -> Box<dyn Mapper> + Send + Sync>;
pub type ReducerFactory = Arc<dyn Fn() -> Box<dyn Reducer> + Send + Sync>;

/// Resuelve, del lado del motor, los nombres de funciones de un descriptor.
#[derive(Clone)]
pub struct StageRegistry {
    mappers: HashMap<String, MapperFactory>,
    reducers: HashMap<String, ReducerFactory>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            mappers: HashMap::new(),
            reducers: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register_mapper(IDENTITY, || Box::new(IdentityMap));
        registry.register_mapper(START_PATHS, || Box::new(StartPathsMap::default()));
        registry.register_mapper(filter::MAPPER_NAME, || Box::new(FilterMap::default()));
        registry.register_mapper(GROUP_COUNT, || Box::new(GroupCountMap::default()));
        registry.register_reducer(SUM, || Box::new(SumReducer::primary()));
        registry.register_reducer(SUM_SIDE_EFFECT, || Box::new(SumReducer::side_effect()));
        registry
    }

    pub fn register_mapper<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Mapper> + Send + Sync + 'static,
    {
        self.mappers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_reducer<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Reducer> + Send + Sync + 'static,
    {
        self.reducers.insert(name.into(), Arc::new(factory));
    }

    pub fn has_mapper(&self, name: &str) -> bool {
        self.mappers.contains_key(name)
    }

    pub fn has_reducer(&self, name: &str) -> bool {
        self.reducers.contains_key(name)
    }

    pub fn mapper(&self, name: &str) -> anyhow::Result<Box<dyn Mapper>> {
        self.mappers
            .get(name)
            .map(|f| f())
            .ok_or_else(|| anyhow!("mapper desconocido: {name}"))
    }

    pub fn reducer(&self, name: &str) -> anyhow::Result<Box<dyn Reducer>> {
        self.reducers
            .get(name)
            .map(|f| f())
            .ok_or_else(|| anyhow!("reducer desconocido: {name}"))
    }
}
