// master/src/state.rs

use common::{ChainId, ChainInfo, StageRegistry};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

#[derive(Clone)]
pub struct AppState {
    pub chains: Arc<Mutex<HashMap<ChainId, ChainInfo>>>,
    // funciones de etapa que el motor local puede resolver
    pub registry: StageRegistry,
    // base para rutas relativas de entrada/salida
    pub data_dir: PathBuf,
}

impl AppState {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            chains: Arc::new(Mutex::new(HashMap::new())),
            registry: StageRegistry::with_builtins(),
            data_dir,
        }
    }
}
