use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::assembler::Dataset;
use crate::compiler::ChainCompiler;
use crate::conf::Configuration;
use crate::driver::{ChainOutcome, JobRun};
use crate::error::Result;
use crate::stage::StageDescriptor;

pub type ChainId = String;

/* --------- Pedido de cadena (cliente → master) --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRequest {
    pub name: String,

    /// Etapas en orden de append.
    pub stages: Vec<StageDescriptor>,

    pub dataset: Dataset,

    /// Configuración global de la cadena.
    #[serde(default)]
    pub configuration: Configuration,

    #[serde(default)]
    pub path_enabled: bool,

    /// Borrar la salida si ya existe.
    #[serde(default)]
    pub overwrite: bool,
}

impl ChainRequest {
    /// Arma el compilador con todas las etapas; falla con el primer
    /// descriptor mal formado.
    pub fn compiler(&self) -> Result<ChainCompiler> {
        let mut compiler = ChainCompiler::new(self.configuration.clone());
        if self.path_enabled {
            compiler = compiler.with_path_tracking(true);
        }
        for stage in &self.stages {
            compiler.append(stage.clone())?;
        }
        Ok(compiler)
    }

    /// Resuelve entrada y salida relativas contra `base`.
    pub fn rebase(&mut self, base: &Path) {
        self.dataset.input = rebase_path(base, &self.dataset.input);
        self.dataset.output = rebase_path(base, &self.dataset.output);
    }
}

fn rebase_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/* --------- Estado de una cadena (master → cliente) --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainStatus {
    Accepted,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainInfo {
    pub id: ChainId,
    pub name: String,
    pub status: ChainStatus,

    /// Un elemento por job físico, en orden de ejecución.
    pub jobs: Vec<JobRun>,

    pub output_dir: PathBuf,
    pub path_enabled: bool,

    pub failed_index: Option<usize>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,

    /// -------- Tiempos --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ChainInfo {
    /// Vuelca el resultado del driver en el estado de la cadena.
    pub fn apply_outcome(&mut self, outcome: &ChainOutcome) {
        self.jobs = outcome.runs.clone();
        self.failed_index = outcome.failed_index;
        self.error = outcome.error.clone();
        self.exit_code = Some(outcome.exit_code());
        self.status = if outcome.succeeded() {
            ChainStatus::Succeeded
        } else {
            ChainStatus::Failed
        };
        self.finished_at = Some(Utc::now());
    }

    /// Reemplaza el estado de un job con lo último que informó el driver.
    pub fn update_job(&mut self, run: &JobRun) {
        if let Some(slot) = self.jobs.iter_mut().find(|j| j.ordinal == run.ordinal) {
            *slot = run.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::KvTypes;
    use crate::stages::{group_count_stage, IDENTITY};
    use serde_json::json;

    fn request() -> ChainRequest {
        ChainRequest {
            name: "demo".into(),
            stages: vec![
                StageDescriptor::map("uno", IDENTITY, KvTypes::graph()),
                group_count_stage("dos", "label"),
                StageDescriptor::map("tres", IDENTITY, KvTypes::graph()),
            ],
            dataset: Dataset::new("in/graph.jsonl", "/abs/out"),
            configuration: Configuration::new(),
            path_enabled: true,
            overwrite: false,
        }
    }

    #[test]
    fn request_arma_el_compilador_con_todas_las_etapas() {
        let compiler = request().compiler().unwrap();
        assert!(compiler.path_enabled());
        assert_eq!(compiler.state().jobs().len(), 2);
    }

    #[test]
    fn request_se_lee_desde_json_con_defaults() {
        let req: ChainRequest = serde_json::from_value(json!({
            "name": "mini",
            "stages": [
                {"name": "a", "kind": "MAP_ONLY", "map": "identity"}
            ],
            "dataset": {"input": "in", "output": "out"}
        }))
        .unwrap();

        assert!(!req.path_enabled);
        assert!(req.configuration.is_empty());
        assert_eq!(req.stages[0].map_fn, IDENTITY);
        assert_eq!(req.dataset.side_effect_format, crate::format::RecordFormat::Csv);
    }

    #[test]
    fn rebase_solo_toca_rutas_relativas() {
        let mut req = request();
        req.rebase(Path::new("/data"));
        assert_eq!(req.dataset.input, PathBuf::from("/data/in/graph.jsonl"));
        assert_eq!(req.dataset.output, PathBuf::from("/abs/out"));
    }
}
