//! Compilador de cadenas: decide dónde cortar jobs físicos.
//!
//! Regla de fusión: toda corrida maximal de etapas map-only, seguida como
//! mucho por el lado reduce de una etapa map-reduce, colapsa en un solo job.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assembler::{locate_job_package, AssembledJob, Dataset, JobAssembler};
use crate::conf::{Configuration, PATH_ENABLED};
use crate::driver::{ChainOutcome, ExecutionDriver, ExecutionEngine, JobObserver};
use crate::error::{ChainError, Result};
use crate::fs::FileSystem;
use crate::stage::{StageDescriptor, StageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    None,
    OpenMapRun,
    OpenReduceRun,
}

/// Un job físico: etapas que corren en la misma fase map, y como mucho un
/// lado reduce (siempre la última etapa).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalJob {
    pub ordinal: usize,
    pub stages: Vec<StageDescriptor>,
}

impl PhysicalJob {
    fn open(ordinal: usize, first: StageDescriptor) -> Self {
        Self {
            ordinal,
            stages: vec![first],
        }
    }

    /// Todas las funciones map corren fusionadas, incluida la de la etapa
    /// map-reduce si la hay.
    pub fn map_run(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.map_fn.as_str())
    }

    pub fn reduce_stage(&self) -> Option<&StageDescriptor> {
        self.stages.last().filter(|s| s.is_map_reduce())
    }

    /// Índice (dentro del job) de la etapa cuyo lado reduce corre, si hay.
    pub fn reduce_step(&self) -> Option<usize> {
        self.reduce_stage().map(|_| self.stages.len() - 1)
    }

    pub fn has_reduce(&self) -> bool {
        self.reduce_stage().is_some()
    }

    pub fn name(&self) -> String {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        names.join(" > ")
    }
}

/// Estado inmutable del compilador; cada `append` devuelve uno nuevo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilerState {
    mode: Mode,
    jobs: Vec<PhysicalJob>,
}

impl CompilerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn jobs(&self) -> &[PhysicalJob] {
        &self.jobs
    }

    pub fn into_jobs(self) -> Vec<PhysicalJob> {
        self.jobs
    }

    pub fn append_map(mut self, stage: StageDescriptor) -> Result<Self> {
        if stage.kind != StageKind::MapOnly {
            return Err(ChainError::Compilation(format!(
                "append_map recibió la etapa map-reduce '{}'",
                stage.name
            )));
        }
        stage.validate()?;

        self.push(stage);
        self.mode = Mode::OpenMapRun;
        Ok(self)
    }

    pub fn append_map_reduce(mut self, stage: StageDescriptor) -> Result<Self> {
        if stage.kind != StageKind::MapReduce {
            return Err(ChainError::Compilation(format!(
                "append_map_reduce recibió la etapa map-only '{}'",
                stage.name
            )));
        }
        stage.validate()?;

        self.push(stage);
        self.mode = Mode::OpenReduceRun;
        Ok(self)
    }

    /// Sólo una corrida map abierta acepta más etapas; si no, job nuevo.
    fn push(&mut self, stage: StageDescriptor) {
        let ordinal = self.jobs.len();
        match self.jobs.last_mut() {
            Some(job) if self.mode == Mode::OpenMapRun => job.stages.push(stage),
            _ => self.jobs.push(PhysicalJob::open(ordinal, stage)),
        }
    }

    /// Despacha según el tipo del descriptor.
    pub fn append(self, stage: StageDescriptor) -> Result<Self> {
        match stage.kind {
            StageKind::MapOnly => self.append_map(stage),
            StageKind::MapReduce => self.append_map_reduce(stage),
        }
    }
}

/// Frente para el llamador: junta etapas, compila y ejecuta la cadena.
#[derive(Debug, Clone, Default)]
pub struct ChainCompiler {
    state: CompilerState,
    conf: Configuration,
    path_enabled: bool,
}

impl ChainCompiler {
    /// `conf` es la configuración global de la cadena; si trae
    /// `stagechain.path-enabled` se usa como valor inicial del flag.
    pub fn new(conf: Configuration) -> Self {
        let path_enabled = conf.get_bool(PATH_ENABLED, false);
        Self {
            state: CompilerState::new(),
            conf,
            path_enabled,
        }
    }

    pub fn with_path_tracking(mut self, enabled: bool) -> Self {
        self.path_enabled = enabled;
        self
    }

    pub fn path_enabled(&self) -> bool {
        self.path_enabled
    }

    pub fn configuration(&self) -> &Configuration {
        &self.conf
    }

    pub fn state(&self) -> &CompilerState {
        &self.state
    }

    pub fn append_map(&mut self, stage: StageDescriptor) -> Result<&mut Self> {
        self.state = self.state.clone().append_map(stage)?;
        Ok(self)
    }

    pub fn append_map_reduce(&mut self, stage: StageDescriptor) -> Result<&mut Self> {
        self.state = self.state.clone().append_map_reduce(stage)?;
        Ok(self)
    }

    pub fn append(&mut self, stage: StageDescriptor) -> Result<&mut Self> {
        self.state = self.state.clone().append(stage)?;
        Ok(self)
    }

    /// Arma cada job físico con su cableado de entrada/salida.
    ///
    /// Falla antes de tocar nada si el paquete distribuible no aparece o si
    /// algún job no pasa la validación.
    pub fn compile(&self, dataset: &Dataset) -> Result<Vec<AssembledJob>> {
        let jobs = self.state.jobs();
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let package = locate_job_package(&self.conf)?;
        let assembler = JobAssembler::new(
            dataset,
            &self.conf,
            self.path_enabled,
            package,
            jobs.len(),
        );

        let assembled = jobs
            .iter()
            .map(|job| assembler.assemble(job))
            .collect::<Result<Vec<_>>>()?;
        info!("cadena compilada en {} job(s)", assembled.len());
        Ok(assembled)
    }

    /// Compila y corre la cadena completa. Los errores de compilación o de
    /// localización vuelven como `Err`; un job fallido vuelve como
    /// [`ChainOutcome`] con código distinto de cero.
    pub fn execute(
        &self,
        engine: &dyn ExecutionEngine,
        fs: &dyn FileSystem,
        dataset: &Dataset,
        overwrite: bool,
        observer: Option<JobObserver>,
    ) -> Result<ChainOutcome> {
        let jobs = self.compile(dataset)?;

        let mut driver = ExecutionDriver::new(engine, fs);
        if let Some(observer) = observer {
            driver = driver.with_observer(observer);
        }
        driver.run(&jobs, &dataset.output, overwrite, self.path_enabled)
    }
}
