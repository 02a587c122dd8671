//! Cableado de cada job físico: entrada, salidas, compresión, shuffle.

use serde::{Deserialize, Serialize};
use std::{
    env, io,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::compiler::PhysicalJob;
use crate::conf::{
    Configuration, DEFAULT_COMPRESS_CODEC, DEFAULT_REDUCES, JOB_PACKAGE, MAP_OUTPUT_COMPRESS,
    MAP_OUTPUT_COMPRESS_CODEC, PATH_ENABLED, REDUCES,
};
use crate::error::{ChainError, Result};
use crate::format::{is_graph_input, FinalizeHook, RecordFormat};
use crate::fs::{pattern_in, FileSystem};
use crate::stage::{KeyComparator, StageDescriptor};
use crate::task::{GRAPH, SIDE_EFFECT};

/// Nombre del paquete distribuible que se adjunta a cada job.
pub const JOB_PACKAGE_NAME: &str = "stagechain-job.tar";
/// Instalación de respaldo para buscar `lib/<paquete>`.
pub const HOME_ENV: &str = "STAGECHAIN_HOME";
/// Prefijo de los directorios de cada job dentro de la salida.
pub const JOB_DIR_PREFIX: &str = "job";

/// Formato de los datos que pasan de un job al siguiente.
pub const INTERMEDIATE_FORMAT: RecordFormat = RecordFormat::KeyValue;

/// Dataset sobre el que corre la cadena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Archivo o directorio de entrada.
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_input_format")]
    pub input_format: RecordFormat,
    #[serde(default = "default_output_format")]
    pub output_format: RecordFormat,
    #[serde(default = "default_side_effect_format")]
    pub side_effect_format: RecordFormat,
}

fn default_input_format() -> RecordFormat {
    RecordFormat::JsonLines
}

fn default_output_format() -> RecordFormat {
    RecordFormat::JsonLines
}

fn default_side_effect_format() -> RecordFormat {
    RecordFormat::Csv
}

impl Dataset {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            input_format: default_input_format(),
            output_format: default_output_format(),
            side_effect_format: default_side_effect_format(),
        }
    }

    /// Directorio de trabajo del job `ordinal`: `<output>/job-<ordinal>`.
    pub fn job_location(&self, ordinal: usize) -> PathBuf {
        self.output.join(format!("{JOB_DIR_PREFIX}-{ordinal}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub location: PathBuf,
    pub format: RecordFormat,
}

impl InputSpec {
    /// Archivos a leer, sin salidas secundarias ni marcas internas.
    pub fn files(&self, fs: &dyn FileSystem) -> io::Result<Vec<PathBuf>> {
        if fs.is_file(&self.location) {
            return Ok(vec![self.location.clone()]);
        }
        if !fs.exists(&self.location) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no existe la entrada {}", self.location.display()),
            ));
        }

        Ok(fs
            .list_matching(&pattern_in(&self.location, "*"))?
            .into_iter()
            .filter(|p| fs.is_file(p) && is_graph_input(p))
            .collect())
    }
}

/// Salida con nombre registrada en el job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedOutput {
    pub name: String,
    pub format: RecordFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub location: PathBuf,
    pub format: RecordFormat,
    pub named: Vec<NamedOutput>,
}

impl OutputSpec {
    pub fn named_format(&self, name: &str) -> Option<RecordFormat> {
        self.named.iter().find(|n| n.name == name).map(|n| n.format)
    }
}

/// Job listo para mandar al motor de ejecución.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledJob {
    pub ordinal: usize,
    pub name: String,
    pub stages: Vec<StageDescriptor>,
    pub input: InputSpec,
    pub output: OutputSpec,
    pub configuration: Configuration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<KeyComparator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combiner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,
    pub reduce_tasks: usize,
    pub package: PathBuf,
}

impl AssembledJob {
    pub fn has_reduce(&self) -> bool {
        self.reducer.is_some()
    }

    pub fn map_fns(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.map_fn.as_str()).collect()
    }

    /// Configuración que ve el lado reduce/combine: la de la última etapa.
    pub fn reduce_view(&self) -> Configuration {
        self.configuration
            .stage_view(self.stages.len().saturating_sub(1))
    }

    /// Finalización propia del formato de salida principal, si tiene.
    pub fn finalizer(&self) -> Option<Box<dyn FinalizeHook>> {
        self.output.format.finalizer()
    }
}

/// Convierte cada [`PhysicalJob`] en un [`AssembledJob`].
pub struct JobAssembler<'a> {
    dataset: &'a Dataset,
    conf: &'a Configuration,
    path_enabled: bool,
    package: PathBuf,
    total_jobs: usize,
}

impl<'a> JobAssembler<'a> {
    pub fn new(
        dataset: &'a Dataset,
        conf: &'a Configuration,
        path_enabled: bool,
        package: PathBuf,
        total_jobs: usize,
    ) -> Self {
        Self {
            dataset,
            conf,
            path_enabled,
            package,
            total_jobs,
        }
    }

    pub fn assemble(&self, job: &PhysicalJob) -> Result<AssembledJob> {
        if job.stages.is_empty() {
            return Err(ChainError::Compilation(format!(
                "el job {} no tiene etapas",
                job.ordinal
            )));
        }
        for stage in &job.stages {
            stage.validate()?;
        }

        let mut configuration = self.conf.clone();
        for (step, stage) in job.stages.iter().enumerate() {
            configuration.merge_scoped(&stage.config, step);
        }
        configuration.set_bool(PATH_ENABLED, self.path_enabled);

        let reduce = job.reduce_stage();
        let reduce_tasks = match reduce {
            Some(_) => {
                configuration.set_if_absent(MAP_OUTPUT_COMPRESS, "true");
                configuration.set_if_absent(MAP_OUTPUT_COMPRESS_CODEC, DEFAULT_COMPRESS_CODEC);
                configuration.get_usize(REDUCES, DEFAULT_REDUCES).max(1)
            }
            None => 0,
        };

        Ok(AssembledJob {
            ordinal: job.ordinal,
            name: job.name(),
            stages: job.stages.clone(),
            input: self.input_for(job.ordinal),
            output: self.output_for(job.ordinal),
            configuration,
            comparator: reduce.and_then(|s| s.sort_comparator),
            combiner: reduce.and_then(|s| s.combine_fn.clone()),
            reducer: reduce.and_then(|s| s.reduce_fn.clone()),
            reduce_tasks,
            package: self.package.clone(),
        })
    }

    fn input_for(&self, ordinal: usize) -> InputSpec {
        if ordinal == 0 {
            InputSpec {
                location: self.dataset.input.clone(),
                format: self.dataset.input_format,
            }
        } else {
            InputSpec {
                location: self.dataset.job_location(ordinal - 1),
                format: INTERMEDIATE_FORMAT,
            }
        }
    }

    /// Sólo el último job escribe en el formato final; el resto usa el
    /// intermedio. Todos registran `graph` y `sideeffect`.
    fn output_for(&self, ordinal: usize) -> OutputSpec {
        let format = if ordinal + 1 == self.total_jobs {
            self.dataset.output_format
        } else {
            INTERMEDIATE_FORMAT
        };

        OutputSpec {
            location: self.dataset.job_location(ordinal),
            format,
            named: vec![
                NamedOutput {
                    name: SIDE_EFFECT.to_string(),
                    format: self.dataset.side_effect_format,
                },
                NamedOutput {
                    name: GRAPH.to_string(),
                    format,
                },
            ],
        }
    }
}

/// Busca el paquete distribuible (ver [`JOB_PACKAGE_NAME`]).
pub fn locate_job_package(conf: &Configuration) -> Result<PathBuf> {
    locate_job_package_from(conf, Path::new("."), env::var(HOME_ENV).ok())
}

fn locate_job_package_from(
    conf: &Configuration,
    cwd: &Path,
    home: Option<String>,
) -> Result<PathBuf> {
    if let Some(provided) = conf.get(JOB_PACKAGE) {
        info!("usando el paquete provisto: {}", provided);
        return Ok(PathBuf::from(provided));
    }

    let candidates = [
        ("target", "desarrollo"),
        ("../target", "desarrollo"),
        ("lib", "distribución"),
        ("../lib", "distribución"),
    ];
    for (dir, kind) in candidates {
        let path = cwd.join(dir).join(JOB_PACKAGE_NAME);
        if path.exists() {
            warn!("usando el paquete de {}: {}", kind, path.display());
            return Ok(path);
        }
    }

    let home = home.filter(|h| !h.trim().is_empty()).ok_or_else(|| {
        ChainError::ResourceLocation(format!(
            "{HOME_ENV} debe estar definida para ubicar {JOB_PACKAGE_NAME}"
        ))
    })?;

    let path = Path::new(&home).join("lib").join(JOB_PACKAGE_NAME);
    if path.exists() {
        info!("usando el paquete de distribución: {}", path.display());
        return Ok(path);
    }

    Err(ChainError::ResourceLocation(format!(
        "no se encontró {JOB_PACKAGE_NAME}"
    )))
}
