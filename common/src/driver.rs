//! Driver de ejecución: corre los jobs en orden, limpia intermedios y corta
//! la cadena en la primera falla.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::assembler::AssembledJob;
use crate::error::{ChainError, Result};
use crate::format::PART;
use crate::fs::{pattern_in, FileSystem};
use crate::task::{Counters, GRAPH};

/// Marca que deja un job al confirmar su salida.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Lo que el motor informa al terminar un job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    pub fn succeeded(job_id: impl Into<String>, counters: Counters) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Succeeded,
            counters,
            error: None,
        }
    }

    pub fn failed(job_id: impl Into<String>, counters: Counters, reason: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Failed,
            counters,
            error: Some(reason.into()),
        }
    }
}

/// Motor de ejecución externo. `run_job` bloquea hasta que el job llega a un
/// estado terminal.
///
/// `Err` significa que el job no se pudo enviar; un reporte `Failed`, que se
/// envió y falló al ejecutarse. Los reintentos de tareas son cosa del motor.
pub trait ExecutionEngine: Send + Sync {
    fn run_job(&self, job: &AssembledJob) -> anyhow::Result<JobReport>;
}

/// Estado de un job físico dentro de una corrida de la cadena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub ordinal: usize,
    pub name: String,
    pub status: JobStatus,
    pub location: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub counters: Counters,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRun {
    pub fn pending(job: &AssembledJob) -> Self {
        Self {
            ordinal: job.ordinal,
            name: job.name.clone(),
            status: JobStatus::Pending,
            location: job.output.location.clone(),
            job_id: None,
            counters: Counters::default(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Resultado de correr la cadena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutcome {
    pub runs: Vec<JobRun>,
    /// Índice del job que falló, si alguno.
    pub failed_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChainOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed_index.is_none()
    }

    pub fn failed_job(&self) -> Option<&JobRun> {
        self.failed_index.and_then(|i| self.runs.get(i))
    }

    /// 0 si toda la cadena terminó bien; si no, índice del job fallido + 1.
    pub fn exit_code(&self) -> i32 {
        match self.failed_index {
            None => 0,
            Some(i) => i32::try_from(i + 1).unwrap_or(i32::MAX),
        }
    }

    /// Suma de los contadores de todos los jobs.
    pub fn counters(&self) -> Counters {
        let mut total = Counters::default();
        for run in &self.runs {
            total.merge(&run.counters);
        }
        total
    }
}

/// Recibe cada transición de estado de un job.
pub type JobObserver = Box<dyn Fn(&JobRun) + Send + Sync>;

pub struct ExecutionDriver<'a> {
    engine: &'a dyn ExecutionEngine,
    fs: &'a dyn FileSystem,
    observer: Option<JobObserver>,
}

impl<'a> ExecutionDriver<'a> {
    pub fn new(engine: &'a dyn ExecutionEngine, fs: &'a dyn FileSystem) -> Self {
        Self {
            engine,
            fs,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: JobObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Corre `jobs` en orden estricto: el job `i+1` no se envía hasta que el
    /// `i` termina bien.
    pub fn run(
        &self,
        jobs: &[AssembledJob],
        output: &Path,
        overwrite: bool,
        path_enabled: bool,
    ) -> Result<ChainOutcome> {
        if overwrite && self.fs.exists(output) {
            info!("borrando salida previa {}", output.display());
            self.fs.delete(output, true)?;
        }

        if path_enabled {
            warn!("el cálculo de caminos está activo para esta cadena (caro en espacio y tiempo)");
        }

        let mut outcome = ChainOutcome {
            runs: jobs.iter().map(JobRun::pending).collect(),
            failed_index: None,
            error: None,
        };
        if jobs.is_empty() {
            return Ok(outcome);
        }
        self.fs.mkdirs(output)?;

        let total = jobs.len();
        for (i, job) in jobs.iter().enumerate() {
            info!("ejecutando job {} de {}: {}", i + 1, total, job.name);
            info!("ubicación de datos del job: {}", job.output.location.display());

            {
                let run = &mut outcome.runs[i];
                run.status = JobStatus::Running;
                run.started_at = Some(Utc::now());
                self.notify(run);
            }

            let failure = match self.engine.run_job(job) {
                Err(e) => Some(ChainError::JobSubmission {
                    index: i,
                    name: job.name.clone(),
                    reason: format!("{e:#}"),
                }),
                Ok(report) => {
                    self.finalize(job);

                    let run = &mut outcome.runs[i];
                    run.job_id = Some(report.job_id);
                    run.counters = report.counters;
                    match report.status {
                        JobStatus::Succeeded => None,
                        other => Some(ChainError::JobExecution {
                            index: i,
                            name: job.name.clone(),
                            reason: report
                                .error
                                .unwrap_or_else(|| format!("terminó en estado {other:?}")),
                        }),
                    }
                }
            };

            let run = &mut outcome.runs[i];
            run.finished_at = Some(Utc::now());

            if let Some(err) = failure {
                run.status = JobStatus::Failed;
                run.error = Some(err.to_string());
                self.notify(run);

                error!("{}", err);
                error!(
                    "error en la cadena: se cancelan los {} job(s) restantes",
                    total - i - 1
                );
                outcome.failed_index = Some(i);
                outcome.error = Some(err.to_string());
                return Ok(outcome);
            }

            run.status = JobStatus::Succeeded;
            self.notify(run);

            if i > 0 {
                self.delete_intermediate(&jobs[i - 1]);
            }
        }

        info!("cadena terminada: {} job(s) ok", total);
        Ok(outcome)
    }

    fn notify(&self, run: &JobRun) {
        if let Some(observer) = &self.observer {
            observer(run);
        }
    }

    /// Finalización del formato de salida; si falla sólo se registra.
    fn finalize(&self, job: &AssembledJob) {
        let Some(hook) = job.finalizer() else {
            return;
        };
        if let Err(e) = hook.finalize(&job.output.location) {
            let err = ChainError::Cleanup(format!(
                "finalización de {} falló: {e:#}",
                job.output.location.display()
            ));
            warn!("{}", err);
        }
    }

    /// Borra la salida de grafo del job anterior, ya consumida. Las salidas
    /// secundarias se conservan.
    fn delete_intermediate(&self, previous: &AssembledJob) {
        let dir = &previous.output.location;
        for prefix in [GRAPH, PART, SUCCESS_MARKER] {
            let pattern = pattern_in(dir, &format!("{prefix}*"));
            let paths = match self.fs.list_matching(&pattern) {
                Ok(p) => p,
                Err(e) => {
                    warn!("{}", ChainError::Cleanup(format!("{pattern}: {e}")));
                    continue;
                }
            };

            for path in paths {
                match self.fs.delete(&path, true) {
                    Ok(_) => debug!("intermedio borrado: {}", path.display()),
                    Err(e) => warn!(
                        "{}",
                        ChainError::Cleanup(format!("{}: {e}", path.display()))
                    ),
                }
            }
        }
    }
}
