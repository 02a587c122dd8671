use thiserror::Error;

/// Errores del compilador y del driver de cadenas.
///
/// Los errores de compilación y de localización se devuelven de forma
/// síncrona al llamador; los fallos de un job se reportan como resultado
/// de la cadena (ver `driver::ChainOutcome`) y las fallas de limpieza sólo
/// se registran en el log.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("error de compilación: {0}")]
    Compilation(String),

    #[error("no se pudo localizar el paquete distribuible: {0}")]
    ResourceLocation(String),

    #[error("no se pudo enviar el job {index} ({name}): {reason}")]
    JobSubmission {
        index: usize,
        name: String,
        reason: String,
    },

    #[error("el job {index} ({name}) falló: {reason}")]
    JobExecution {
        index: usize,
        name: String,
        reason: String,
    },

    #[error("error de limpieza: {0}")]
    Cleanup(String),

    #[error("la etapa fusionada {stage} emitió {emitted} registros para una sola entrada")]
    FusionViolation { stage: usize, emitted: usize },

    #[error("la etapa {stage} falló: {source}")]
    Stage {
        stage: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("error de predicado: {0}")]
    Predicate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChainError>;
