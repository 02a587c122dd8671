pub mod assembler;
pub mod compiler;
pub mod conf;
pub mod driver;
pub mod engine;
pub mod error;
pub mod filter;
pub mod format;
pub mod fs;
pub mod graph;
pub mod job;
pub mod predicate;
pub mod registry;
pub mod relay;
pub mod results;
pub mod script;
pub mod stage;
pub mod stages;
pub mod task;

/// Tipo genérico de registro (vértice, arista, par clave/valor).
/// Usamos JSON para poder representar texto, CSV, JSONL, etc.
pub type Record = serde_json::Value;

pub use assembler::{AssembledJob, Dataset, InputSpec, JobAssembler, NamedOutput, OutputSpec};
pub use compiler::{ChainCompiler, CompilerState, Mode, PhysicalJob};
pub use conf::Configuration;
pub use driver::{ChainOutcome, ExecutionDriver, ExecutionEngine, JobReport, JobRun, JobStatus};
pub use engine::LocalEngine;
pub use error::ChainError;
pub use format::RecordFormat;
pub use fs::{FileSystem, LocalFileSystem};
pub use job::{ChainId, ChainInfo, ChainRequest, ChainStatus};
pub use registry::StageRegistry;
pub use results::ChainResults;
pub use stage::{KeyComparator, KvTypes, StageDescriptor, StageKind, ValueType};
