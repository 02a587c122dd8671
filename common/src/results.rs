use serde::{Deserialize, Serialize};
use std::{io, path::Path, path::PathBuf};

use crate::fs::{pattern_in, FileSystem, LocalFileSystem};
use crate::job::ChainId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainResults {
    pub chain_id: ChainId,
    /// Directorio donde quedaron los outputs de la cadena
    pub output_dir: PathBuf,
    /// Archivos bajo output_dir, relativos (ej: "job-1/part-m-00000.jsonl")
    pub files: Vec<String>,
}

impl ChainResults {
    pub fn collect(chain_id: impl Into<ChainId>, output_dir: &Path) -> io::Result<Self> {
        let fs = LocalFileSystem;
        let mut files = Vec::new();
        if output_dir.is_dir() {
            for path in fs.list_matching(&pattern_in(output_dir, "**/*"))? {
                if !fs.is_file(&path) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(output_dir) {
                    files.push(rel.to_string_lossy().to_string());
                }
            }
        }
        files.sort();

        Ok(Self {
            chain_id: chain_id.into(),
            output_dir: output_dir.to_path_buf(),
            files,
        })
    }
}
