use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use crate::task::{GRAPH, SIDE_EFFECT};
use crate::Record;

/// Archivo que escribe la finalización de `JsonLines`.
pub const MANIFEST_FILE: &str = "_manifest.json";
/// Prefijo de las salidas principales (`part-m-00000`, `part-r-00000`).
pub const PART: &str = "part";

/// Códec de registros en disco.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// Un valor JSON por línea; la clave se lee como `null`.
    JsonLines,
    /// Formato intermedio: `{"k": .., "v": ..}` por línea.
    KeyValue,
    /// Lectura: encabezado + filas → objeto. Escritura: filas `clave,valor`.
    Csv,
}

impl RecordFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RecordFormat::JsonLines => "jsonl",
            RecordFormat::KeyValue => "kv",
            RecordFormat::Csv => "csv",
        }
    }

    pub fn read(&self, path: &Path) -> io::Result<Vec<(Record, Record)>> {
        match self {
            RecordFormat::JsonLines => read_lines(path, |v| Ok((Value::Null, v))),
            RecordFormat::KeyValue => read_lines(path, |mut v| {
                let key = v.get_mut("k").map(Value::take).unwrap_or(Value::Null);
                let value = v.get_mut("v").map(Value::take).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("registro intermedio sin 'v' en {}", path.display()),
                    )
                })?;
                Ok((key, value))
            }),
            RecordFormat::Csv => read_csv(path),
        }
    }

    pub fn write(&self, path: &Path, records: &[(Record, Record)]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        match self {
            RecordFormat::JsonLines => write_lines(path, records.iter().map(|(_, v)| v.clone())),
            RecordFormat::KeyValue => {
                write_lines(path, records.iter().map(|(k, v)| json!({ "k": k, "v": v })))
            }
            RecordFormat::Csv => {
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_path(path)
                    .map_err(csv_to_io)?;
                for (k, v) in records {
                    writer
                        .write_record([scalar_to_string(k), scalar_to_string(v)])
                        .map_err(csv_to_io)?;
                }
                writer.flush()
            }
        }
    }

    /// Finalización propia del formato, si tiene.
    pub fn finalizer(&self) -> Option<Box<dyn FinalizeHook>> {
        match self {
            RecordFormat::JsonLines => Some(Box::new(ManifestFinalizer)),
            RecordFormat::KeyValue | RecordFormat::Csv => None,
        }
    }
}

/// Filtro de entrada: ignora salidas secundarias y archivos internos
/// (`_manifest.json`, `.crc`, etc.).
pub fn is_graph_input(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !(name.starts_with(SIDE_EFFECT) || name.starts_with('_') || name.starts_with('.'))
}

/// Salida principal de registros de grafo (`part*` o `graph*`).
pub fn is_primary_output(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(PART) || n.starts_with(GRAPH))
        .unwrap_or(false)
}

/// Paso opcional que un formato de salida corre cuando termina su job.
pub trait FinalizeHook: Send + Sync {
    fn finalize(&self, output_dir: &Path) -> anyhow::Result<()>;
}

/// Deja un `_manifest.json` con los archivos de grafo que el job publicó.
pub struct ManifestFinalizer;

impl FinalizeHook for ManifestFinalizer {
    fn finalize(&self, output_dir: &Path) -> anyhow::Result<()> {
        let mut files: Vec<String> = Vec::new();
        for entry in fs::read_dir(output_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && is_primary_output(&path) {
                files.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        files.sort();

        let manifest = json!({
            "files": files,
            "written_at": Utc::now().to_rfc3339(),
        });
        fs::write(
            output_dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        Ok(())
    }
}

fn read_lines<F>(path: &Path, mut parse: F) -> io::Result<Vec<(Record, Record)>>
where
    F: FnMut(Value) -> io::Result<(Record, Record)>,
{
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();

    for line_res in reader.lines() {
        let line = line_res?;
        if line.trim().is_empty() {
            continue;
        }
        let v: Value = serde_json::from_str(&line)?;
        out.push(parse(v)?);
    }

    Ok(out)
}

fn write_lines<I>(path: &Path, values: I) -> io::Result<()>
where
    I: Iterator<Item = Value>,
{
    let mut writer = BufWriter::new(File::create(path)?);
    for v in values {
        serde_json::to_writer(&mut writer, &v)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}

fn read_csv(path: &Path) -> io::Result<Vec<(Record, Record)>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(csv_to_io)?;

    // Limpia BOM por si viene de Excel/Windows
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_to_io)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut out = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_to_io)?;
        let mut obj = serde_json::Map::new();
        for (idx, h) in headers.iter().enumerate() {
            obj.insert(h.clone(), json!(row.get(idx).unwrap_or("")));
        }
        out.push((Value::Null, Value::Object(obj)));
    }

    Ok(out)
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn csv_to_io(e: csv::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}
