use anyhow::{anyhow, Context};
use std::{
    cmp::Ordering,
    collections::{hash_map::DefaultHasher, BTreeMap},
    fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::assembler::{AssembledJob, INTERMEDIATE_FORMAT};
use crate::driver::{ExecutionEngine, JobReport, SUCCESS_MARKER};
use crate::format::PART;
use crate::fs::LocalFileSystem;
use crate::registry::StageRegistry;
use crate::relay::FusedMapper;
use crate::stage::KeyComparator;
use crate::task::{Counters, Reducer, StageContext, TaskContext};
use crate::Record;

/// Directorio de trabajo del shuffle dentro de la salida del job.
const TEMPORARY_DIR: &str = "_temporary";

/// Motor en proceso: corre un job físico completo sobre el sistema de
/// archivos local. Sirve para corridas locales y para tests de punta a punta.
#[derive(Clone, Default)]
pub struct LocalEngine {
    registry: StageRegistry,
}

impl LocalEngine {
    pub fn new(registry: StageRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Nombres que el job necesita y el registro no conoce.
    fn unresolved(&self, job: &AssembledJob) -> Vec<String> {
        let mut missing: Vec<String> = job
            .map_fns()
            .into_iter()
            .filter(|n| !self.registry.has_mapper(n))
            .map(str::to_string)
            .collect();
        for name in job.combiner.iter().chain(job.reducer.iter()) {
            if !self.registry.has_reducer(name) {
                missing.push(name.clone());
            }
        }
        missing
    }

    fn execute(&self, job: &AssembledJob, inputs: Vec<Vec<(Record, Record)>>) -> anyhow::Result<Counters> {
        let mut counters = Counters::default();
        let shuffle_dir = job.output.location.join(TEMPORARY_DIR);
        let num_partitions = job.reduce_tasks.max(1);
        let mut shuffled: Vec<Vec<(Record, Record)>> = vec![Vec::new(); num_partitions];

        /* =========================
           Fase map (etapas fusionadas)
           ========================= */

        for (task_idx, records) in inputs.into_iter().enumerate() {
            let mappers = job
                .map_fns()
                .into_iter()
                .map(|name| self.registry.mapper(name))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let mut fused = FusedMapper::new(mappers, &job.configuration);
            let mut task = TaskContext::new(job.configuration.clone());

            fused.setup(&mut task)?;
            for (key, value) in records {
                fused.map(key, value, &mut task)?;
                task.progress();
            }
            fused.cleanup(&mut task)?;

            counters.merge(&task.counters);
            write_named(job, &task.take_named(), 'm', task_idx)?;

            let emitted = task.take_emitted();
            if job.has_reduce() {
                let emitted = match &job.combiner {
                    Some(name) => self.combine(job, name, emitted, &mut counters)?,
                    None => emitted,
                };
                for (key, value) in emitted {
                    let pid = hash_key_to_partition(&key.to_string(), num_partitions as u32) as usize;
                    shuffled[pid].push((key, value));
                }
            } else {
                write_file(job, PART, &emitted, 'm', task_idx)?;
            }
        }

        if !job.has_reduce() {
            return Ok(counters);
        }

        /* =========================
           Shuffle a particiones en disco
           ========================= */

        let partitions = shuffle_to_partitions(shuffled, &shuffle_dir)?;

        /* =========================
           Fase reduce
           ========================= */

        let reducer_name = job
            .reducer
            .as_deref()
            .ok_or_else(|| anyhow!("el job {} no tiene reducer", job.name))?;
        let comparator = job.comparator.unwrap_or_default();
        let view = job.reduce_view();

        for (pid, path) in partitions.iter().enumerate() {
            let records = INTERMEDIATE_FORMAT
                .read(path)
                .with_context(|| format!("leyendo partición {}", path.display()))?;

            let mut reducer = self.registry.reducer(reducer_name)?;
            let mut task = TaskContext::new(view.clone());
            run_reducer(reducer.as_mut(), group_sorted(records, comparator), &mut task)?;

            counters.merge(&task.counters);
            write_named(job, &task.take_named(), 'r', pid)?;
            write_file(job, PART, &task.take_emitted(), 'r', pid)?;
        }

        fs::remove_dir_all(&shuffle_dir)?;
        Ok(counters)
    }

    /// Combiner por tarea map: reduce local antes del shuffle.
    fn combine(
        &self,
        job: &AssembledJob,
        name: &str,
        emitted: Vec<(Record, Record)>,
        counters: &mut Counters,
    ) -> anyhow::Result<Vec<(Record, Record)>> {
        let comparator = job.comparator.unwrap_or_default();
        let mut combiner = self.registry.reducer(name)?;
        let mut task = TaskContext::new(job.reduce_view());
        run_reducer(combiner.as_mut(), group_sorted(emitted, comparator), &mut task)?;

        counters.merge(&task.counters);
        Ok(task.take_emitted())
    }
}

impl ExecutionEngine for LocalEngine {
    fn run_job(&self, job: &AssembledJob) -> anyhow::Result<JobReport> {
        let job_id = Uuid::new_v4().to_string();

        let missing = self.unresolved(job);
        if !missing.is_empty() {
            return Err(anyhow!("funciones no registradas: {}", missing.join(", ")));
        }

        let files = job
            .input
            .files(&LocalFileSystem)
            .with_context(|| format!("listando entrada {}", job.input.location.display()))?;
        let mut inputs = Vec::with_capacity(files.len());
        for file in &files {
            let records = job
                .input
                .format
                .read(file)
                .with_context(|| format!("leyendo {}", file.display()))?;
            inputs.push(records);
        }

        info!(
            "job {} ({}): {} archivo(s) de entrada, {} reduce(s)",
            job_id,
            job.name,
            files.len(),
            job.reduce_tasks
        );
        fs::create_dir_all(&job.output.location)?;

        match self.execute(job, inputs) {
            Ok(counters) => {
                fs::write(job.output.location.join(SUCCESS_MARKER), "")?;
                Ok(JobReport::succeeded(job_id, counters))
            }
            Err(e) => Ok(JobReport::failed(job_id, Counters::default(), format!("{e:#}"))),
        }
    }
}

fn run_reducer(
    reducer: &mut dyn Reducer,
    groups: Vec<(Record, Vec<Record>)>,
    task: &mut dyn StageContext,
) -> anyhow::Result<()> {
    reducer.setup(task)?;
    for (key, values) in groups {
        reducer.reduce(key, values, task)?;
        task.progress();
    }
    reducer.cleanup(task)
}

/// Ordena por clave con el comparador del job y junta los valores de
/// claves iguales.
fn group_sorted(
    mut records: Vec<(Record, Record)>,
    comparator: KeyComparator,
) -> Vec<(Record, Vec<Record>)> {
    records.sort_by(|a, b| comparator.compare(&a.0, &b.0));

    let mut groups: Vec<(Record, Vec<Record>)> = Vec::new();
    for (key, value) in records {
        match groups.last_mut() {
            Some((last, values)) if comparator.compare(last, &key) == Ordering::Equal => {
                values.push(value)
            }
            _ => groups.push((key, vec![value])),
        }
    }
    groups
}

fn hash_key_to_partition(key: &str, num_partitions: u32) -> u32 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % num_partitions.max(1) as u64) as u32
}

/// Escribe cada partición del shuffle como `shuffle-<n>.kv` en `dir` y
/// devuelve las rutas en orden de partición.
fn shuffle_to_partitions(
    partitions: Vec<Vec<(Record, Record)>>,
    dir: &Path,
) -> anyhow::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;

    let mut paths = Vec::with_capacity(partitions.len());
    for (pid, records) in partitions.into_iter().enumerate() {
        let path = dir.join(format!("shuffle-{}.{}", pid, INTERMEDIATE_FORMAT.extension()));
        INTERMEDIATE_FORMAT.write(&path, &records)?;
        debug!("partición {} con {} registro(s)", pid, records.len());
        paths.push(path);
    }
    Ok(paths)
}

fn write_named(
    job: &AssembledJob,
    named: &BTreeMap<String, Vec<(Record, Record)>>,
    side: char,
    task_idx: usize,
) -> anyhow::Result<()> {
    for (name, records) in named {
        write_file(job, name, records, side, task_idx)?;
    }
    Ok(())
}

/// `<nombre>-<m|r>-NNNNN.<ext>`; no crea archivos vacíos.
fn write_file(
    job: &AssembledJob,
    name: &str,
    records: &[(Record, Record)],
    side: char,
    task_idx: usize,
) -> anyhow::Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let format = if name == PART {
        job.output.format
    } else {
        job.output
            .named_format(name)
            .ok_or_else(|| anyhow!("salida con nombre no registrada: {name}"))?
    };

    let path = job
        .output
        .location
        .join(format!("{}-{}-{:05}.{}", name, side, task_idx, format.extension()));
    format
        .write(&path, records)
        .with_context(|| format!("escribiendo {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Dataset;
    use crate::compiler::ChainCompiler;
    use crate::conf::{Configuration, JOB_PACKAGE, PATH_ENABLED};
    use crate::driver::{ExecutionDriver, JobStatus};
    use crate::filter::{self, ElementKind, EDGES_FILTERED, VERTICES_FILTERED};
    use crate::format::{RecordFormat, MANIFEST_FILE};
    use crate::predicate::Predicate;
    use crate::stage::{KvTypes, StageDescriptor, ValueType};
    use crate::stages::{group_count_stage, start_paths_stage, IDENTITY, SUM};
    use crate::task::{Mapper, SIDE_EFFECT};
    use serde_json::json;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("engine_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn write_graph(dir: &Path) -> PathBuf {
        let input = dir.join("in");
        fs::create_dir_all(&input).unwrap();
        let lines = [
            json!({"id": 1, "label": "person", "properties": {"city": "lima"},
                   "out_edges": [{"label": "knows", "paths": 1, "properties": {"weight": 0.9}}]}),
            json!({"id": 2, "label": "person", "properties": {"city": "quito"},
                   "out_edges": [{"label": "knows", "paths": 1, "properties": {"weight": 0.1}}]}),
            json!({"id": 3, "label": "place", "properties": {"city": "lima"}}),
            json!({"id": 4, "label": "person", "properties": {"city": "lima"}}),
        ];
        let content: String = lines.iter().map(|l| format!("{l}\n")).collect();
        fs::write(input.join("vertices.jsonl"), content).unwrap();
        // no debe leerse como entrada
        fs::write(input.join("sideeffect-m-00000.csv"), "x,1\n").unwrap();
        input
    }

    struct Boom;

    impl Mapper for Boom {
        fn map(&mut self, _k: Record, _v: Record, _ctx: &mut dyn StageContext) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    /// Una emisión por palabra de "text".
    struct Tokens;

    impl Mapper for Tokens {
        fn map(&mut self, _k: Record, v: Record, ctx: &mut dyn StageContext) -> anyhow::Result<()> {
            for word in v["text"].as_str().unwrap_or("").split_whitespace() {
                ctx.write(json!(word), json!(1))?;
            }
            Ok(())
        }
    }

    fn compiler() -> ChainCompiler {
        let mut conf = Configuration::new();
        conf.set(JOB_PACKAGE, "/tmp/stagechain-job.tar");
        ChainCompiler::new(conf)
    }

    fn read_dir_records(dir: &Path, prefix: &str, format: RecordFormat) -> Vec<(Record, Record)> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(prefix))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files.iter().flat_map(|f| format.read(f).unwrap()).collect()
    }

    #[test]
    fn hash_key_to_partition_retorna_id_en_rango() {
        for key in ["a", "b", "c", "\"lima\"", "null"] {
            let pid = hash_key_to_partition(key, 4);
            assert!(pid < 4);
        }
        assert_eq!(hash_key_to_partition("a", 0), 0);
    }

    #[test]
    fn group_sorted_agrupa_segun_el_comparador() {
        let recs = vec![
            (json!("b"), json!(1)),
            (json!("a"), json!(2)),
            (json!("b"), json!(3)),
        ];
        let groups = group_sorted(recs.clone(), KeyComparator::Natural);
        assert_eq!(
            groups,
            vec![(json!("a"), vec![json!(2)]), (json!("b"), vec![json!(1), json!(3)])]
        );

        let groups = group_sorted(recs, KeyComparator::Reverse);
        assert_eq!(groups[0].0, json!("b"));
    }

    /// Cadena [start-paths, filter(vértices), group-count, filter(aristas)]:
    /// el primer job fusiona las tres primeras etapas con el reduce del
    /// conteo; el filtro de aristas abre el segundo job.
    #[test]
    fn cadena_filtro_y_conteo_de_punta_a_punta() {
        let tmp = temp_dir("e2e");
        let input = write_graph(&tmp);
        let output = tmp.join("out");

        let mut chain = compiler();
        chain
            .append_map(start_paths_stage("inicio"))
            .unwrap()
            .append_map(
                filter::stage(
                    "solo-personas",
                    ElementKind::Vertex,
                    &Predicate::HasLabel { label: "person".into() },
                )
                .unwrap(),
            )
            .unwrap()
            .append_map_reduce(group_count_stage("por-ciudad", "properties.city"))
            .unwrap()
            .append_map(
                filter::stage(
                    "aristas-fuertes",
                    ElementKind::Edge,
                    &Predicate::scripted("properties.weight >= 0.5"),
                )
                .unwrap(),
            )
            .unwrap();

        let dataset = Dataset::new(&input, &output);
        let jobs = chain.compile(&dataset).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].input.location, jobs[0].output.location);

        let engine = LocalEngine::default();
        let outcome = chain
            .execute(&engine, &LocalFileSystem, &dataset, true, None)
            .unwrap();
        assert!(outcome.succeeded(), "{:?}", outcome.error);
        assert_eq!(outcome.exit_code(), 0);

        let counters = outcome.counters();
        assert_eq!(counters.get(filter::COUNTER_GROUP, VERTICES_FILTERED), 1);
        assert_eq!(counters.get(filter::COUNTER_GROUP, EDGES_FILTERED), 1);

        // intermedios del job 0 borrados, sideeffect conservado
        let job0 = output.join("job-0");
        assert!(read_dir_records(&job0, "graph", INTERMEDIATE_FORMAT).is_empty());
        assert!(!job0.join(SUCCESS_MARKER).exists());
        let raw = fs::read_to_string(job0.join("sideeffect-r-00000.csv")).unwrap();
        let mut lines: Vec<&str> = raw.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["lima,2", "quito,1"]);

        // salida final: stream de grafo completo en el formato final
        let job1 = output.join("job-1");
        let vertices = read_dir_records(&job1, PART, RecordFormat::JsonLines);
        assert_eq!(vertices.len(), 4);
        let v1 = vertices.iter().find(|(_, v)| v["id"] == json!(1)).unwrap();
        assert_eq!(v1.1["out_edges"][0]["paths"], json!(1));
        let v2 = vertices.iter().find(|(_, v)| v["id"] == json!(2)).unwrap();
        assert_eq!(v2.1["out_edges"][0]["paths"], json!(0));
        let v3 = vertices.iter().find(|(_, v)| v["id"] == json!(3)).unwrap();
        assert_eq!(v3.1["paths"], json!(0));

        assert!(job1.join(MANIFEST_FILE).exists());
        assert!(job1.join(SUCCESS_MARKER).exists());
        assert!(!job0.join(TEMPORARY_DIR).exists());
    }

    #[test]
    fn caminos_completos_con_seguimiento_activo() {
        let tmp = temp_dir("paths");
        let input = write_graph(&tmp);
        let output = tmp.join("out");

        let mut chain = compiler().with_path_tracking(true);
        chain.append_map(start_paths_stage("inicio")).unwrap();

        let dataset = Dataset::new(&input, &output);
        let jobs = chain.compile(&dataset).unwrap();
        assert_eq!(jobs[0].configuration.get(PATH_ENABLED), Some("true"));

        let outcome = chain
            .execute(&LocalEngine::default(), &LocalFileSystem, &dataset, false, None)
            .unwrap();
        assert!(outcome.succeeded());

        let vertices = read_dir_records(&output.join("job-0"), PART, RecordFormat::JsonLines);
        let v4 = vertices.iter().find(|(_, v)| v["id"] == json!(4)).unwrap();
        assert_eq!(v4.1["paths"], json!([[4]]));
    }

    #[test]
    fn varias_particiones_de_reduce() {
        let tmp = temp_dir("reduces");
        let input = write_graph(&tmp);
        let output = tmp.join("out");

        let mut chain = compiler();
        chain.append_map(start_paths_stage("inicio")).unwrap();
        chain
            .append_map_reduce(group_count_stage("por-label", "label"))
            .unwrap();

        let mut dataset = Dataset::new(&input, &output);
        dataset.side_effect_format = RecordFormat::KeyValue;
        let mut jobs = chain.compile(&dataset).unwrap();
        jobs[0].reduce_tasks = 3;

        let report = LocalEngine::default().run_job(&jobs[0]).unwrap();
        assert_eq!(report.status, JobStatus::Succeeded);

        let mut totals = read_dir_records(&output.join("job-0"), SIDE_EFFECT, RecordFormat::KeyValue);
        totals.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        assert_eq!(
            totals,
            vec![(json!("person"), json!(3)), (json!("place"), json!(1))]
        );
    }

    #[test]
    fn mapper_que_emite_varias_veces_alimenta_el_reduce() {
        let tmp = temp_dir("wordcount");
        let input = tmp.join("in");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("t.jsonl"), "{\"text\":\"a b a\"}\n").unwrap();
        let output = tmp.join("out");

        let mut registry = StageRegistry::default();
        registry.register_mapper("tokens", || Box::new(Tokens));
        let engine = LocalEngine::new(registry);

        let mut chain = compiler();
        chain
            .append_map_reduce(StageDescriptor::map_reduce(
                "wc",
                "tokens",
                SUM,
                KvTypes::new(ValueType::Text, ValueType::Long),
                KvTypes::new(ValueType::Text, ValueType::Long),
            ))
            .unwrap();

        let mut dataset = Dataset::new(&input, &output);
        dataset.output_format = RecordFormat::KeyValue;
        let outcome = chain
            .execute(&engine, &LocalFileSystem, &dataset, false, None)
            .unwrap();
        assert!(outcome.succeeded(), "{:?}", outcome.error);

        let mut counts = read_dir_records(&output.join("job-0"), PART, RecordFormat::KeyValue);
        counts.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        assert_eq!(counts, vec![(json!("a"), json!(2)), (json!("b"), json!(1))]);
    }

    #[test]
    fn salida_con_corchetes_encadena_y_limpia_los_jobs() {
        let tmp = temp_dir("brackets");
        let input = write_graph(&tmp);
        let output = tmp.join("run[1]");

        let mut chain = compiler();
        chain
            .append_map(start_paths_stage("inicio"))
            .unwrap()
            .append_map_reduce(group_count_stage("por-label", "label"))
            .unwrap()
            .append_map(StageDescriptor::map("fin", IDENTITY, KvTypes::graph()))
            .unwrap();

        let dataset = Dataset::new(&input, &output);
        let outcome = chain
            .execute(&LocalEngine::default(), &LocalFileSystem, &dataset, false, None)
            .unwrap();
        assert!(outcome.succeeded(), "{:?}", outcome.error);

        let job0 = output.join("job-0");
        assert!(read_dir_records(&job0, "graph", INTERMEDIATE_FORMAT).is_empty());
        assert!(job0.join("sideeffect-r-00000.csv").exists());
        let vertices = read_dir_records(&output.join("job-1"), PART, RecordFormat::JsonLines);
        assert_eq!(vertices.len(), 4);
    }

    #[test]
    fn error_de_etapa_es_reporte_fallido_y_entrada_ilegible_es_error() {
        let tmp = temp_dir("failures");
        let input = write_graph(&tmp);
        let output = tmp.join("out");

        let mut registry = StageRegistry::default();
        registry.register_mapper("boom", || Box::new(Boom));
        let engine = LocalEngine::new(registry);

        let mut chain = compiler();
        chain
            .append_map(StageDescriptor::map("ok", IDENTITY, KvTypes::graph()))
            .unwrap()
            .append_map(StageDescriptor::map("revienta", "boom", KvTypes::graph()))
            .unwrap();
        let jobs = chain.compile(&Dataset::new(&input, &output)).unwrap();

        let report = engine.run_job(&jobs[0]).unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.error.unwrap_or_default().contains("boom"));

        let mut missing_input = jobs[0].clone();
        missing_input.input.location = tmp.join("no-existe");
        assert!(engine.run_job(&missing_input).is_err());

        let mut unknown = jobs[0].clone();
        unknown.stages[0].map_fn = "desconocido".into();
        assert!(engine.run_job(&unknown).is_err());
    }

    #[test]
    fn falla_en_el_medio_conserva_la_salida_del_job_anterior() {
        let tmp = temp_dir("middle");
        let input = write_graph(&tmp);
        let output = tmp.join("out");

        let mut registry = StageRegistry::default();
        registry.register_mapper("boom", || Box::new(Boom));
        let engine = LocalEngine::new(registry);

        let mut chain = compiler();
        chain
            .append_map_reduce(group_count_stage("a", "label"))
            .unwrap()
            .append(StageDescriptor::map("revienta", "boom", KvTypes::graph()))
            .unwrap()
            .append_map_reduce(group_count_stage("b", "label"))
            .unwrap()
            .append_map(StageDescriptor::map("fin", IDENTITY, KvTypes::graph()))
            .unwrap();

        let dataset = Dataset::new(&input, &output);
        let jobs = chain.compile(&dataset).unwrap();
        assert_eq!(jobs.len(), 3);

        let outcome = ExecutionDriver::new(&engine, &LocalFileSystem)
            .run(&jobs, &output, false, false)
            .unwrap();

        assert_eq!(outcome.failed_index, Some(1));
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(outcome.runs[2].status, JobStatus::Pending);
        assert!(!output.join("job-2").exists());
        let kept = read_dir_records(&output.join("job-0"), "graph", INTERMEDIATE_FORMAT);
        assert_eq!(kept.len(), 4);
    }
}
