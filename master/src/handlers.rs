use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    AssembledJob, ChainError, ChainInfo, ChainRequest, ChainResults, ChainStatus,
    ExecutionDriver, JobRun, LocalEngine, LocalFileSystem,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/chains", post(create_chain).get(list_chains))
        .route("/api/v1/chains/:id", get(get_chain))
        .route("/api/v1/chains/:id/results", get(get_chain_results))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Compila la cadena en el momento (errores → 400) y la corre en segundo plano
async fn create_chain(
    State(state): State<AppState>,
    Json(mut req): Json<ChainRequest>,
) -> Result<Json<ChainInfo>, (StatusCode, String)> {
    for path in [&req.dataset.input, &req.dataset.output] {
        if !is_confined(path) {
            return Err((
                StatusCode::BAD_REQUEST,
                format!(
                    "la ruta '{}' debe ser relativa al directorio de datos y sin '..'",
                    path.display()
                ),
            ));
        }
    }
    req.rebase(&state.data_dir);

    let compiler = req.compiler().map_err(reject)?;
    let jobs = compiler.compile(&req.dataset).map_err(reject)?;

    let chain_id = uuid::Uuid::new_v4().to_string();
    let info = ChainInfo {
        id: chain_id.clone(),
        name: req.name.clone(),
        status: ChainStatus::Accepted,
        jobs: jobs.iter().map(JobRun::pending).collect(),
        output_dir: req.dataset.output.clone(),
        path_enabled: compiler.path_enabled(),
        failed_index: None,
        error: None,
        exit_code: None,
        submitted_at: Utc::now(),
        started_at: None,
        finished_at: None,
    };

    state
        .chains
        .lock()
        .map_err(|_| internal("estado de cadenas inaccesible"))?
        .insert(chain_id.clone(), info.clone());

    info!(
        "cadena {} ({}) aceptada: {} etapa(s) en {} job(s)",
        chain_id,
        req.name,
        req.stages.len(),
        jobs.len()
    );

    let bg_state = state.clone();
    tokio::task::spawn_blocking(move || {
        run_chain(bg_state, chain_id, req, jobs);
    });

    Ok(Json(info))
}

// Corre el driver (bloqueante) y publica cada transición en el estado compartido
fn run_chain(state: AppState, chain_id: String, req: ChainRequest, jobs: Vec<AssembledJob>) {
    update(&state, &chain_id, |c| {
        c.status = ChainStatus::Running;
        c.started_at = Some(Utc::now());
    });

    let observer_state = state.clone();
    let observer_id = chain_id.clone();
    let observer = Box::new(move |run: &JobRun| {
        update(&observer_state, &observer_id, |c| c.update_job(run));
    });

    let engine = LocalEngine::new(state.registry.clone());
    let result = ExecutionDriver::new(&engine, &LocalFileSystem)
        .with_observer(observer)
        .run(&jobs, &req.dataset.output, req.overwrite, req.path_enabled);

    match result {
        Ok(outcome) => {
            if outcome.succeeded() {
                info!("cadena {} terminada OK", chain_id);
            } else {
                warn!(
                    "cadena {} falló en el job {:?}: {}",
                    chain_id,
                    outcome.failed_index,
                    outcome.error.as_deref().unwrap_or("")
                );
            }
            update(&state, &chain_id, |c| c.apply_outcome(&outcome));
        }
        Err(e) => {
            error!("cadena {} no pudo arrancar: {}", chain_id, e);
            update(&state, &chain_id, |c| {
                c.status = ChainStatus::Failed;
                c.error = Some(e.to_string());
                c.finished_at = Some(Utc::now());
            });
        }
    }
}

fn update<F>(state: &AppState, chain_id: &str, f: F)
where
    F: FnOnce(&mut ChainInfo),
{
    match state.chains.lock() {
        Ok(mut chains) => {
            if let Some(chain) = chains.get_mut(chain_id) {
                f(chain);
            }
        }
        Err(_) => error!("estado de cadenas envenenado, no se actualiza {}", chain_id),
    }
}

// Lista todas las cadenas, las más nuevas al final
async fn list_chains(State(state): State<AppState>) -> Result<Json<Vec<ChainInfo>>, StatusCode> {
    let chains = state
        .chains
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut list: Vec<ChainInfo> = chains.values().cloned().collect();
    list.sort_by_key(|c| c.submitted_at);
    Ok(Json(list))
}

// Devuelve el estado de una cadena y de cada uno de sus jobs
async fn get_chain(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChainInfo>, StatusCode> {
    let chains = state
        .chains
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    chains
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// Lista archivos de salida de una cadena
async fn get_chain_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChainResults>, StatusCode> {
    let output_dir = {
        let chains = state
            .chains
            .lock()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        chains
            .get(&id)
            .map(|c| c.output_dir.clone())
            .ok_or(StatusCode::NOT_FOUND)?
    };

    ChainResults::collect(id, &output_dir)
        .map(Json)
        .map_err(|e| {
            error!("no se pudo listar {}: {}", output_dir.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

// Sólo rutas relativas no vacías que no suban de directorio
fn is_confined(path: &std::path::Path) -> bool {
    use std::path::Component;

    path.components().any(|c| matches!(c, Component::Normal(_)))
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn reject(err: ChainError) -> (StatusCode, String) {
    let status = match err {
        ChainError::ResourceLocation(_) | ChainError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string())
}

fn internal(msg: &str) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use common::conf::JOB_PACKAGE;
    use serde_json::{json, Value};
    use std::{env, fs, path::PathBuf, time::Duration};
    use tower::ServiceExt;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("master_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_chain(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/chains")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let app = build_router(AppState::new(env::temp_dir()));
        let resp = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cadena_mal_formada_es_400() {
        let app = build_router(AppState::new(env::temp_dir()));
        let (status, _) = send(
            app,
            post_chain(json!({
                "name": "mala",
                "stages": [{"name": "x", "kind": "MAP_REDUCE", "map": "group-count"}],
                "dataset": {"input": "in", "output": "out"},
                "configuration": {"stagechain.job.package": "/tmp/p.tar"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rutas_fuera_del_directorio_de_datos_son_400() {
        let tmp = temp_dir("confined");
        let outside = tmp.join("no-tocar");
        fs::create_dir_all(&outside).unwrap();

        for (input, output) in [
            ("in", outside.to_string_lossy().to_string()),
            ("in", "../no-tocar".to_string()),
            ("/etc", "out".to_string()),
            ("in", "".to_string()),
        ] {
            let app = build_router(AppState::new(tmp.join("data")));
            let (status, _) = send(
                app,
                post_chain(json!({
                    "name": "escapa",
                    "stages": [{"name": "id", "kind": "MAP_ONLY", "map": "identity"}],
                    "dataset": {"input": input, "output": output},
                    "configuration": {(JOB_PACKAGE): "/tmp/p.tar"},
                    "overwrite": true
                })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{input} -> {output}");
        }
        assert!(outside.exists());
        assert!(is_confined(std::path::Path::new("./sub/out")));
    }

    #[tokio::test]
    async fn cadena_desconocida_es_404() {
        let app = build_router(AppState::new(env::temp_dir()));
        let resp = app.oneshot(get_req("/api/v1/chains/nada")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cadena_se_acepta_corre_y_publica_resultados() {
        let tmp = temp_dir("submit");
        fs::create_dir_all(tmp.join("in")).unwrap();
        fs::write(
            tmp.join("in/v.jsonl"),
            "{\"id\":1,\"label\":\"person\"}\n{\"id\":2,\"label\":\"place\"}\n",
        )
        .unwrap();

        let state = AppState::new(tmp.clone());
        let (status, body) = send(
            build_router(state.clone()),
            post_chain(json!({
                "name": "conteo",
                "stages": [
                    {"name": "inicio", "kind": "MAP_ONLY", "map": "start-paths",
                     "map_output": {"key": "null", "value": "vertex"}},
                    {"name": "por-label", "kind": "MAP_REDUCE", "map": "group-count",
                     "combine": "sum", "reduce": "sum-side-effect",
                     "map_output": {"key": "json", "value": "long"},
                     "reduce_output": {"key": "json", "value": "long"}}
                ],
                "dataset": {"input": "in", "output": "out"},
                "configuration": {(JOB_PACKAGE): "/tmp/p.tar"}
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().map(|j| j.len()), Some(1));
        let id = body["id"].as_str().unwrap().to_string();

        let mut last = Value::Null;
        for _ in 0..100 {
            let (_, chain) = send(build_router(state.clone()), get_req(&format!("/api/v1/chains/{id}"))).await;
            if chain["status"] == json!("SUCCEEDED") || chain["status"] == json!("FAILED") {
                last = chain;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(last["status"], json!("SUCCEEDED"), "{last}");
        assert_eq!(last["exit_code"], json!(0));
        assert_eq!(last["jobs"][0]["status"], json!("SUCCEEDED"));

        let (_, results) = send(
            build_router(state.clone()),
            get_req(&format!("/api/v1/chains/{id}/results")),
        )
        .await;
        let files: Vec<String> = serde_json::from_value(results["files"].clone()).unwrap();
        assert!(files.iter().any(|f| f.starts_with("job-0/sideeffect-r-")));
        assert!(files.iter().any(|f| f.starts_with("job-0/graph-m-")));
    }
}
