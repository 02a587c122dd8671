use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::driver::JobObserver;
use common::{
    ChainInfo, ChainRequest, ChainResults, JobRun, LocalEngine, LocalFileSystem, StageRegistry,
};
use reqwest::Client;
use std::{env, fs, path::Path, path::PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para compilar, correr y consultar cadenas de etapas")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía una cadena (JSON) al master
    Submit {
        #[arg(value_name = "CADENA_JSON")]
        chain: PathBuf,
    },
    /// Consulta el estado de una cadena y sus jobs
    Status {
        #[arg(value_name = "CHAIN_ID")]
        id: String,
    },
    /// Lista los archivos de salida de una cadena
    Results {
        #[arg(value_name = "CHAIN_ID")]
        id: String,
    },
    /// Compila localmente y muestra los jobs físicos resultantes
    Plan {
        #[arg(value_name = "CADENA_JSON")]
        chain: PathBuf,
    },
    /// Compila y corre la cadena con el motor local
    Run {
        #[arg(value_name = "CADENA_JSON")]
        chain: PathBuf,
    },
}

fn load_request(path: &Path) -> Result<ChainRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("cadena inválida en {}", path.display()))
}

fn print_chain(chain: &ChainInfo) {
    println!("Cadena:");
    println!("  id: {}", chain.id);
    println!("  nombre: {}", chain.name);
    println!("  estado: {:?}", chain.status);
    println!("  salida: {}", chain.output_dir.display());
    println!("  rastreo de caminos: {}", chain.path_enabled);
    for job in &chain.jobs {
        print_job(job);
    }
    if let Some(err) = &chain.error {
        println!("  error: {}", err);
    }
    if let Some(code) = chain.exit_code {
        println!("  código de salida: {}", code);
    }
}

fn print_job(job: &JobRun) {
    println!(
        "  job-{} [{}]: {:?} -> {}",
        job.ordinal,
        job.name,
        job.status,
        job.location.display()
    );
    for (group, name, value) in job.counters.iter() {
        println!("      {}.{} = {}", group, name, value);
    }
}

/// Devuelve el código de salida del proceso.
pub async fn run() -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("client=info,common=info")),
        )
        .init();

    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit { chain } => {
            let req = load_request(&chain)?;
            let url = format!("{}/api/v1/chains", base_url);
            let resp = client.post(&url).json(&req).send().await?;

            if resp.status().is_success() {
                let info: ChainInfo = resp.json().await?;
                println!("Cadena aceptada:");
                print_chain(&info);
            } else {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                println!("El master rechazó la cadena ({}): {}", status, body);
                return Ok(1);
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/chains/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let chain: ChainInfo = resp.json().await?;
                print_chain(&chain);
            } else {
                println!("No se encontró la cadena con id {id}");
                return Ok(1);
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/chains/{}/results", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let results: ChainResults = resp.json().await?;
                println!("Resultados de {} en {}:", results.chain_id, results.output_dir.display());
                if results.files.is_empty() {
                    println!("  (sin archivos)");
                }
                for f in results.files {
                    println!("  {}", f);
                }
            } else {
                println!("No hay resultados para la cadena {id}");
                return Ok(1);
            }
        }

        Commands::Plan { chain } => {
            let req = load_request(&chain)?;
            let jobs = req.compiler()?.compile(&req.dataset)?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }

        Commands::Run { chain } => {
            let req = load_request(&chain)?;
            let compiler = req.compiler()?;
            let engine = LocalEngine::new(StageRegistry::with_builtins());
            let observer: JobObserver = Box::new(|run: &JobRun| print_job(run));

            let outcome = tokio::task::spawn_blocking(move || {
                compiler.execute(
                    &engine,
                    &LocalFileSystem,
                    &req.dataset,
                    req.overwrite,
                    Some(observer),
                )
            })
            .await??;

            match outcome.failed_job() {
                None => info!("cadena terminada OK ({} job(s))", outcome.runs.len()),
                Some(job) => println!(
                    "Falló job-{} [{}]: {}",
                    job.ordinal,
                    job.name,
                    outcome.error.as_deref().unwrap_or("")
                ),
            }
            return Ok(outcome.exit_code());
        }
    }

    Ok(0)
}
