mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let code = cli::run().await?;
    std::process::exit(code);
}
