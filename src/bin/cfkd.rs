use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = controlfreak::cfk::cli::Args::parse();
    controlfreak::cfk::cli::run(args).await
}
