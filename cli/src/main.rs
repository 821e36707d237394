use clap::Parser;
use color_eyre::Result;
use imagegen::{cli::Cli, run};
use imagegen_engine::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    color_eyre::install()?;
    let cli = Cli::parse();
    let output = cli.output.clone();

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let artifact = run(cli, cancel).await?;
    println!(
        "Saved {}x{} image to {}",
        artifact.width(),
        artifact.height(),
        output.display()
    );
    Ok(())
}
