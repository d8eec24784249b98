#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = anvil_cli::run().await {
        anvil_cli::ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
    Ok(())
}
