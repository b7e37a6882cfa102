// ABOUTME: Binary entry point for the trellis CLI
// ABOUTME: Parses arguments, loads configuration and hands off to the application

use anyhow::Result;
use trellis::cli::{App, Args, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();
    let config = Config::load(args.config.clone())?;

    let mut app = App::new(config);
    app.run(args).await?;

    Ok(())
}
