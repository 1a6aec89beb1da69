//! Kairos provider - answers agent events for node bootstrap and upgrades

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use kairos_provider::event::{self, Event};
use kairos_provider::layout::SystemLayout;
use kairos_provider::telemetry;

/// Kairos provider plugin
///
/// Reads one event as JSON from stdin and writes the response as JSON to
/// stdout.
#[derive(Parser, Debug)]
#[command(name = "agent-provider-kairos", version, about, long_about = None)]
struct Cli {
    /// Event name, e.g. `agent.bootstrap`
    event: String,

    /// Root of the filesystem the provider operates on
    #[arg(long, env = "KAIROS_ROOT", default_value = "/")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init()?;

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read event from stdin")?;

    let event: Event = if input.trim().is_empty() {
        Event::default()
    } else {
        serde_json::from_str(&input).context("failed to parse event")?
    };

    let layout = SystemLayout::new(cli.root);
    let response = event::dispatch(&cli.event, &event, &layout).await;

    let mut out = serde_json::to_vec(&response).context("failed to encode response")?;
    out.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&out).await?;
    stdout.flush().await?;
    Ok(())
}
