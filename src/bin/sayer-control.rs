//! sayer-control - CLI client for the sayerd gateway
//!
//! Sends requests over the sayerd TCP protocol and saves the returned audio.

use clap::{Parser, Subcommand};
use sayerd::protocol::SayerClient;
use std::path::PathBuf;

/// CLI client for the sayerd gateway
#[derive(Parser)]
#[command(name = "sayer-control")]
#[command(version)]
#[command(about = "Talk to a running sayerd", long_about = None)]
struct Cli {
    /// Address of the sayerd server
    #[arg(short, long, default_value = "127.0.0.1:50010")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize text and write the audio to a file
    Speak {
        /// Role (voice) to use
        role: String,
        /// Text to speak
        text: String,
        /// Output file (default: out.<format>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show which backend the server runs
    Describe,

    /// Check service health
    Ping,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut client = SayerClient::connect(&cli.addr).await?;

    match cli.command {
        Commands::Speak { role, text, output } => {
            let speech = client.speak(&role, &text).await?;
            if speech.is_empty() {
                println!("Nothing to say (empty text)");
                return Ok(());
            }
            let path = output.unwrap_or_else(|| PathBuf::from(format!("out.{}", speech.format)));
            std::fs::write(&path, &speech.audio)?;
            println!(
                "Wrote {} bytes of {} to {}",
                speech.audio.len(),
                speech.format,
                path.display()
            );
        }
        Commands::Describe => {
            let info = client.describe().await?;
            println!("backend: {}", info.backend);
            println!("version: {}", info.version);
        }
        Commands::Ping => {
            client.ping().await?;
            println!("pong");
        }
    }

    Ok(())
}
