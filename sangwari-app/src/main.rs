//! Sangwari terminal host: text chat with the companion, plus live voice calls.

mod live;
mod settings;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sangwari_core::{
    audio::device::{list_devices, DeviceDirection},
    ChatSession, GeminiChatClient, Role,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use live::InputLines;
use settings::{default_settings_path, load_settings, save_settings, AppSettings};

/// Sangwari - a Chhattisgarhi companion you can chat with or call
#[derive(Parser)]
#[command(name = "sangwari", version, about)]
struct Cli {
    /// Settings file (defaults to the user data directory)
    #[arg(long, env = "SANGWARI_SETTINGS")]
    settings: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Text chat (default). `/call` starts a voice call, `/quit` exits
    Chat,
    /// Start a voice call right away
    Call,
    /// List microphones and speakers
    Devices,
    /// Write the normalized settings file and print where it lives
    Settings,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "sangwari=info",
        1 => "sangwari=debug",
        _ => "sangwari=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn require_api_key(settings: &AppSettings, path: &std::path::Path) -> anyhow::Result<String> {
    settings.resolve_api_key().with_context(|| {
        format!(
            "no API key: set SANGWARI_API_KEY or GEMINI_API_KEY, or `apiKey` in {}",
            path.display()
        )
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let path = cli.settings.unwrap_or_else(default_settings_path);
    let settings = load_settings(&path);
    info!(path = %path.display(), "settings loaded");

    let mut input: InputLines = BufReader::new(tokio::io::stdin()).lines();

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => {
            let api_key = require_api_key(&settings, &path)?;
            chat(&settings, api_key, &mut input).await
        }
        Command::Call => {
            let api_key = require_api_key(&settings, &path)?;
            live::run_call(&settings, api_key, &mut input).await
        }
        Command::Devices => {
            print_devices();
            Ok(())
        }
        Command::Settings => {
            save_settings(&path, &settings)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

async fn chat(settings: &AppSettings, api_key: String, input: &mut InputLines) -> anyhow::Result<()> {
    let client = GeminiChatClient::new(api_key.clone())?.with_model(settings.chat_model.clone());
    let mut session = ChatSession::with_history_limit(client, settings.max_history_turns);

    for turn in session.turns() {
        println!("Sangwari: {}", turn.text);
    }

    while let Some(line) = input.next_line().await.context("reading stdin")? {
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/call" => {
                if let Err(e) = live::run_call(settings, api_key.clone(), input).await {
                    eprintln!("call failed: {e:#}");
                }
            }
            _ => {
                if let Some(reply) = session.send(&line).await {
                    if reply.role == Role::Model {
                        println!("Sangwari: {}", reply.text);
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_devices() {
    let devices = list_devices();
    if devices.is_empty() {
        println!("No audio devices found.");
        return;
    }
    for direction in [DeviceDirection::Input, DeviceDirection::Output] {
        println!(
            "{}:",
            match direction {
                DeviceDirection::Input => "Microphones",
                DeviceDirection::Output => "Speakers",
            }
        );
        for device in devices.iter().filter(|d| d.direction == direction) {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("  {}{marker}", device.name);
        }
    }
}
