mod chat;
mod runtime;
mod serve;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::config::AppConfig;
use crate::core::terminal::{self, print_error};

fn print_help() {
    terminal::print_banner();

    println!(" {}", style("Commands").bold().underlined());
    for (cmd, desc) in [
        ("serve", "Run the agent server (TCP interface, scheduler, heartbeat)"),
        ("chat <message>", "Send one message on the local conversation"),
        ("jobs", "List scheduled jobs"),
        ("help", "Show this guide"),
    ] {
        println!("   {:<18} {}", style(cmd).green(), desc);
    }

    println!("\n {}", style("Options").bold().underlined());
    println!("   {:<18} {}", style("--data-dir <path>").green(), "Use another data directory");
    println!("   {:<18} {}", style("--port <port>").green(), "Override the TCP port for serve");

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("squidbot").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct CommonFlags {
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
    /// Arguments that are not flags, in order.
    pub rest: Vec<String>,
}

pub(crate) fn parse_common_flags(args: &[String], start: usize) -> CommonFlags {
    let mut flags = CommonFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    flags.data_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    flags.port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other => {
                flags.rest.push(other.to_string());
                i += 1;
            }
        }
    }
    flags
}

async fn load_config(flags: &CommonFlags) -> Result<AppConfig> {
    let mut config = AppConfig::load(flags.data_dir.as_deref()).await?;
    if let Some(port) = flags.port {
        config.server.port = port;
    }
    Ok(config)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");
    let flags = parse_common_flags(&args, 2);

    match cmd {
        "serve" => {
            let config = load_config(&flags).await?;
            serve::run_serve(config).await?;
        }
        "chat" => {
            let message = flags.rest.join(" ");
            if message.trim().is_empty() {
                print_error("Error: a message is required, e.g. squidbot chat \"hello\"");
                print_help();
                return Ok(());
            }
            let config = load_config(&flags).await?;
            chat::run_chat(config, message).await?;
        }
        "jobs" => {
            let config = load_config(&flags).await?;
            chat::run_jobs(config).await?;
        }
        "help" | "--help" | "-h" => print_help(),
        other => {
            print_error(&format!("Unknown command '{}'", other));
            print_help();
        }
    }
    Ok(())
}
