#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use versa::{config::Config, gateway, sessions, SessionCommands};

const DEFAULT_LOG_FILTER: &str = "info,hyper=warn,reqwest=warn,h2=warn";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `Versa` - chat with your documents.
#[derive(Parser, Debug)]
#[command(name = "versa")]
#[command(version)]
#[command(about = "Chat backend with a write-behind session cache and streamed answers.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway and background jobs
    #[command(long_about = "\
Start the HTTP gateway and background jobs.

Serves the chat, history, demo and admin routes, and runs the \
write-behind flusher, the stale-key reaper and the demo sweeper. \
Bind address defaults to the values in your config file \
(gateway.host / gateway.port).

Examples:
  versa serve                  # use config defaults
  versa serve -p 8080          # listen on port 8080
  versa serve --host 0.0.0.0   # bind to all interfaces
  versa serve -p 0             # random available port")]
    Serve {
        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Inspect durable chat sessions (show, list, clear)
    #[command(long_about = "\
Inspect durable chat sessions.

Reads the durable tier directly. Messages still buffered in a running \
server's fast tier are not visible until they are flushed.

Examples:
  versa sessions list --user u-123
  versa sessions list --user u-123 --limit 10 --offset 10
  versa sessions show <session-id> --limit 5
  versa sessions clear <session-id> --yes")]
    Sessions {
        #[command(subcommand)]
        session_command: SessionCommands,
    },

    /// Manage configuration
    #[command(long_about = "\
Manage Versa configuration.

Use 'schema' to dump the full JSON Schema for the config file, which \
documents every available key, type, and default value.

Examples:
  versa config schema              # print JSON Schema to stdout
  versa config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `versa`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(versa completions bash)
  versa completions zsh > ~/.zfunc/_versa
  versa completions fish > ~/.config/fish/completions/versa.fish")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

/// `RUST_LOG` wins, then `LOG_LEVEL`, then the built-in default.
fn log_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    std::env::var("LOG_LEVEL")
        .ok()
        .filter(|level| !level.trim().is_empty())
        .and_then(|level| EnvFilter::try_new(level.trim().to_ascii_lowercase()).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = match &cli.config_dir {
        Some(dir) if dir.trim().is_empty() => bail!("--config-dir cannot be empty"),
        Some(dir) => Some(PathBuf::from(dir)),
        None => None,
    };

    // Completions must remain stdout-only and should not load config or initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Schema output is also piped; keep logging out of it.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(log_filter())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = Config::load_or_init(config_dir.as_deref()).await?;

    match cli.command {
        Commands::Completions { .. } | Commands::Config { .. } => Ok(()),

        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            info!(
                host = %config.gateway.host,
                port = config.gateway.port,
                "Starting Versa gateway"
            );
            gateway::run_gateway(config).await
        }

        Commands::Sessions { session_command } => {
            sessions::cli::handle_session_command(session_command, &config).await
        }
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
