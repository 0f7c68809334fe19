use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use keel_config::{ConfigLoader, KeelConfig, WarningSeverity};
use keel_core::KeelError;
use keel_ext::services::HttpNetworkClient;
use keel_ext::{CommandInvocation, ExtensionRuntime, HostServices, RuntimeSettings};

mod extensions;
mod prompt;
mod shell;

pub use prompt::TerminalPrompt;

/// Keel: developer tool for blockchain work, extended by capability-scoped plugins
#[derive(Parser)]
#[command(name = "keel", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to keel.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage extensions
    Ext {
        #[command(subcommand)]
        action: ExtAction,
    },
    /// List commands contributed by active extensions
    Commands {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run an extension command
    Run {
        /// Command name
        command: String,
        /// Positional arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Flags as key=value pairs (values are parsed as JSON when possible)
        #[arg(short, long, value_parser = parse_key_val)]
        flag: Vec<(String, String)>,
    },
    /// Interactive session: run commands, enable and disable extensions
    Shell,
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Audit configuration and extension directories
    Doctor,
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ExtAction {
    /// List installed extensions
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Install an extension from a local directory
    Install { path: PathBuf },
    /// Uninstall an extension and delete its files
    Uninstall {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show detailed info about an installed extension
    Info { name: String },
    /// Validate an extension directory without loading it
    Check { path: PathBuf },
}

/// Parse "key=value" CLI arguments.
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{s}`"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// Build an invocation; flag values that parse as JSON keep their type.
fn invocation(args: Vec<String>, flags: Vec<(String, String)>) -> CommandInvocation {
    flags
        .into_iter()
        .fold(CommandInvocation::new(args), |inv, (key, raw)| {
            let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
            inv.with_flag(&key, value)
        })
}

/// Construct the runtime from config, wiring the terminal prompt and HTTP client.
pub fn build_runtime(config: &KeelConfig) -> keel_core::Result<ExtensionRuntime> {
    let services = HostServices {
        network: Arc::new(HttpNetworkClient::from_config(&config.services)?),
        prompt: Arc::new(TerminalPrompt),
        ..HostServices::default()
    };

    #[allow(unused_mut)]
    let mut builder =
        ExtensionRuntime::builder(RuntimeSettings::from_config(&config.extensions)).services(services);

    #[cfg(feature = "wasm")]
    {
        builder = builder.loader(Arc::new(keel_ext::WasmLoader::new()?));
    }
    #[cfg(not(feature = "wasm"))]
    warn!("built without the `wasm` feature; extension entry files cannot be loaded");

    Ok(builder.build())
}

/// Build the runtime and, if configured, load everything installed.
async fn start_runtime(config: &KeelConfig) -> keel_core::Result<ExtensionRuntime> {
    let runtime = build_runtime(config)?;
    if config.extensions.autoload {
        let report = runtime.discover().await;
        for failure in &report.failed {
            warn!(path = ?failure.path, error = %failure.error, "extension not loaded");
        }
    }
    Ok(runtime)
}

fn print_output(output: &keel_ext::CommandOutput) -> keel_core::Result<()> {
    println!("{}", output.content);
    if let Some(data) = &output.data {
        println!("{}", serde_json::to_string_pretty(data)?);
    }
    Ok(())
}

impl Cli {
    pub async fn run(self) -> keel_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };

        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
        match config.logging.format.as_str() {
            "json" => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_target(true)
                .init(),
            "compact" => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .compact()
                .with_target(false)
                .init(),
            _ => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init(),
        }
        info!(config = ?config_loader.path(), "configuration loaded");

        match self.command {
            Commands::Ext { action } => extensions::cmd_ext(config, action).await,
            Commands::Commands { json } => Self::cmd_commands(config, json).await,
            Commands::Run {
                command,
                args,
                flag,
            } => Self::cmd_run(config, command, invocation(args, flag)).await,
            Commands::Shell => shell::cmd_shell(config).await,
            Commands::Config { json } => Self::cmd_config(config, json),
            Commands::Doctor => Self::cmd_doctor(config),
            Commands::Completions { shell } => Self::cmd_completions(shell),
        }
    }

    async fn cmd_commands(config: KeelConfig, json: bool) -> keel_core::Result<()> {
        let runtime = start_runtime(&config).await?;
        let commands = runtime.list_commands();

        if json {
            println!("{}", serde_json::to_string_pretty(&commands)?);
        } else if commands.is_empty() {
            println!("No extension commands available.");
        } else {
            for c in commands {
                println!(
                    "  {} — {} {}",
                    style(&c.name).bold(),
                    c.description,
                    style(format!("({})", c.owning_extension)).dim()
                );
            }
        }
        Ok(())
    }

    async fn cmd_run(
        config: KeelConfig,
        command: String,
        invocation: CommandInvocation,
    ) -> keel_core::Result<()> {
        let runtime = start_runtime(&config).await?;
        let output = runtime.invoke(&command, invocation).await?;
        print_output(&output)
    }

    fn cmd_config(config: KeelConfig, json: bool) -> keel_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| KeelError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_doctor(config: KeelConfig) -> keel_core::Result<()> {
        println!("🩺 Keel Doctor — Configuration Audit");
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{e}");
                return Ok(());
            }
        };

        let mut warn_count = 0;
        let mut info_count = 0;
        for w in &warnings {
            println!("  {w}");
            match w.severity {
                WarningSeverity::Warning => warn_count += 1,
                WarningSeverity::Info => info_count += 1,
                WarningSeverity::Error => {}
            }
        }

        let dir = &config.extensions.dir;
        if dir.is_dir() {
            println!("  ✅ extensions.dir: {}", dir.display());
        } else {
            println!(
                "  💡 extensions.dir: {} does not exist yet (created on first install)",
                dir.display()
            );
            info_count += 1;
        }
        if let Some(dev) = &config.extensions.dev_dir {
            if !dev.is_dir() {
                println!("  ⚠️  extensions.dev_dir: {} does not exist", dev.display());
                warn_count += 1;
            }
        }
        if !cfg!(feature = "wasm") {
            println!("  ⚠️  built without the `wasm` feature: extensions cannot be loaded");
            warn_count += 1;
        }

        println!();
        if warn_count == 0 {
            println!("  {} No problems found ({info_count} notes)", style("✓").green());
        } else {
            println!(
                "  {} {warn_count} warning(s), {info_count} note(s)",
                style("!").yellow()
            );
        }
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> keel_core::Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "keel", &mut std::io::stdout());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn key_val_splits_on_first_equals() {
        assert_eq!(
            parse_key_val("to=a=b").unwrap(),
            ("to".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn flags_keep_json_types() {
        let inv = invocation(
            vec!["x".into()],
            vec![
                ("count".into(), "3".into()),
                ("name".into(), "alice".into()),
                ("dry".into(), "true".into()),
            ],
        );
        assert_eq!(inv.args, vec!["x"]);
        assert_eq!(inv.flags["count"], json!(3));
        assert_eq!(inv.flags["name"], json!("alice"));
        assert_eq!(inv.flags["dry"], json!(true));
    }

    #[test]
    fn run_collects_trailing_args() {
        let cli = Cli::try_parse_from(["keel", "run", "-f", "n=1", "demo-echo", "hi", "--raw"]).unwrap();
        match cli.command {
            Commands::Run { command, args, flag } => {
                assert_eq!(command, "demo-echo");
                assert_eq!(args, vec!["hi", "--raw"]);
                assert_eq!(flag, vec![("n".to_string(), "1".to_string())]);
            }
            _ => panic!("expected run"),
        }
    }
}
