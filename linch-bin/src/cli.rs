use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use linch_config::{ConfigLoader, LinchConfig};
use linch_core::ExtensionId;
use linch_permission::{ConfirmationGate, ConfirmationResponse, builtin_policies};
use linch_runtime::{ExtensionRuntime, StaticModuleLoader};
use linch_sandbox::IsolateFactory;

/// Linch: extension lifecycle and trust engine
#[derive(Parser)]
#[command(name = "linch", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to linch.toml config file
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
    /// Load every extension and keep them running until Ctrl-C
    Run {
        /// Override the extensions directory
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Disable file watching
        #[arg(long)]
        no_hot_reload: bool,
        /// Approve every permission that asks for confirmation
        #[arg(long)]
        approve_all: bool,
    },
    /// Validate the config and every manifest without starting anything
    Check {
        /// Override the extensions directory
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// List the built-in permission policies
    Policies {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> linch_core::Result<()> {
        let loader = ConfigLoader::load(self.config.as_deref())?;
        let config = loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_tracing(&config.logging.format, log_level);

        match self.command {
            Commands::Run {
                dir,
                no_hot_reload,
                approve_all,
            } => Self::cmd_run(config, dir, no_hot_reload, approve_all).await,
            Commands::Check { dir } => Self::cmd_check(config, dir).await,
            Commands::Policies { json } => Self::cmd_policies(json),
            Commands::Config { json } => Self::cmd_config(&config, json),
        }
    }

    async fn cmd_run(
        mut config: LinchConfig,
        dir: Option<PathBuf>,
        no_hot_reload: bool,
        approve_all: bool,
    ) -> linch_core::Result<()> {
        if let Some(dir) = dir {
            config.extensions.dir = dir;
        }
        if no_hot_reload {
            config.hot_reload.enabled = false;
        }

        let runtime = ExtensionRuntime::new(config, Arc::new(StaticModuleLoader::new()), isolates());
        answer_confirmations(runtime.confirmation(), approve_all);
        runtime.start()?;

        let reports = runtime.load_all().await?;
        for report in &reports {
            match &report.result {
                Ok(id) => println!("  loaded  {id}  ({})", report.path.display()),
                Err(e) => println!("  failed  {}  [{}] {}", report.path.display(), e.code.as_str(), e.message),
            }
        }
        println!(
            "{} extension(s) loaded from {}. Press Ctrl-C to stop.",
            reports.iter().filter(|r| r.result.is_ok()).count(),
            runtime.config().extensions.dir.display()
        );

        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");

        let results = runtime.shutdown().await;
        for result in results.iter().filter(|r| !r.success()) {
            if let Err(e) = &result.result {
                warn!(extension = %result.extension_id, error = %e.message, "stop failed");
            }
        }
        Ok(())
    }

    async fn cmd_check(mut config: LinchConfig, dir: Option<PathBuf>) -> linch_core::Result<()> {
        if let Some(dir) = dir {
            config.extensions.dir = dir;
        }
        match config.validate() {
            Ok(warnings) if warnings.is_empty() => println!("config: ok"),
            Ok(warnings) => {
                for w in warnings {
                    println!("{w}");
                }
            }
            Err(e) => return Err(linch_core::LinchError::Config(e)),
        }

        let runtime = ExtensionRuntime::new(config, Arc::new(StaticModuleLoader::new()), isolates());
        let manager = runtime.manager();
        let mut failures = 0usize;
        for dir in manager.discover().await? {
            let checked = match manager.read_manifest(&dir).await {
                Ok(manifest) => {
                    let metadata = manifest.to_metadata();
                    metadata.validate().map(|_| metadata)
                }
                Err(e) => Err(e),
            };
            match checked {
                Ok(metadata) => println!(
                    "  ok      {} {}  deps=[{}] permissions=[{}]",
                    metadata.id,
                    metadata.version,
                    join(metadata.dependencies.iter().map(ExtensionId::as_str)),
                    join(metadata.permissions.iter().map(String::as_str)),
                ),
                Err(e) => {
                    failures += 1;
                    println!("  invalid {}  [{}] {}", dir.display(), e.code().as_str(), e);
                }
            }
        }

        if failures > 0 {
            return Err(linch_core::LinchError::Config(format!(
                "{failures} extension manifest(s) failed validation"
            )));
        }
        Ok(())
    }

    fn cmd_policies(json: bool) -> linch_core::Result<()> {
        let policies = builtin_policies();
        if json {
            let list: Vec<serde_json::Value> = policies
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.name,
                        "description": p.description,
                        "level": p.level.to_string(),
                        "requiresUserConfirmation": p.requires_user_confirmation,
                        "dependencies": p.dependencies,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
            return Ok(());
        }

        for p in &policies {
            let confirm = if p.requires_user_confirmation { "  (confirm)" } else { "" };
            println!("{:<22} {:<9} {}{}", p.name, p.level.to_string(), p.description, confirm);
            if !p.dependencies.is_empty() {
                println!("{:<32} needs {}", "", p.dependencies.join(", "));
            }
        }
        Ok(())
    }

    fn cmd_config(config: &LinchConfig, json: bool) -> linch_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!("{config:#?}");
        }
        Ok(())
    }
}

fn init_tracing(format: &str, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    match format {
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
}

#[cfg(not(feature = "wasm"))]
fn isolates() -> Arc<dyn IsolateFactory> {
    Arc::new(linch_sandbox::NativeModules::new())
}

#[cfg(feature = "wasm")]
fn isolates() -> Arc<dyn IsolateFactory> {
    Arc::new(linch_sandbox::WasmIsolateFactory)
}

/// Answer permission confirmations from the command line flags. There is
/// no interactive prompt; without `--approve-all` every request is denied.
fn answer_confirmations(gate: &ConfirmationGate, approve_all: bool) {
    let Some(mut requests) = gate.take_receiver() else {
        return;
    };
    tokio::spawn(async move {
        while let Some((request, reply)) = requests.recv().await {
            let response = if approve_all {
                ConfirmationResponse::Approved
            } else {
                ConfirmationResponse::Denied
            };
            info!(
                extension = %request.extension,
                permission = %request.permission,
                level = %request.level,
                ?response,
                "permission confirmation answered"
            );
            let _ = reply.send(response);
        }
    });
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(", ")
}
