//! Mapping runtime CLI entry point.
//!
//! Loads one guest module, registers the standard host imports, calls an
//! export with typed arguments and prints the result with its call stats.

mod args;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mapping_runtime_common::{ConfigFile, DebugLevel, RuntimeConfig};
use mapping_runtime_core::{
    CallContext, CallParams, CompiledModule, ExportSignature, Instance, WasmEngine,
};
use mapping_runtime_host::{LoggingHost, register_all};

/// Host runtime for AssemblyScript-style WebAssembly mapping modules.
#[derive(Parser)]
#[command(name = "mapping-runtime")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "MAPPING_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call one export of a guest module
    Call {
        /// Path to the module (.wasm or .wat)
        #[arg(short, long, conflicts_with = "name")]
        module: Option<PathBuf>,

        /// Name of a module listed in the configuration file
        #[arg(short, long)]
        name: Option<String>,

        /// Export to call
        #[arg(short, long)]
        export: String,

        /// Argument as kind:value (i32:5, string:hello, bytes:0x01ff)
        #[arg(short, long = "arg")]
        args: Vec<String>,

        /// Result kind, if the export returns a value
        #[arg(short, long)]
        returns: Option<String>,

        /// Number of times to call the export
        #[arg(long, default_value = "1")]
        times: u32,

        /// Per-call tracing verbosity
        #[arg(long, value_enum)]
        debug_level: Option<DebugArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DebugArg {
    Off,
    Calls,
    Imports,
}

impl From<DebugArg> for DebugLevel {
    fn from(arg: DebugArg) -> Self {
        match arg {
            DebugArg::Off => Self::Off,
            DebugArg::Calls => Self::Calls,
            DebugArg::Imports => Self::Imports,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,mapping_runtime=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_file = cli
        .config
        .as_deref()
        .map(ConfigFile::from_file)
        .transpose()
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Call {
            module,
            name,
            export,
            args,
            returns,
            times,
            debug_level,
        } => {
            let path = match (module, name) {
                (Some(path), _) => path,
                (None, Some(name)) => {
                    let entry = config_file
                        .as_ref()
                        .and_then(|file| file.module(&name))
                        .with_context(|| format!("module '{name}' is not configured"))?;
                    PathBuf::from(&entry.path)
                }
                (None, None) => bail!("either --module or --name is required"),
            };

            let mut config = config_file.map(|file| file.runtime).unwrap_or_default();
            if let Some(level) = debug_level {
                config.instance.debug_level = level.into();
            }

            call(&config, &path, &export, &args, returns.as_deref(), times)
        }
    }
}

fn call(
    config: &RuntimeConfig,
    path: &std::path::Path,
    export: &str,
    raw_args: &[String],
    returns: Option<&str>,
    times: u32,
) -> Result<()> {
    let engine = WasmEngine::new(&config.engine)?;
    let module = CompiledModule::from_file(engine.inner(), path)?;

    let name = path
        .file_stem()
        .map_or_else(|| "module".to_string(), |stem| stem.to_string_lossy().into_owned());
    let instance = Instance::from_module(name, &engine, module, config.instance.clone());

    let logging = LoggingHost::new();
    register_all(&instance, &logging)?;

    let params = raw_args
        .iter()
        .map(|arg| args::parse_value(arg).and_then(|value| args::kind_of(&value)))
        .collect::<Result<Vec<_>>>()?;
    let result = returns.map(args::parse_kind).transpose()?;
    instance.register_export(export, ExportSignature::new(params, result))?;

    instance.init()?;
    info!(instance = instance.name(), export, "Module ready");

    for _ in 0..times {
        let values = raw_args
            .iter()
            .map(|arg| args::parse_value(arg))
            .collect::<Result<Vec<_>>>()?;

        let ctx = CallContext::new();
        let outcome = instance.call_export(&ctx, CallParams::new(export), values);
        let logged = logging.take();
        if !logged.is_empty() {
            info!(entries = logged.len(), dropped = logging.dropped(), "Guest log drained");
        }

        match outcome {
            Ok(call) => {
                let rendered = call
                    .value
                    .as_ref()
                    .map_or_else(|| "(none)".to_string(), args::render_value);
                println!("result: {rendered}");
                print_stats(&call.stats);
            }
            Err(failure) => {
                print_stats(&failure.stats);
                return Err(failure.error.into());
            }
        }
    }

    println!(
        "instance: {} export calls, {} resets, memory usage {}",
        instance.export_call_count(),
        instance.reset_count(),
        instance.memory_usage().unwrap_or_default()
    );
    instance.close()?;
    Ok(())
}

fn print_stats(stats: &mapping_runtime_core::CallStats) {
    println!(
        "stats: duration={:?} export_calls={} import_calls={} import_duration={:?} memory_delta={}",
        stats.duration,
        stats.export_calls,
        stats.import_calls,
        stats.import_duration,
        stats.memory_delta
    );
}
