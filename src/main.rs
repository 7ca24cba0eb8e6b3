//! dynffi - Dynamic Foreign Function Invocation
//!
//! Command-line entry point for calling exported native functions by name.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dynffi::config::DynffiConfig;
use dynffi::ffi::{CallingConvention, DynamicInvoker, TypeDescriptor, Value};
use dynffi::logging;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "dynffi")]
#[command(version)]
#[command(about = "Call exported functions of native libraries by name", long_about = None)]
struct Cli {
    /// Config file (default: nearest dynffi.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "dynffi=debug" (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a function and print its result
    Call {
        /// Library path or name
        library: PathBuf,

        /// Exported function name
        function: String,

        /// Return type (void, i32, i64, f32, f64, ptr, cstr)
        #[arg(short, long, default_value = "void")]
        returns: String,

        /// Calling convention (cdecl, stdcall)
        #[arg(long)]
        convention: Option<String>,

        /// Arguments: null, <type>:<value> or <elem>[]:<v,v,...>
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the address of exported symbols
    Resolve {
        /// Library path or name
        library: PathBuf,

        /// Symbol names
        #[arg(required = true)]
        symbols: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    logging::init(cli.log.as_deref().unwrap_or(&config.logging.filter));
    let invoker = DynamicInvoker::from_config(&config);

    let outcome = match cli.command {
        Commands::Call {
            library,
            function,
            returns,
            convention,
            args,
        } => cmd_call(&invoker, &library, &function, &returns, convention.as_deref(), &args),
        Commands::Resolve { library, symbols } => cmd_resolve(&invoker, &library, &symbols),
    };

    let unloaded = invoker.reset().context("Failed to unload libraries")?;
    tracing::debug!(unloaded, "unloaded libraries on exit");
    outcome
}

fn load_config(path: Option<&Path>) -> Result<DynffiConfig> {
    match path {
        Some(path) => DynffiConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => DynffiConfig::load_from_cwd().context("Failed to load dynffi.toml"),
    }
}

fn cmd_call(
    invoker: &DynamicInvoker,
    library: &Path,
    function: &str,
    returns: &str,
    convention: Option<&str>,
    args: &[String],
) -> Result<()> {
    let ret = TypeDescriptor::parse(returns)
        .ok_or_else(|| anyhow!("Unknown return type '{}'", returns))?;
    let convention = match convention {
        Some(name) => CallingConvention::parse(name)
            .ok_or_else(|| anyhow!("Unknown calling convention '{}'", name))?,
        None => invoker.default_convention(),
    };
    let values = args
        .iter()
        .map(|arg| Value::parse_literal(arg))
        .collect::<Result<Vec<_>, _>>()?;

    // The user vouches for the declared shape on the command line.
    let result = unsafe { invoker.invoke_with(library, function, convention, ret, &values) }
        .with_context(|| format!("Failed to call {} in {}", function, library.display()))?;

    if let Some(value) = result {
        println!("{}", value);
    }
    Ok(())
}

fn cmd_resolve(invoker: &DynamicInvoker, library: &Path, symbols: &[String]) -> Result<()> {
    for symbol in symbols {
        let address = invoker
            .resolve(library, symbol)
            .with_context(|| format!("Failed to resolve {} in {}", symbol, library.display()))?;
        println!("{}\t{}", symbol, address);
    }
    Ok(())
}
