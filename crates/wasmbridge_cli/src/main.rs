//! wasmbridge CLI
//!
//! Inspect, validate and run WASM modules through the host bridge.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wasmbridge_bridge::{Bridge, BridgeConfig, CallOptions, NativeType, NativeValue};
use wasmbridge_wasm::{ExportSignature, Imports, ImportDesc, Module};

#[derive(Parser)]
#[command(name = "wasmbridge")]
#[command(about = "wasmbridge - embeddable WASM execution core", long_about = None)]
struct Cli {
    /// Bridge config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show imports, exports and declarations of a module
    Inspect {
        /// Path to a .wasm file
        file: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Load and validate a module
    Validate {
        /// Path to a .wasm file
        file: PathBuf,
    },
    /// Call an export of a module with no imports
    Invoke {
        /// Path to a .wasm file
        file: PathBuf,
        /// Export name
        export: String,
        /// Arguments as JSON numbers
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,
        /// Declared native parameter types, comma separated (e.g. u32,f64)
        #[arg(long, value_delimiter = ',')]
        types: Option<Vec<String>>,
        /// Fuel budget
        #[arg(long)]
        fuel: Option<u64>,
        /// Deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Run `add` on the configured asset
    Add {
        /// First operand
        #[arg(allow_negative_numbers = true)]
        a: i32,
        /// Second operand
        #[arg(allow_negative_numbers = true)]
        b: i32,
    },
}

#[derive(Serialize)]
struct Inspection {
    hash: String,
    size: usize,
    functions: usize,
    imports: Vec<String>,
    exports: Vec<ExportSignature>,
    memory: Option<String>,
    table: Option<String>,
    start: Option<u32>,
}

fn inspect(module: &Module) -> Inspection {
    let imports = module
        .imports()
        .iter()
        .map(|import| {
            let ty = match &import.desc {
                ImportDesc::Func(idx) => module
                    .signature(*idx)
                    .map_or_else(|| "func".to_string(), |sig| format!("func {}", sig)),
                ImportDesc::Global(ty) => format!("global {}", ty),
                other => other.kind().to_string(),
            };
            format!("{}.{}: {}", import.module, import.field, ty)
        })
        .collect();
    Inspection {
        hash: module.hash().to_hex(),
        size: module.size(),
        functions: module.function_count(),
        imports,
        exports: module.export_signatures(),
        memory: module.memory().map(|m| m.limits.to_string()),
        table: module.table().map(|t| t.limits.to_string()),
        start: module.start(),
    }
}

fn print_inspection(report: &Inspection) {
    println!("hash:      {}", report.hash);
    println!("size:      {} bytes", report.size);
    println!("functions: {}", report.functions);
    if let Some(memory) = &report.memory {
        println!("memory:    {} pages", memory);
    }
    if let Some(table) = &report.table {
        println!("table:     {}", table);
    }
    if let Some(start) = report.start {
        println!("start:     function {}", start);
    }
    println!("imports:");
    for import in &report.imports {
        println!("  {}", import);
    }
    println!("exports:");
    for export in &report.exports {
        match &export.signature {
            Some(sig) => println!("  {} {}: {}", export.kind, export.name, sig),
            None => println!("  {} {}", export.kind, export.name),
        }
    }
}

fn parse_args(args: &[String]) -> Result<Vec<NativeValue>> {
    args.iter()
        .map(|arg| {
            serde_json::from_str::<NativeValue>(arg)
                .wrap_err_with(|| format!("argument {:?} is not a number", arg))
        })
        .collect()
}

fn parse_types(types: &[String]) -> Result<Vec<NativeType>> {
    types
        .iter()
        .map(|ty| {
            serde_json::from_value::<NativeType>(serde_json::Value::String(ty.trim().to_string()))
                .wrap_err_with(|| format!("unknown native type {:?}", ty))
        })
        .collect()
}

fn read(file: &Path) -> Result<Vec<u8>> {
    std::fs::read(file).wrap_err_with(|| format!("cannot read {}", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wasmbridge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::default(),
    };
    let bridge = Arc::new(Bridge::new(config));

    match cli.command {
        Commands::Inspect { file, json } => {
            let id = bridge.load(&read(&file)?)?;
            let module: Arc<Module> = bridge.module(id)?;
            let report = inspect(&module);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_inspection(&report);
            }
            Ok(())
        }
        Commands::Validate { file } => {
            bridge.load(&read(&file)?)?;
            println!("{}: valid", file.display());
            Ok(())
        }
        Commands::Invoke {
            file,
            export,
            args,
            types,
            fuel,
            timeout_ms,
        } => {
            let module = bridge.load(&read(&file)?)?;
            let instance = bridge.instantiate(module, &Imports::new())?;
            let args = parse_args(&args)?;
            let results = match (types, fuel) {
                (None, None) => {
                    bridge
                        .call_export_async(instance, &export, args, timeout_ms.map(Duration::from_millis))
                        .await?
                }
                (types, fuel) => {
                    if timeout_ms.is_some() {
                        return Err(eyre!("--timeout-ms cannot be combined with --types or --fuel"));
                    }
                    let mut options = CallOptions::new();
                    if let Some(types) = types {
                        options = options.with_param_types(parse_types(&types)?);
                    }
                    if let Some(fuel) = fuel {
                        options = options.with_fuel(fuel);
                    }
                    bridge.call_export_with(instance, &export, &args, &options)?
                }
            };
            println!("{}", serde_json::to_string(&results)?);
            Ok(())
        }
        Commands::Add { a, b } => {
            println!("{}", bridge.add(a, b)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_invoke() {
        let cli = Cli::parse_from(["wasmbridge", "invoke", "m.wasm", "add", "-5", "7", "--types", "i32,u32"]);
        match cli.command {
            Commands::Invoke { args, types, .. } => {
                assert_eq!(args, vec!["-5", "7"]);
                let types = parse_types(&types.unwrap()).unwrap();
                assert_eq!(types, vec![NativeType::I32, NativeType::U32]);
                assert_eq!(
                    parse_args(&args).unwrap(),
                    vec![NativeValue::Int(-5), NativeValue::Int(7)]
                );
            }
            _ => panic!("expected invoke"),
        }
    }

    #[test]
    fn test_parse_args_rejects_text() {
        assert!(parse_args(&["seven".to_string()]).is_err());
        assert!(parse_types(&["i128".to_string()]).is_err());
    }

    #[test]
    fn test_inspect_builtin() {
        let module = wasmbridge_wasm::load(wasmbridge_bridge::ADD_MODULE).unwrap();
        let report = inspect(&module);
        assert_eq!(report.functions, 1);
        assert!(report.imports.is_empty());
        assert_eq!(report.exports.len(), 1);
        assert_eq!(report.exports[0].name, "add");
        assert!(report.memory.is_none());
    }
}
