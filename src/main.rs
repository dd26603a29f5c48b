//! Purpose: `cafhost` CLI entry point for inspecting and exercising subsystem modules.
//! Role: Binary crate root; parses args, builds a `Host`, runs one command, emits JSON on stdout.
//! Invariants: Errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
//! Invariants: Diagnostics go through `tracing` on stderr; stdout carries only results.
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use cafbase::component::{CafObject, IID_OBJECT, InterfaceId, SmartRef};
use cafbase::core::config::{JsonFileConfig, MemoryConfig};
use cafbase::{Error, ErrorKind, Host, SubsystemHandle, to_exit_code};
use clap::{CommandFactory, Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(clap_error_summary(&err)));
            }
        },
    };

    command_dispatch::dispatch_command(cli.command, cli.config)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "cafhost",
    version,
    about = "Load CAF subsystem modules and create their objects",
    long_about = None,
    after_help = r#"EXAMPLES
  $ cafhost --config caf.json list
  $ cafhost --config caf.json load Caf.Echo --unload
  $ cafhost --config caf.json create Caf.Echo
  $ cafhost which cos --library libm.so.6

Subsystems are read from the "subsystems" section of the JSON config:
  { "subsystems": { "Caf.Echo": "/usr/lib/caf/libecho_subsystem.so" } }"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "CAF_CONFIG",
        help = "JSON config file with a \"subsystems\" section"
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "List registered subsystems and their module paths")]
    List,
    #[command(about = "Show the module path a subsystem identifier resolves to")]
    Resolve {
        #[arg(help = "Subsystem identifier")]
        identifier: String,
    },
    #[command(about = "Load a subsystem module and report its handle")]
    Load {
        #[arg(help = "Subsystem identifier")]
        identifier: String,
        #[arg(long, help = "Give the module back afterwards if it can unload now")]
        unload: bool,
    },
    #[command(about = "Create an object from a subsystem and release it")]
    Create {
        #[arg(help = "Subsystem identifier")]
        identifier: String,
        #[arg(long, help = "Object identifier (defaults to the subsystem identifier)")]
        object: Option<String>,
        #[arg(long, help = "Interface id to request (defaults to the base object id)")]
        iid: Option<String>,
    },
    #[command(about = "Find the library that provides a symbol")]
    Which {
        #[arg(help = "Symbol name")]
        symbol: String,
        #[arg(long, help = "Library to search instead of the global symbol table")]
        library: Option<String>,
    },
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn build_host(config: Option<PathBuf>) -> Result<Host, Error> {
    let Some(path) = config else {
        tracing::debug!("no config given; no subsystems are registered");
        return Ok(Host::new(MemoryConfig::new()));
    };
    Ok(Host::new(JsonFileConfig::load(path)?))
}

fn emit_json(value: Value) {
    let encoded = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    let json = encoded.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert(
        "message".to_string(),
        json!(err.message().unwrap_or("subsystem operation failed")),
    );
    if let Some(identifier) = err.identifier() {
        inner.insert("identifier".to_string(), json!(identifier));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn emit_error(err: &Error) {
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"UnknownFailure\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn parse_iid(value: Option<&str>) -> Result<InterfaceId, Error> {
    match value {
        Some(text) => InterfaceId::parse(text),
        None => Ok(IID_OBJECT),
    }
}

fn handle_json(host: &Host, subsystem: &SubsystemHandle<'_>) -> Value {
    let Some(handle) = subsystem.module_handle() else {
        return Value::Null;
    };
    let path = host
        .loader()
        .library_name_from_handle(handle)
        .map(|path| path.display().to_string())
        .ok();
    json!({
        "handle": format!("{:#x}", handle.as_raw() as usize),
        "path": path,
        "ref_count": host.loader().ref_count(handle),
    })
}

fn registered_json(host: &Host) -> Vec<Value> {
    host.registry()
        .identifiers()
        .into_iter()
        .map(|identifier| {
            let path = host
                .registry()
                .module_path(&identifier)
                .map(|path| path.display().to_string())
                .ok();
            json!({ "identifier": identifier, "path": path })
        })
        .collect()
}

fn created_json(object: &SmartRef<CafObject>, identifier: &str, iid: &InterfaceId) -> Value {
    json!({
        "object": identifier,
        "iid": iid.to_string(),
        "created": !object.is_null(),
    })
}

