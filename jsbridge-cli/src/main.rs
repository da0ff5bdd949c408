//! Command-line front end for the jsbridge engine host

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use jsbridge::{BridgeConfig, ConsoleLevel, HostBindings, HostObject, InitOptions, JsHost};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "jsbridge",
    version,
    about = "Run JavaScript against the embedded engine host"
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory packaged scripts resolve against
    #[arg(long, global = true)]
    script_root: Option<PathBuf>,

    /// Packaged script to run during initialization (repeatable)
    #[arg(long = "bootstrap", global = true)]
    bootstrap: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate an expression and print its result
    Eval {
        /// Script text to evaluate
        expression: String,
    },
    /// Run a script file and print its result
    Run {
        /// Path to the script file
        file: PathBuf,
    },
    /// Download a script over HTTP, run it, and print its result
    Fetch {
        /// Absolute URL of the script
        url: String,
    },
    /// Interactive read-eval-print loop
    Repl,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("jsbridge=debug,jsbridge_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run(cli).await {
        eprintln!("jsbridge: {error:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let host = JsHost::new(config);
    host.initialize(InitOptions::with_bindings(default_bindings()))
        .await?;
    tracing::debug!("engine initialized");

    match cli.command {
        Command::Eval { expression } => {
            let result = host.run(&expression).await?;
            println!("{result}");
        }
        Command::Run { file } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let result = host.run(&source).await?;
            println!("{result}");
        }
        Command::Fetch { url } => {
            let result = host.add_script_http_reference(&url).await?;
            println!("{result}");
        }
        Command::Repl => repl(&host).await?,
    }

    host.close().await?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => BridgeConfig::default(),
    };
    if let Some(root) = &cli.script_root {
        config.script_root = Some(root.clone());
    }
    config.bootstrap.extend(cli.bootstrap.iter().cloned());
    Ok(config)
}

/// Bindings every CLI session gets: a `print` function, a read-only `host`
/// info object, and console output on stderr
fn default_bindings() -> HostBindings {
    HostBindings::new()
        .function("print", |args| {
            let line = args
                .iter()
                .map(render_argument)
                .collect::<Vec<_>>()
                .join(" ");
            println!("{line}");
            Ok(serde_json::Value::Null)
        })
        .object("host", HostInfo::new())
        .console_sink(console_to_stderr)
}

fn render_argument(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn console_to_stderr(level: ConsoleLevel, message: &str) {
    let tag = match level {
        ConsoleLevel::Error => "error",
        ConsoleLevel::Warn => "warn",
        ConsoleLevel::Debug => "debug",
        ConsoleLevel::Log | ConsoleLevel::Info => "info",
    };
    eprintln!("[{tag}] {message}");
}

struct HostInfo {
    started: std::time::Instant,
}

impl HostInfo {
    fn new() -> Self {
        Self {
            started: std::time::Instant::now(),
        }
    }
}

impl HostObject for HostInfo {
    fn properties(&self) -> Vec<String> {
        vec![
            "name".to_string(),
            "version".to_string(),
            "platform".to_string(),
        ]
    }

    fn methods(&self) -> Vec<String> {
        vec!["uptimeMs".to_string()]
    }

    fn get(&mut self, property: &str) -> Result<serde_json::Value, String> {
        match property {
            "name" => Ok(serde_json::json!("jsbridge")),
            "version" => Ok(serde_json::json!(env!("CARGO_PKG_VERSION"))),
            "platform" => Ok(serde_json::json!(std::env::consts::OS)),
            other => Err(format!("unknown property '{other}'")),
        }
    }

    fn set(&mut self, property: &str, _value: serde_json::Value) -> Result<(), String> {
        Err(format!("property '{property}' is read-only"))
    }

    fn invoke(
        &mut self,
        method: &str,
        _args: &[serde_json::Value],
    ) -> Result<serde_json::Value, String> {
        match method {
            "uptimeMs" => Ok(serde_json::json!(self.started.elapsed().as_millis() as u64)),
            other => Err(format!("unknown method '{other}'")),
        }
    }
}

async fn repl(host: &JsHost) -> Result<()> {
    use std::io::{BufRead, Write};

    println!(
        "jsbridge {} interactive shell, .exit to quit",
        env!("CARGO_PKG_VERSION")
    );
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("js> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == ".exit" {
            break;
        }
        match host.run(trimmed).await {
            Ok(result) => println!("{result}"),
            Err(error) => eprintln!("error: {error}"),
        }
    }
    Ok(())
}
