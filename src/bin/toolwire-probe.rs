//! toolwire-probe: poke at an MCP tool server from the command line.
//!
//! ```text
//! toolwire-probe tools -- npx tsx src/index.ts
//! toolwire-probe call fetch_url --args '{"url":"https://example.com"}' --server fetch
//! toolwire-probe read file:///etc/hosts --config servers.yaml --server files
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use toolwire::logging::{self, LogConfig};
use toolwire::mcp_client::config::resolve_config_path;
use toolwire::{ServersConfig, SessionConfig, SessionManager};

#[derive(Parser, Debug)]
#[command(name = "toolwire-probe")]
#[command(version)]
#[command(about = "Connect to an MCP tool server over stdio and run one request")]
struct Cli {
    /// Log filter directives (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_filter: Option<String>,

    /// Write logs to a file instead of stderr (`--log-file=PATH`; bare flag uses
    /// probe.log in the toolwire data directory)
    #[arg(long, global = true, num_args = 0..=1, require_equals = true)]
    log_file: Option<Option<PathBuf>>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn log_path(&self) -> Option<PathBuf> {
        self.log_file
            .clone()
            .map(|path| path.unwrap_or_else(|| logging::default_log_dir().join("probe.log")))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the server's tools
    Tools {
        #[command(flatten)]
        target: Target,
    },
    /// List the server's resources
    Resources {
        #[command(flatten)]
        target: Target,
    },
    /// Call a tool
    Call {
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        #[command(flatten)]
        target: Target,
    },
    /// Read a resource by URI
    Read {
        uri: String,
        #[command(flatten)]
        target: Target,
    },
}

/// Which server to talk to: an entry of a servers file, or a command after `--`.
#[derive(Args, Debug)]
struct Target {
    /// Servers config file (defaults to $TOOLWIRE_SERVERS_CONFIG, then ./mcp-servers.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server name: picks the config entry, or names the `--` command's session
    #[arg(short, long)]
    server: Option<String>,

    /// Extra environment for the server process (KEY=VALUE, repeatable)
    #[arg(short, long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Server command and arguments
    #[arg(last = true)]
    command: Vec<String>,
}

impl Target {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match self.command.split_first() {
            Some((program, args)) => {
                let name = self.server.clone().unwrap_or_else(|| "probe".to_string());
                SessionConfig::new(name, program.as_str()).args(args.iter().cloned())
            }
            None => self.from_servers_file()?,
        };

        for (key, value) in &self.env {
            config = config.env(key.as_str(), value.as_str());
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout_ms = Some(ms);
        }
        Ok(config)
    }

    fn from_servers_file(&self) -> Result<SessionConfig> {
        let path = resolve_config_path(self.config.as_deref());
        let mut configs = ServersConfig::load(&path)?.into_session_configs();

        match &self.server {
            Some(name) => configs
                .into_iter()
                .find(|c| &c.name == name)
                .with_context(|| format!("no enabled server '{name}' in {}", path.display())),
            None if configs.len() == 1 => Ok(configs.remove(0)),
            None => {
                let names: Vec<_> = configs.iter().map(|c| c.name.as_str()).collect();
                anyhow::bail!(
                    "{} defines {} servers, pick one with --server ({})",
                    path.display(),
                    configs.len(),
                    names.join(", ")
                )
            }
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs one command; returns whether it succeeded from the server's point of view.
async fn run(manager: &SessionManager, command: &Command, config: SessionConfig) -> Result<bool> {
    let session = manager.connect(config).await?;

    match command {
        Command::Tools { .. } => print_json(&session.list_tools().await?)?,
        Command::Resources { .. } => print_json(&session.list_resources().await?)?,
        Command::Call { tool, args, .. } => {
            let arguments: serde_json::Value =
                serde_json::from_str(args).context("--args must be valid JSON")?;
            let result = session.call_tool(tool, arguments).await?;
            print_json(&result)?;
            return Ok(!result.is_error);
        }
        Command::Read { uri, .. } => print_json(&session.read_resource(uri).await?)?,
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_tracing(&LogConfig {
        filter: cli.log_filter.clone(),
        json: cli.json_logs,
        file: cli.log_path(),
    })?;

    let target = match &cli.command {
        Command::Tools { target }
        | Command::Resources { target }
        | Command::Call { target, .. }
        | Command::Read { target, .. } => target,
    };
    let config = target.session_config()?;

    let manager = SessionManager::new();
    let outcome = run(&manager, &cli.command, config).await;
    manager.disconnect_all().await;

    match outcome? {
        true => Ok(ExitCode::SUCCESS),
        false => Ok(ExitCode::FAILURE),
    }
}
