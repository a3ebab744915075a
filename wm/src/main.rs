//! widgetmaster - widget hosting master
//!
//! CLI entry point: runs the master and talks to it over the debug channel.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::Value;
use tracing::info;

use widgetmaster::args;
use widgetmaster::cli::{Cli, Command, CtrlOp, DaemonCommand, PkgOp, get_log_path};
use widgetmaster::config::Config;
use widgetmaster::daemon::DaemonManager;
use widgetmaster::ipc::DebugClient;
use widgetmaster::protocol::Args;
use widgetmaster::server::run_master;

fn setup_logging(cli_level: Option<&str>, config_path: Option<&PathBuf>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).context("Failed to create log directory")?;
    }

    // CLI flag wins over the config file
    let level = cli_level
        .map(str::to_string)
        .or_else(|| Config::load_log_level(config_path))
        .unwrap_or_else(|| "info".to_string());
    let directive = level
        .parse::<tracing::Level>()
        .map_err(|_| eyre::eyre!("Invalid log level: {}", level))?;

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.into()))
        .init();

    info!(%level, "Logging initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref(), cli.config.as_ref()).context("Failed to setup logging")?;
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Some(Command::Daemon { command }) => match command {
            DaemonCommand::Start { foreground } => cmd_start(config, cli.config.as_ref(), foreground).await,
            DaemonCommand::Stop => cmd_stop(),
            DaemonCommand::Status => cmd_status(),
        },
        Some(Command::PkgList) => cmd_listing(&config, "pkgList", args![]).await,
        Some(Command::InstList { pkg }) => cmd_listing(&config, "instList", args![pkg.unwrap_or_default()]).await,
        Some(Command::SlaveList) => cmd_listing(&config, "slaveList", args![]).await,
        Some(Command::PkgCtrl { op, pkg, id }) => cmd_pkg_ctrl(&config, op, &pkg, id).await,
        Some(Command::MasterCtrl { op, key, value }) => cmd_master_ctrl(&config, op, &key, value).await,
        Some(Command::RunDaemon) => cmd_run_daemon(config).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

fn debug_client(config: &Config) -> Result<DebugClient> {
    let client = DebugClient::with_socket_path(config.sockets.debug_path());
    if !client.socket_exists() {
        return Err(eyre::eyre!(
            "Master is not running (no socket at {})",
            config.sockets.debug_path().display()
        ));
    }
    Ok(client)
}

async fn cmd_start(config: Config, config_path: Option<&PathBuf>, foreground: bool) -> Result<()> {
    let daemon = DaemonManager::new();
    if let Some(pid) = daemon.running_pid() {
        println!("widgetmaster is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        println!("Starting widgetmaster in foreground mode...");
        run_master(config).await
    } else {
        let pid = daemon.start(config_path)?;
        println!("widgetmaster started (PID: {})", pid);
        Ok(())
    }
}

fn cmd_stop() -> Result<()> {
    let daemon = DaemonManager::new();
    let Some(pid) = daemon.running_pid() else {
        println!("widgetmaster is not running");
        return Ok(());
    };
    daemon.stop()?;
    println!("widgetmaster stopped (was PID: {})", pid);
    Ok(())
}

fn cmd_status() -> Result<()> {
    let daemon = DaemonManager::new();
    let status = daemon.status();

    println!("widgetmaster Status");
    println!("-------------------");
    match status.pid {
        Some(pid) => {
            println!("Status: {}", "running".green());
            println!("PID: {}", pid);
            if !daemon.version_matches() {
                println!(
                    "{} daemon reports version {}, this binary is {}",
                    "warning:".yellow(),
                    status.version.as_deref().unwrap_or("unknown"),
                    widgetmaster::daemon::VERSION
                );
            }
        }
        None => println!("Status: {}", "stopped".red()),
    }
    println!("PID file: {}", status.pid_file.display());
    Ok(())
}

async fn cmd_run_daemon(config: Config) -> Result<()> {
    let daemon = DaemonManager::new();
    daemon.register_self()?;
    let result = run_master(config).await;
    daemon.unregister_self()?;
    result
}

async fn cmd_listing(config: &Config, verb: &str, args: Args) -> Result<()> {
    let rows = debug_client(config)?.listing(verb, args).await?;
    if rows.is_empty() {
        println!("{}", "(none)".dimmed());
        return Ok(());
    }
    for row in &rows {
        print_row(row);
    }
    Ok(())
}

/// One record per line: its name in bold, the other fields as key=value
fn print_row(row: &Value) {
    let Some(fields) = row.as_object() else {
        println!("{}", row);
        return;
    };
    let title_keys: &[&str] = if fields.contains_key("name") { &["name"] } else { &["pkg", "id"] };
    let title: Vec<String> = title_keys.iter().filter_map(|k| fields.get(*k)).map(show).collect();
    let rest: Vec<String> = fields
        .iter()
        .filter(|(k, _)| !title_keys.contains(&k.as_str()))
        .map(|(k, v)| format!("{}={}", k.cyan(), show(v)))
        .collect();
    println!("{} {}", title.join(" ").bold(), rest.join(" "));
}

fn show(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

async fn cmd_pkg_ctrl(config: &Config, op: PkgOp, pkg: &str, id: Option<String>) -> Result<()> {
    let mut args = args![op.as_str(), pkg];
    match (op, id) {
        (PkgOp::Rmpack, _) => {}
        (_, Some(id)) => args.push(id),
        (PkgOp::Rminst, None) => return Err(eyre::eyre!("rminst needs an instance id")),
        (PkgOp::Faultinst, None) => args.push(""),
    }
    debug_client(config)?.request("pkgCtrl", args).await?;
    println!("{} {} {}", "ok".green(), op.as_str(), pkg);
    Ok(())
}

async fn cmd_master_ctrl(config: &Config, op: CtrlOp, key: &str, value: Option<String>) -> Result<()> {
    let mut args = args![op.as_str(), key];
    if op == CtrlOp::Set {
        let value = value.ok_or_else(|| eyre::eyre!("set needs a value"))?;
        args.push(parse_tunable(&value)?);
    }
    let reply = debug_client(config)?.request("masterCtrl", args).await?;
    let shown = reply.0.get(1).map(|v| v.to_string()).unwrap_or_default();
    println!("{} = {}", key.bold(), shown);
    Ok(())
}

fn parse_tunable(value: &str) -> Result<i64> {
    match value {
        "on" | "true" => Ok(1),
        "off" | "false" => Ok(0),
        _ => value.parse().context(format!("Not a number: {}", value)),
    }
}
