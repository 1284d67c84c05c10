//! urteach console
//!
//! Line-oriented front end for a teach session: every line on stdin is one
//! operator action (connect, freedrive, record, grip, run, ...).

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use urteach::{Config, TeachSession};

#[derive(Parser)]
#[command(name = "urteach")]
#[command(about = "Teach a Universal Robots arm by demonstration and replay the routine")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Robot address, overriding robot.host
    #[arg(long)]
    host: Option<String>,

    /// Start without connecting telemetry or activating the gripper
    #[arg(long)]
    no_connect: bool,

    /// Debug logging for this crate
    #[arg(short, long)]
    verbose: bool,

    /// Print status as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("URTEACH_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }
}

#[derive(Debug, PartialEq)]
enum ConsoleCommand {
    Connect,
    Disconnect,
    Freedrive,
    EndFreedrive,
    Align,
    Stop,
    Open,
    Close,
    Activate,
    Record,
    Grip,
    Undo,
    Clear,
    List,
    Run,
    Script,
    Status,
    Send(String),
    Help,
    Quit,
}

const HELP: &str = "\
connect      open the RTDE state feed
disconnect   close the RTDE state feed
freedrive    enable freedrive
endfree      end freedrive
align        align the tool Z axis with the base
stop         stop motion
open|close   move the gripper
activate     reset and activate the gripper
record       record the current TCP pose
grip         record a gripper step for the current gripper state
undo         remove the last step
clear        remove all steps
list         show the recorded steps
script       show the compiled routine
run          compile and send the routine
status       show connection, freedrive and gripper state
send <code>  send one line of URScript
quit         exit";

fn parse_command(line: &str) -> std::result::Result<ConsoleCommand, String> {
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "connect" => ConsoleCommand::Connect,
        "disconnect" => ConsoleCommand::Disconnect,
        "freedrive" => ConsoleCommand::Freedrive,
        "endfree" => ConsoleCommand::EndFreedrive,
        "align" => ConsoleCommand::Align,
        "stop" => ConsoleCommand::Stop,
        "open" => ConsoleCommand::Open,
        "close" => ConsoleCommand::Close,
        "activate" => ConsoleCommand::Activate,
        "record" => ConsoleCommand::Record,
        "grip" => ConsoleCommand::Grip,
        "undo" => ConsoleCommand::Undo,
        "clear" => ConsoleCommand::Clear,
        "list" => ConsoleCommand::List,
        "run" => ConsoleCommand::Run,
        "script" => ConsoleCommand::Script,
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        "send" if rest.is_empty() => return Err("send needs a URScript line".to_string()),
        "send" => ConsoleCommand::Send(rest.to_string()),
        other => return Err(format!("Unknown command '{}', try 'help'", other)),
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    let default_filter = if args.verbose { "urteach=debug" } else { "urteach=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("urteach {}", env!("CARGO_PKG_VERSION"));
    info!("Using config: {}", config_path);

    let mut config = Config::load_from_path(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    if let Some(host) = &args.host {
        config.robot.host = host.clone();
    }
    info!("Robot: {}", config.robot.host);

    let activate_on_start = config.gripper.activate_on_start;
    let mut session = TeachSession::from_config(config).context("Failed to create teach session")?;

    if !args.no_connect {
        if let Err(e) = session.connect_telemetry().await {
            error!("Telemetry connect failed: {}", e);
            error!("Check that the robot is reachable and RTDE is enabled, then 'connect'");
        }
        if activate_on_start {
            if let Err(e) = session.activate_gripper().await {
                warn!("Gripper activation not sent: {}", e);
            }
        }
    }

    run_console(&mut session, args.json).await?;

    info!("Performing graceful shutdown");
    session.shutdown().await.context("Failed during shutdown")?;
    info!("Shutdown complete");
    Ok(())
}

async fn run_console(session: &mut TeachSession, json: bool) -> Result<()> {
    info!("Ready. Type 'help' for commands");

    let mut lines = BufReader::new(io::stdin()).lines();
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("End of input");
                    break;
                };
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                match parse_command(line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = execute(session, command, json).await {
                            error!("{}", e);
                        }
                    }
                    Err(message) => warn!("{}", message),
                }
            }
            _ = &mut shutdown => {
                info!("Interrupted");
                break;
            }
        }
    }
    Ok(())
}

async fn execute(session: &mut TeachSession, command: ConsoleCommand, json: bool) -> Result<()> {
    match command {
        ConsoleCommand::Connect => {
            session.connect_telemetry().await?;
            println!("Telemetry connected");
        }
        ConsoleCommand::Disconnect => session.disconnect_telemetry()?,
        ConsoleCommand::Freedrive => session.enable_freedrive().await?,
        ConsoleCommand::EndFreedrive => session.end_freedrive().await?,
        ConsoleCommand::Align => session.align_tool_z().await?,
        ConsoleCommand::Stop => session.stop().await?,
        ConsoleCommand::Open => {
            session.open_gripper().await?;
            println!("Gripper: {}", session.current_gripper_label());
        }
        ConsoleCommand::Close => {
            session.close_gripper().await?;
            println!("Gripper: {}", session.current_gripper_label());
        }
        ConsoleCommand::Activate => session.activate_gripper().await?,
        ConsoleCommand::Record => {
            session.record_pose().await?;
            print_last(session);
        }
        ConsoleCommand::Grip => {
            session.record_gripper_action();
            print_last(session);
        }
        ConsoleCommand::Undo => {
            if session.remove_last().is_none() {
                println!("Nothing to undo");
            }
        }
        ConsoleCommand::Clear => session.clear_all(),
        ConsoleCommand::List => {
            for line in session.transcript_lines() {
                println!("{}", line);
            }
        }
        ConsoleCommand::Script => println!("{}", session.compile_script()?),
        ConsoleCommand::Run => {
            session.compile_and_execute().await?;
            println!("Routine sent ({} steps)", session.sequence().len());
        }
        ConsoleCommand::Status => print_status(session, json)?,
        ConsoleCommand::Send(script) => session.send_raw(&script).await?,
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn print_last(session: &TeachSession) {
    if let Some(line) = session.transcript_lines().last() {
        println!("{}", line);
    }
}

fn print_status(session: &TeachSession, json: bool) -> Result<()> {
    let status = session.status();
    if json {
        println!("{}", serde_json::to_string(&status).context("Failed to serialize status")?);
        return Ok(());
    }

    println!("Robot:      {}", status.robot);
    match &status.connection.last_error {
        Some(error) => println!("Telemetry:  {:?} ({})", status.connection.telemetry, error),
        None => println!("Telemetry:  {:?}", status.connection.telemetry),
    }
    println!("Freedrive:  {}", status.freedrive_label);
    println!("Gripper:    {}", status.gripper_label);
    println!("Steps:      {}", status.steps);
    if let Some(frame) = status.snapshot.frame {
        println!("TCP pose:   {:?}", frame.tcp_pose);
        println!("Status:     {}", frame.status_bits);
    }
    Ok(())
}
