use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use taskbridge::dispatch::{DirectExecutor, MethodDispatcher, Operation, framed::serve_framed};
use taskbridge::{
    BridgeService, BrokerConfig, ClientConfig, CommandClient, CommandServer, EchoHandler,
    HostAgent, HostConfig, HttpConfig, ServerConfig,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const USAGE: &str = "\
Usage: taskbridge <command> [options]

Commands:
  coordinator [--host <host>] [--port <port>]
      Run the command server with the echo handler. Framed JSON-RPC is
      served on <port> + 1.
  bridge [--host <host>] [--port <port>]
      Run the HTTP bridge (command queue and /rpc).
  host --bridge-url <url> [--interval-ms <ms>]
      Poll a bridge and execute commands with the echo handler.
  send <text> [--addr <host:port>] [--timeout <secs>]
      Send one request to a coordinator and print the reply as JSON.

Environment:
  TASKBRIDGE_LOG     debug|info|warn|error [default: info]
  LOG_FORMAT         set to 'json' for JSON logs";

#[derive(Debug, PartialEq)]
enum Command {
    Coordinator {
        host: Option<String>,
        port: Option<u16>,
    },
    Bridge {
        host: Option<String>,
        port: Option<u16>,
    },
    Host {
        bridge_url: String,
        interval: Option<Duration>,
    },
    Send {
        text: String,
        addr: Option<String>,
        timeout: Option<Duration>,
    },
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    taskbridge::logging::init_tracing();

    match run(command).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let name = args.get(1).ok_or("missing command")?;
    let rest = &args[2..];

    let mut host = None;
    let mut port = None;
    let mut bridge_url = None;
    let mut interval = None;
    let mut addr = None;
    let mut timeout = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--host" => {
                i += 1;
                host = Some(rest.get(i).ok_or("--host requires a value")?.clone());
            }
            "--port" => {
                i += 1;
                let raw = rest.get(i).ok_or("--port requires a value")?;
                port = Some(raw.parse::<u16>().map_err(|_| format!("invalid port '{raw}'"))?);
            }
            "--bridge-url" => {
                i += 1;
                bridge_url = Some(rest.get(i).ok_or("--bridge-url requires a value")?.clone());
            }
            "--interval-ms" => {
                i += 1;
                let raw = rest.get(i).ok_or("--interval-ms requires a value")?;
                let ms = raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid interval '{raw}'"))?;
                interval = Some(Duration::from_millis(ms));
            }
            "--addr" => {
                i += 1;
                addr = Some(rest.get(i).ok_or("--addr requires a value")?.clone());
            }
            "--timeout" => {
                i += 1;
                let raw = rest.get(i).ok_or("--timeout requires a value")?;
                let secs = raw
                    .parse::<f64>()
                    .ok()
                    .and_then(|s| Duration::try_from_secs_f64(s).ok())
                    .ok_or_else(|| format!("invalid timeout '{raw}'"))?;
                timeout = Some(secs);
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let command = match name.as_str() {
        "coordinator" => Command::Coordinator { host, port },
        "bridge" => Command::Bridge { host, port },
        "host" => Command::Host {
            bridge_url: bridge_url.ok_or("host requires --bridge-url")?,
            interval,
        },
        "send" => {
            if positional.is_empty() {
                return Err("send requires <text>".to_string());
            }
            Command::Send {
                text: positional.join(" "),
                addr,
                timeout,
            }
        }
        "--help" | "-h" => return Err(String::new()),
        other => return Err(format!("unknown command: {other}")),
    };

    if !positional.is_empty() && !matches!(command, Command::Send { .. }) {
        return Err(format!("unexpected argument: {}", positional[0]));
    }
    Ok(command)
}

/// Returns `Ok(false)` when the command ran but did not succeed.
async fn run(command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Coordinator { host, port } => {
            let mut config = ServerConfig::from_env()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            run_coordinator(config).await?;
            Ok(true)
        }
        Command::Bridge { host, port } => {
            let mut config = HttpConfig::from_env()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let service = Arc::new(BridgeService::bridged(
                BrokerConfig::from_env()?,
                vec![Operation::new("execute", "Run a command on the execution host")],
            ));
            taskbridge::transport::serve(config, service).await?;
            Ok(true)
        }
        Command::Host {
            bridge_url,
            interval,
        } => {
            let mut config = HostConfig::default();
            if let Some(interval) = interval {
                config.poll_interval = interval;
            }
            let agent = HostAgent::new(bridge_url, Arc::new(EchoHandler), config)?;
            let shutdown = CancellationToken::new();
            spawn_ctrl_c(shutdown.clone());
            agent.run(shutdown).await;
            Ok(true)
        }
        Command::Send {
            text,
            addr,
            timeout,
        } => {
            let mut config = ClientConfig::from_env()?;
            if let Some(addr) = addr {
                config.addr = addr;
            }
            if let Some(timeout) = timeout {
                config.response_timeout = timeout;
            }
            let client = CommandClient::new(config);
            let reply = client.send(text).await;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(reply.success)
        }
    }
}

async fn run_coordinator(config: ServerConfig) -> anyhow::Result<()> {
    let rpc_port = if config.port == 0 { 0 } else { config.port.saturating_add(1) };
    let rpc_addr = format!("{}:{}", config.host, rpc_port);
    let max_frame_length = config.max_frame_length;

    let handler = Arc::new(EchoHandler);
    let server = CommandServer::bind(config, handler.clone())
        .await
        .context("binding command server")?;
    let handle = server.handle();

    let rpc_listener = TcpListener::bind(&rpc_addr)
        .await
        .with_context(|| format!("binding framed RPC on {rpc_addr}"))?;
    let dispatcher = Arc::new(
        MethodDispatcher::new(Arc::new(DirectExecutor::new(handler)))
            .with_operation(Operation::new("echo", "Echo the request back")),
    );

    let shutdown = CancellationToken::new();
    let rpc = tokio::spawn(serve_framed(
        rpc_listener,
        dispatcher,
        shutdown.clone(),
        max_frame_length,
    ));
    let server_task = tokio::spawn(server.run());

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
    }
    tracing::info!("Received SIGINT, shutting down...");

    shutdown.cancel();
    handle.shutdown().await;
    server_task.await.context("command server task")?;
    rpc.await.context("framed RPC task")??;
    Ok(())
}

fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        tracing::info!("Received SIGINT, shutting down...");
        shutdown.cancel();
    });
}
