//! Command-line interface for Electrum servers.
//!
//! Calls one method and pretty-prints the result. With `--subscribe` the
//! method is treated as a subscription and notifications are printed until
//! interrupted or the server goes away.

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing_subscriber::filter::LevelFilter;

use stratum_rpc::rpc::{ClientConfig, StratumClient};
use stratum_rpc::server::{PROTOCOL_TCP, PROTOCOL_TLS, ServerInfo, default_port};
use stratum_rpc::tracing::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "stratum-cli", author, version, about, long_about = None)]
struct Args {
    /// Method to call, e.g. server.banner or blockchain.headers.subscribe
    method: String,

    /// Positional arguments; integers are sent as numbers
    args: Vec<String>,

    /// Server hostname
    #[arg(short = 's', long, env = "STRATUM_SERVER")]
    server: String,

    /// Transport protocol
    #[arg(long, value_enum, default_value_t = Protocol::Tcp)]
    protocol: Protocol,

    /// Server port; defaults to 50001 for TCP and 50002 for TLS
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Accept any TLS certificate (always the case for onion hosts)
    #[arg(long)]
    no_verify: bool,

    /// SOCKS5 proxy (host:port); onion hosts use Tor's default if unset
    #[arg(long, env = "STRATUM_PROXY")]
    proxy: Option<String>,

    /// Keep the connection open and print notifications
    #[arg(long)]
    subscribe: bool,

    /// Debug-level logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Protocol {
    Tcp,
    Tls,
}

impl Protocol {
    fn code(self) -> char {
        match self {
            Protocol::Tcp => PROTOCOL_TCP,
            Protocol::Tls => PROTOCOL_TLS,
        }
    }
}

/// Describe the server named on the command line.
fn server_info(args: &Args) -> ServerInfo {
    let code = args.protocol.code();
    let port = args.port.or_else(|| default_port(code)).unwrap_or_default();
    ServerInfo::new(&args.server, &args.server, format!("{}{}", code, port))
}

/// Integer-looking arguments become JSON numbers; anything else is a string.
fn parse_arg(arg: &str) -> Value {
    match arg.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(arg.to_string()),
    }
}

fn pretty(value: &Value) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    stratum_rpc::tracing::init_stdout_with(if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    });

    let server = server_info(&args);
    let connector =
        server.connector(args.protocol.code(), args.proxy.as_deref(), !args.no_verify)?;
    let config = ClientConfig::default()
        .with_client_name(concat!("stratum-cli/", env!("CARGO_PKG_VERSION")))
        .with_short_term(!args.subscribe);
    let client = StratumClient::new(connector, config);

    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", client.describe()))?;

    if let Some(version) = client.server_version() {
        println!("Server: {} (protocol {})", version.software, version.protocol);
    }

    let params: Vec<Value> = args.args.iter().map(|a| parse_arg(a)).collect();

    if !args.subscribe {
        let result = client.call(&args.method, params)?.await?;
        println!("{}", pretty(&result)?);
        client.close();
        return Ok(());
    }

    let (initial, mut notifications) = client.subscribe(&args.method, params)?;
    println!("{}", pretty(&initial.await?)?);

    loop {
        tokio::select! {
            next = notifications.recv() => match next {
                Some(payload) => println!("{}", pretty(&payload)?),
                None => bail!("connection to {} lost", client.describe()),
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
        }
    }

    client.close();
    Ok(())
}
