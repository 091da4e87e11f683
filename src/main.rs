//! nvim-rpc-broker - standalone host for the broker.
//!
//! Stands in for the embedding editor: it starts a broker, connects to its
//! own control port like the editor plugin would, and drains the queue on
//! the main thread whenever a control frame arrives or the idle tick
//! elapses. Handlers serve a small in-memory variable store, enough to
//! exercise the broker from any msgpack-rpc client.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nvim_rpc_broker::{
    Broker, BrokerConfig, CallContext, Dispatcher, FnTable, HandlerError, JobCommand, Value,
};

/// Log to this file instead of stderr.
const LOG_FILE_ENV: &str = "NVIM_RPC_LOG_FILE";
/// Default log level when `RUST_LOG` is unset.
const LOG_LEVEL_ENV: &str = "NVIM_RPC_LOG_LEVEL";

#[derive(Parser, Debug)]
#[command(name = "nvim-rpc-broker", version)]
#[command(about = "msgpack-rpc broker with a built-in demo host")]
struct Args {
    /// RPC listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Control channel listen address
    #[arg(long)]
    control: Option<SocketAddr>,

    /// Config file (JSON); defaults to the user config dir if present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shell command to run as a job channel (repeatable)
    #[arg(long = "job", value_name = "CMD")]
    jobs: Vec<String>,

    /// How long shutdown waits for channels before killing them
    #[arg(long)]
    shutdown_timeout_ms: Option<u64>,

    /// Drain interval when no wake-up arrives
    #[arg(long)]
    idle_tick_ms: Option<u64>,
}

fn init_logging() -> Result<()> {
    let level = std::env::var(LOG_LEVEL_ENV)
        .map(|level| level.to_lowercase())
        .unwrap_or_else(|_| "info".into());
    let filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("nvim_rpc_broker={}", level)),
    );

    match std::env::var_os(LOG_FILE_ENV) {
        Some(path) => {
            let file = File::create(&path)
                .with_context(|| format!("Failed to open log file {}", PathBuf::from(&path).display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = BrokerConfig::discover(args.config.as_deref())?;
    config.apply_env()?;
    if let Some(addr) = args.listen {
        config.listen_addr = addr;
    }
    if let Some(addr) = args.control {
        config.control_addr = addr;
    }
    if let Some(ms) = args.shutdown_timeout_ms {
        config.shutdown_timeout_ms = ms;
    }
    if let Some(ms) = args.idle_tick_ms {
        config.idle_tick_ms = ms;
    }
    Ok(config)
}

// ============================================================================
// Demo method table
// ============================================================================

type Vars = Rc<RefCell<HashMap<String, Value>>>;

fn var_name(args: &[Value]) -> anyhow::Result<String> {
    let name = args.first().ok_or_else(|| anyhow!("Wrong number of arguments"))?;
    name.as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Variable name must be a string, got {}", name))
}

fn method_table(vars: Vars) -> FnTable<Value> {
    let get = vars.clone();
    let set = vars.clone();
    let del = vars;

    FnTable::new()
        .with("echo", |_: &CallContext, args: Vec<Value>| {
            Ok(args.into_iter().next().unwrap_or(Value::Nil))
        })
        .with("nvim_get_var", move |_: &CallContext, args: Vec<Value>| {
            let name = var_name(&args)?;
            get.borrow()
                .get(&name)
                .cloned()
                .ok_or_else(|| HandlerError::new(format!("Key not found: {}", name)))
        })
        .with("nvim_set_var", move |ctx: &CallContext, args: Vec<Value>| {
            let name = var_name(&args)?;
            let value = args.get(1).cloned().unwrap_or(Value::Nil);
            debug!("Channel {} set g:{} = {}", ctx.channel, name, value);
            set.borrow_mut().insert(name, value);
            Ok(Value::Nil)
        })
        .with("nvim_del_var", move |_: &CallContext, args: Vec<Value>| {
            let name = var_name(&args)?;
            match del.borrow_mut().remove(&name) {
                Some(_) => Ok(Value::Nil),
                None => Err(HandlerError::new(format!("Key not found: {}", name))),
            }
        })
}

// ============================================================================
// Host emulation
// ============================================================================

/// Connect to the control port, send the setup message, and forward every
/// command the broker sends to the returned channel.
fn connect_control(broker: &Broker) -> Result<mpsc::Receiver<String>> {
    let mut stream = TcpStream::connect(broker.control_addr())
        .context("Failed to connect to control channel")?;
    let setup = json!([0, broker.config().setup_token]);
    stream
        .write_all(setup.to_string().as_bytes())
        .context("Failed to send control setup")?;

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("host-control".into())
        .spawn(move || {
            let frames = serde_json::Deserializer::from_reader(stream).into_iter::<serde_json::Value>();
            for frame in frames {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) if e.is_eof() => break,
                    Err(e) => {
                        warn!("Bad control frame: {}", e);
                        break;
                    }
                };
                let command = frame
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if tx.send(command).is_err() {
                    break;
                }
            }
            debug!("Control connection closed");
        })?;
    Ok(rx)
}

fn run_host(
    broker: &Broker,
    dispatcher: &mut Dispatcher<FnTable<Value>>,
    stop: &AtomicBool,
) -> Result<()> {
    let commands = connect_control(broker)?;
    let idle_tick = broker.config().idle_tick();
    let wake = broker.config().wake_command.clone();

    while !stop.load(Ordering::SeqCst) {
        match commands.recv_timeout(idle_tick) {
            Ok(command) if command == wake => {}
            Ok(command) => info!("Host command: {}", command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("Control channel lost"),
        }
        dispatcher.drain();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging()?;

    info!("Starting nvim-rpc-broker v{}", env!("CARGO_PKG_VERSION"));
    let config = load_config(&args)?;

    let (mut broker, inbox) = Broker::start(config).context("Failed to start broker")?;
    let vars: Vars = Rc::new(RefCell::new(HashMap::new()));
    let mut dispatcher = Dispatcher::with_wire_values(inbox, method_table(vars));

    // Addresses go to stdout so a launching process can read them.
    println!("RPC_ADDR={}", broker.rpc_addr());
    println!("CONTROL_ADDR={}", broker.control_addr());

    for line in &args.jobs {
        let id = broker.jobs().spawn(&JobCommand::shell(line))?;
        println!("JOB {}={}", id, line);
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("Failed to install Ctrl-C handler")?;
    }

    let result = run_host(&broker, &mut dispatcher, &stop);
    if let Err(e) = &result {
        error!("Host loop failed: {:#}", e);
    }

    info!("Shutting down");
    let ticket = broker.shutdown_pre();
    dispatcher.drain();
    let report = broker.shutdown_post(ticket);
    info!(
        "Stopped: {} channel(s) exited, {} forced",
        report.exited.len(),
        report.forced.len()
    );

    result
}
