#![forbid(unsafe_code)]

//! `dictlink-client` — reference client for `dictlink-server`.
//!
//! Connects to an endpoint, sends one greeting, issues two correlated
//! requests and prints every reply. Exits 0 once both replies arrived,
//! 1 on any failure.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

use dictlink::models::{EndpointName, Message};
use dictlink::{AppError, Connection, Dispatcher, Event, Result, Value};

/// Number of correlated requests issued after the greeting.
const REQUESTS: usize = 2;

#[derive(Debug, Parser)]
#[command(
    name = "dictlink-client",
    about = "Reference client for dictlink-server",
    version,
    long_about = None
)]
struct Cli {
    /// Endpoint name the server is bound to (e.g. `dictlink.myservice`).
    endpoint: String,

    /// JSON object sent as the greeting and as both requests.
    ///
    /// Values must be strings, integers or nested objects; floats,
    /// booleans, nulls and arrays are rejected.
    #[arg(long, default_value = r#"{"Hello":"world"}"#)]
    payload: String,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Give up if both replies have not arrived within this many seconds.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_seconds: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() {
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Help and version go to stdout and are not failures.
            let code = i32::from(err.use_stderr());
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    let endpoint = args.endpoint.clone();
    match runtime.block_on(run(args)) {
        Ok(()) => {}
        Err(err @ (AppError::Bind(_) | AppError::ConnectionInvalid(_)))
            if err.to_string().contains("failed to connect") =>
        {
            eprintln!("Error: {err}");
            eprintln!("Is dictlink-server running on endpoint '{endpoint}'?");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let endpoint = EndpointName::new(args.endpoint)?;
    let json: serde_json::Value = serde_json::from_str(&args.payload)?;
    let payload = Message::try_from(json)?;
    let timeout = Duration::from_secs(args.timeout_seconds);

    let dispatcher = Dispatcher::new();
    let conn = Connection::connect(&dispatcher, &endpoint).await?;

    conn.set_event_handler(|_: &Connection, event: Event| match event {
        Event::Message(message) => println!("[general] received {}", message.body()),
        Event::Invalidated => println!("[general] connection invalidated"),
        Event::TransportError(err) => println!("[general] transport error: {err}"),
    });
    conn.activate()?;

    conn.send(payload.clone())?;
    println!("[1] sent {payload}");

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<bool>();
    for label in 2..2 + REQUESTS {
        let done = done_tx.clone();
        let request = conn.send_with_reply(payload.clone(), move |_: &Connection, result: Result<Value>| {
            let ok = match result {
                Ok(reply) => {
                    println!("[{label}] received reply: {reply}");
                    true
                }
                Err(err) => {
                    println!("[{label}] request failed: {err}");
                    false
                }
            };
            let _ = done.send(ok);
        })?;
        debug!(%request, label, "request sent");
    }
    drop(done_tx);

    let runner = dispatcher.clone();
    let run_task = tokio::spawn(async move { runner.run().await });

    let outcome = tokio::select! {
        outcome = await_replies(&mut done_rx, REQUESTS) => outcome,
        () = tokio::time::sleep(timeout) => Err(AppError::ConnectionInvalid(format!(
            "timed out after {}s waiting for replies",
            timeout.as_secs()
        ))),
        _ = tokio::signal::ctrl_c() => Err(AppError::Dispatcher("interrupted".into())),
    };

    conn.close();
    dispatcher.stop();
    match run_task.await {
        Ok(result) => result?,
        Err(err) => return Err(AppError::Dispatcher(format!("run loop task failed: {err}"))),
    }

    info!(ok = outcome.is_ok(), "client finished");
    outcome
}

/// Wait for `expected` completions; any failed reply fails the run.
async fn await_replies(done: &mut mpsc::UnboundedReceiver<bool>, expected: usize) -> Result<()> {
    let mut failed = 0;
    for _ in 0..expected {
        match done.recv().await {
            Some(true) => {}
            Some(false) => failed += 1,
            None => {
                return Err(AppError::Dispatcher(
                    "request continuations dropped before completing".into(),
                ))
            }
        }
    }

    if failed == 0 {
        Ok(())
    } else {
        Err(AppError::ConnectionInvalid(format!(
            "{failed} of {expected} requests failed"
        )))
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    // Logs go to stderr so stdout carries only the replies.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
