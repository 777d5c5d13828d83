use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use switchboard::{Client, ClientConfig, ClientError, Frame, RequestOptions, StreamEvent};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("no answer to {kind} within {timeout_ms}ms")]
    NoAnswer { kind: String, timeout_ms: u64 },
    #[error("listen needs at least one topic or --streams")]
    NothingToListen,
}

#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Correlated requests and event taps over one WebSocket")]
struct Cli {
    #[arg(long, env = "SWITCHBOARD_URL", default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a correlated request and print the response payload.
    Request(RequestArgs),
    /// Send a one-way frame.
    Send(SendArgs),
    /// Print event frames for the given topics until the duration elapses.
    Listen(ListenArgs),
}

#[derive(Args, Debug)]
struct RequestArgs {
    kind: String,

    #[arg(long, default_value = "{}")]
    payload: String,

    #[arg(long, help = "Override the configured request timeout")]
    timeout_ms: Option<u64>,

    #[arg(long, help = "Print null instead of failing when nothing answers")]
    allow_no_answer: bool,
}

#[derive(Args, Debug)]
struct SendArgs {
    kind: String,

    #[arg(long, default_value = "{}")]
    payload: String,
}

#[derive(Args, Debug)]
struct ListenArgs {
    topics: Vec<String>,

    #[arg(long, help = "Also print aggregated stream results")]
    streams: bool,

    #[arg(long, default_value_t = 30)]
    duration_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = Client::new(ClientConfig::from_env());
    let link = client.connect(&cli.url).await?;

    let result = match cli.command {
        Command::Request(args) => run_request(&client, args).await,
        Command::Send(args) => run_send(&client, args),
        Command::Listen(args) => run_listen(&client, args).await,
    };

    client.disconnect();
    link.closed().await;
    result
}

async fn run_request(client: &Client, args: RequestArgs) -> Result<(), CliError> {
    let payload = parse_payload(&args.payload)?;
    let timeout = args.timeout_ms.map_or(client.config().request_timeout, Duration::from_millis);
    let options = RequestOptions::with_timeout(timeout);

    match client.request_or_none(&args.kind, payload, options).await? {
        Some(response) => print_json(&response),
        None if args.allow_no_answer => print_json(&Value::Null),
        None => Err(CliError::NoAnswer {
            kind: args.kind,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

fn run_send(client: &Client, args: SendArgs) -> Result<(), CliError> {
    let payload = parse_payload(&args.payload)?;
    client.send(&args.kind, payload)?;
    eprintln!("sent {}", args.kind);
    Ok(())
}

async fn run_listen(client: &Client, args: ListenArgs) -> Result<(), CliError> {
    if args.topics.is_empty() && !args.streams {
        return Err(CliError::NothingToListen);
    }

    let _subscriptions: Vec<_> = args
        .topics
        .iter()
        .map(|topic| client.on(topic.as_str(), print_frame))
        .collect();
    let _streams = args.streams.then(|| client.on_stream(print_stream_event));

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    let stats = client.stats();
    eprintln!(
        "generation={} protocol_errors={} stale_frames={} open_streams={}",
        stats.generation, stats.protocol_errors, stats.stale_frames, stats.open_streams
    );
    Ok(())
}

fn print_frame(frame: &Frame) {
    let line = json!({ "type": frame.kind, "payload": frame.payload });
    println!("{line}");
}

fn print_stream_event(event: &StreamEvent) {
    let line = match event {
        StreamEvent::Partial {
            stream_id,
            chunk,
            received,
            ..
        } => json!({ "stream": stream_id, "partial": chunk, "received": received }),
        StreamEvent::Complete(result) => {
            json!({ "stream": result.stream_id, "type": result.kind, "complete": result.chunks })
        }
        StreamEvent::Incomplete { result, reason } => json!({
            "stream": result.stream_id,
            "incomplete": result.chunks,
            "reason": format!("{reason:?}"),
        }),
    };
    println!("{line}");
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

fn parse_payload(raw: &str) -> Result<Value, CliError> {
    Ok(serde_json::from_str(raw)?)
}
