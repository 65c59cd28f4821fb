use std::fmt;
use std::process::ExitCode;
use std::time::Duration;

use frame_proto::{Header, decode_header_json, encode_header_json, read_frame_async, write_frame_async};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;

const EX_USAGE: u8 = 64;
const EX_TEMPFAIL: u8 = 75;
const MAX_HEADER_LEN: u32 = 64 * 1024;
const MAX_BODY_LEN: u64 = 4 * 1024 * 1024;

type Result<T> = std::result::Result<T, CliError>;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err {
                CliError::Usage(_) => EX_USAGE,
                CliError::Runtime(_) => EX_TEMPFAIL,
            };
            eprintln!("frame-admin error: {err}");
            ExitCode::from(code)
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse(std::env::args().skip(1))?;
    let response = send_command(&cli).await?;
    println!("{}", response);
    Ok(())
}

async fn send_command(cli: &Cli) -> Result<String> {
    let (kind, body) = match &cli.command {
        Command::List => ("list_processors".to_string(), b"{}".to_vec()),
        Command::Drain(processor_id) => (
            "drain_processor".to_string(),
            serde_json::to_vec(&ProcessorIdRequest { processor_id: processor_id.clone() })
                .map_err(|err| runtime_err("failed to encode request", err))?,
        ),
        Command::Evict(processor_id) => (
            "evict_processor".to_string(),
            serde_json::to_vec(&ProcessorIdRequest { processor_id: processor_id.clone() })
                .map_err(|err| runtime_err("failed to encode request", err))?,
        ),
        Command::Replay(entry_ids) => (
            "replay".to_string(),
            serde_json::to_vec(&ReplayRequest { entry_ids: entry_ids.clone() })
                .map_err(|err| runtime_err("failed to encode request", err))?,
        ),
    };

    let timeout_window = Duration::from_secs(cli.timeout_secs);

    let mut stream = timeout(timeout_window, TcpStream::connect(&cli.server))
        .await
        .map_err(|err| runtime_err(format!("connect timeout to {}", cli.server), err))?
        .map_err(|err| runtime_err(format!("failed to connect to {}", cli.server), err))?;

    let header = Header {
        from: "frame-admin".to_string(),
        to: "frame-orchestrator".to_string(),
        kind: Some(kind),
        source: None,
    };
    let header_bytes =
        encode_header_json(&header).map_err(|err| runtime_err("failed to encode header", err))?;

    timeout(timeout_window, write_frame_async(&mut stream, &header_bytes, &body))
        .await
        .map_err(|err| runtime_err("write timeout", err))?
        .map_err(|err| runtime_err("failed to write request frame", err))?;

    let (response_header_bytes, response_body) = timeout(
        timeout_window,
        read_frame_async(&mut stream, MAX_HEADER_LEN, MAX_BODY_LEN),
    )
    .await
    .map_err(|err| runtime_err("read timeout", err))?
    .map_err(|err| runtime_err("failed to read response frame", err))?;

    let response_header = decode_header_json(&response_header_bytes)
        .map_err(|err| runtime_err("failed to decode response header", err))?;

    let pretty: serde_json::Value = serde_json::from_slice(&response_body)
        .map_err(|err| runtime_err("failed to decode response body", err))?;

    Ok(format!(
        "{}: {}",
        response_header.kind.as_deref().unwrap_or("response"),
        serde_json::to_string_pretty(&pretty).unwrap_or_default()
    ))
}

#[derive(Debug, Serialize)]
struct ProcessorIdRequest {
    processor_id: String,
}

#[derive(Debug, Serialize)]
struct ReplayRequest {
    entry_ids: Vec<String>,
}

#[derive(Debug)]
enum Command {
    List,
    Drain(String),
    Evict(String),
    Replay(Vec<String>),
}

#[derive(Debug)]
struct Cli {
    server: String,
    timeout_secs: u64,
    command: Command,
}

impl Cli {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut server = None;
        let mut timeout_secs = 10_u64;
        let mut command = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--server" => server = args.next(),
                "--timeout-secs" => {
                    let raw = args.next().ok_or_else(|| {
                        CliError::Usage("missing value for --timeout-secs".to_string())
                    })?;
                    timeout_secs = raw.parse::<u64>().map_err(|_| {
                        CliError::Usage("--timeout-secs must be a positive integer".to_string())
                    })?;
                }
                "list" => command = Some(Command::List),
                "drain" => {
                    let processor_id = args.next().ok_or_else(|| {
                        CliError::Usage("drain requires a processor id".to_string())
                    })?;
                    command = Some(Command::Drain(processor_id));
                }
                "evict" => {
                    let processor_id = args.next().ok_or_else(|| {
                        CliError::Usage("evict requires a processor id".to_string())
                    })?;
                    command = Some(Command::Evict(processor_id));
                }
                "replay" => {
                    let raw = args.next().ok_or_else(|| {
                        CliError::Usage("replay requires a comma-separated list of entry ids".to_string())
                    })?;
                    let ids = raw.split(',').map(str::to_string).collect();
                    command = Some(Command::Replay(ids));
                }
                "-h" | "--help" => {
                    return Err(CliError::Usage(
                        "usage: frame-admin --server host:port [--timeout-secs 10] <list|drain ID|evict ID|replay ID,ID,...>"
                            .to_string(),
                    ));
                }
                other => {
                    return Err(CliError::Usage(format!("unknown argument: {other}")));
                }
            }
        }

        Ok(Self {
            server: server.ok_or_else(|| CliError::Usage("missing required argument --server".to_string()))?,
            timeout_secs,
            command: command.ok_or_else(|| CliError::Usage("missing command".to_string()))?,
        })
    }
}

#[derive(Debug)]
enum CliError {
    Usage(String),
    Runtime(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Usage(msg) => write!(f, "{msg}"),
            CliError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CliError {}

fn runtime_err(context: impl Into<String>, err: impl fmt::Display) -> CliError {
    CliError::Runtime(format!("{}: {err}", context.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_command() {
        let cli = Cli::parse(vec!["--server".to_string(), "127.0.0.1:7700".to_string(), "list".to_string()].into_iter())
            .expect("parse should succeed");
        assert_eq!(cli.server, "127.0.0.1:7700");
        assert!(matches!(cli.command, Command::List));
    }

    #[test]
    fn parses_drain_command_with_processor_id() {
        let cli = Cli::parse(
            vec![
                "--server".to_string(),
                "127.0.0.1:7700".to_string(),
                "drain".to_string(),
                "p1".to_string(),
            ]
            .into_iter(),
        )
        .expect("parse should succeed");
        match cli.command {
            Command::Drain(id) => assert_eq!(id, "p1"),
            _ => panic!("expected drain command"),
        }
    }

    #[test]
    fn parses_replay_command_with_comma_separated_ids() {
        let cli = Cli::parse(
            vec![
                "--server".to_string(),
                "127.0.0.1:7700".to_string(),
                "replay".to_string(),
                "1-0,2-0,3-0".to_string(),
            ]
            .into_iter(),
        )
        .expect("parse should succeed");
        match cli.command {
            Command::Replay(ids) => assert_eq!(ids, vec!["1-0", "2-0", "3-0"]),
            _ => panic!("expected replay command"),
        }
    }

    #[test]
    fn missing_server_is_usage_error() {
        let err = Cli::parse(vec!["list".to_string()].into_iter()).expect_err("should fail");
        match err {
            CliError::Usage(msg) => assert!(msg.contains("missing required argument --server")),
            _ => panic!("expected usage error"),
        }
    }
}
