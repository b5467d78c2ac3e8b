use std::time::Duration;

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    frontend::FrontendClient,
    protocol::{ConsoleCommand, USAGE},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut client = FrontendClient::connect(&args.server, args.client_id).await?;
    info!(client_id = client.client_id(), server = %args.server, "connected to frontend");

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        write_prompt().await?;
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                if !handle_line(&mut client, input.trim()).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    Ok(())
}

/// Executes one shell line. Returns `false` when the shell should exit.
async fn handle_line(client: &mut FrontendClient, line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }

    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("ERROR: {err}")).await?;
            write_stdout(USAGE).await?;
            return Ok(true);
        }
    };

    let output = match command {
        ConsoleCommand::Exit => return Ok(false),
        ConsoleCommand::Help => Ok(USAGE.to_string()),
        ConsoleCommand::Sleep { secs } => {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            return Ok(true);
        }
        ConsoleCommand::Put { tuple, delays } => {
            client.put(&tuple, delays).await.map(|()| "OK".to_string())
        }
        ConsoleCommand::Read { pattern, delays } => client.read(&pattern, delays).await,
        ConsoleCommand::Take { pattern, delays } => client.take(&pattern, delays).await,
        ConsoleCommand::State => client.dump().await.map(|tuples| render_state(&tuples)),
    };

    match output {
        Ok(text) => write_stdout(&text).await?,
        Err(err) => write_stderr(&format!("ERROR: {err:#}")).await?,
    }
    Ok(true)
}

pub fn render_state(tuples: &[String]) -> String {
    format!("[{}]", tuples.join(", "))
}

async fn write_prompt() -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"> ").await?;
    stdout.flush().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
