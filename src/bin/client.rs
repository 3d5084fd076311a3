//! Interactive gateway client
//!
//! Lines typed on stdin are sent as text frames: plain text is a chat turn,
//! a line starting with `/` is shorthand for a command:
//!
//! ```text
//! /run ls -la          → vm-execute-stream
//! /input yes           → vm-send-input
//! /cancel              → vm-cancel
//! /status              → vm-status
//! /ls docs             → list-directory
//! /{"command": ...}    → sent verbatim
//! ```

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "shellvisor-client", about = "Talk to a shellvisor gateway")]
struct Cli {
    /// Gateway base URL
    #[arg(long, env = "SHELLVISOR_URL", default_value = "ws://127.0.0.1:8765")]
    url: String,
    #[arg(long, env = "SHELLVISOR_USER")]
    user: String,
    #[arg(long, env = "SHELLVISOR_SESSION", default_value = "default")]
    session: String,
    /// Stream the model's reasoning as well as its answer
    #[arg(long)]
    think: bool,
    #[arg(long, env = "SHELLVISOR_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

fn connect_url(cli: &Cli) -> Result<Url, url::ParseError> {
    let base = cli
        .url
        .replace("http://", "ws://")
        .replace("https://", "wss://");
    let mut url = Url::parse(base.trim_end_matches('/'))?.join("/ws")?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("user", &cli.user);
        query.append_pair("session", &cli.session);
        if cli.think {
            query.append_pair("think", "true");
        }
        if let Some(token) = &cli.token {
            query.append_pair("token", token);
        }
    }
    Ok(url)
}

/// Turn one input line into the frame to send
fn frame_for(line: &str) -> String {
    let Some(rest) = line.strip_prefix('/') else {
        return line.to_string();
    };
    let (name, arg) = match rest.split_once(' ') {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let frame = match name {
        "run" => json!({ "command": "vm-execute-stream", "args": { "command": arg } }),
        "exec" => json!({ "command": "vm-execute", "args": { "command": arg } }),
        "input" => json!({ "command": "vm-send-input", "args": { "data": arg } }),
        "cancel" => json!({ "command": "vm-cancel" }),
        "status" => json!({ "command": "vm-status" }),
        "ls" => json!({ "command": "list-directory", "args": { "path": arg } }),
        "memory" => json!({ "command": "get-memory" }),
        "history" => json!({ "command": "history" }),
        "notify" => json!({ "command": "notify", "args": { "text": arg } }),
        _ => return rest.to_string(),
    };
    frame.to_string()
}

/// Render a received frame for the terminal
fn render(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) if object.contains_key("stdin_request") => {
            format!("\n[input requested] {}\n", object["stdin_request"].as_str().unwrap_or_default())
        }
        Ok(Value::Object(object)) if object.contains_key("exec_finished") => {
            let done = &object["exec_finished"];
            format!("\n[{} exit={} {}ms]\n", done["state"].as_str().unwrap_or("?"), done["exit_code"], done["duration_ms"])
        }
        Ok(value @ Value::Object(_)) => {
            let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| text.to_string());
            format!("{}\n", pretty)
        }
        _ => text.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let url = connect_url(&cli)?;

    let (ws_stream, _) = connect_async(url.as_str()).await?;
    eprintln!("Connected as {}/{}. Ctrl+D to exit.", cli.user, cli.session);

    let (mut write, mut read) = ws_stream.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    stdout.write_all(render(&text).as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        eprintln!("\nclosed: {} {}", frame.code, frame.reason);
                    }
                    break;
                }
                Some(Err(e)) => {
                    eprintln!("\nconnection error: {}", e);
                    break;
                }
                None => break,
                _ => {}
            },
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => write.send(Message::Text(frame_for(&line))).await?,
                None => break,
            },
        }
    }

    let _ = write.close().await;
    eprintln!();
    Ok(())
}
