//! Host bridge
//! Line-delimited JSON requests in, responses and channel events out.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::commands::{Command, CommandError};
use crate::core::bluetooth::RadioStack;
use crate::core::events::{EventChannel, EventStream};
use crate::logging::LogMessage;
use crate::state::AppState;

pub const LOG_CHANNEL: &str = "log";

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct ChannelArgs {
    name: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outgoing {
    Result { id: Value, result: Value },
    Error { id: Value, error: ErrorBody },
    Event { channel: &'static str, event: Value },
}

impl Outgoing {
    fn error(id: Value, code: &'static str, message: impl ToString) -> Self {
        Self::Error {
            id,
            error: ErrorBody {
                code,
                message: message.to_string(),
            },
        }
    }

    fn failed(id: Value, e: CommandError) -> Self {
        Self::error(id, e.code(), e)
    }
}

type OutgoingSender = mpsc::UnboundedSender<Outgoing>;

/// Serves host requests until `input` ends, then shuts the manager down.
pub async fn serve<R, I, O>(
    state: &AppState<R>,
    input: I,
    output: O,
    logs: Option<mpsc::UnboundedReceiver<LogMessage>>,
) -> Result<()>
where
    R: RadioStack,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_outgoing(output, out_rx));

    let log_forwarder = logs.map(|mut logs| {
        let out = out_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = logs.recv().await {
                let Ok(event) = serde_json::to_value(&message) else {
                    continue;
                };
                if out
                    .send(Outgoing::Event {
                        channel: LOG_CHANNEL,
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        })
    });

    info!("Host bridge ready.");
    let mut lines = input.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read host request")?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = handle_line(state, line, &out_tx).await;
        if out_tx.send(reply).is_err() {
            warn!("Host output closed, stopping.");
            break;
        }
    }

    info!("Host input closed, shutting down.");
    state.shutdown().await;
    if let Some(handle) = log_forwarder {
        handle.abort();
    }
    drop(out_tx);
    writer.await.context("Host writer task failed")?
}

async fn write_outgoing<O>(mut output: O, mut rx: mpsc::UnboundedReceiver<Outgoing>) -> Result<()>
where
    O: AsyncWrite + Unpin,
{
    while let Some(outgoing) = rx.recv().await {
        let mut line = serde_json::to_string(&outgoing)?;
        line.push('\n');
        output
            .write_all(line.as_bytes())
            .await
            .context("Failed to write to host")?;
        output.flush().await?;
    }
    Ok(())
}

async fn handle_line<R: RadioStack>(
    state: &AppState<R>,
    line: &str,
    out_tx: &OutgoingSender,
) -> Outgoing {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed host request: {}", e);
            return Outgoing::error(Value::Null, "InvalidArgument", e);
        }
    };
    debug!("Host request {} {}", request.id, request.method);

    let id = request.id;
    match request.method.as_str() {
        "listen" => match channel(request.args) {
            Ok(channel) => {
                listen(state, channel, out_tx);
                Outgoing::Result {
                    id,
                    result: Value::Null,
                }
            }
            Err(e) => Outgoing::failed(id, e),
        },
        "cancel" => match channel(request.args) {
            Ok(channel) => {
                state.bluetooth_manager.emitter().cancel(channel);
                Outgoing::Result {
                    id,
                    result: Value::Null,
                }
            }
            Err(e) => Outgoing::failed(id, e),
        },
        method => {
            let result = match Command::from_call(method, request.args) {
                Ok(command) => state.execute(command).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(result) => Outgoing::Result { id, result },
                Err(e) => {
                    warn!("{} failed: {}", method, e);
                    Outgoing::failed(id, e)
                }
            }
        }
    }
}

fn channel(args: Value) -> Result<EventChannel, CommandError> {
    let args: ChannelArgs = serde_json::from_value(args).map_err(|e| CommandError::InvalidArgument {
        field: "name",
        reason: e.to_string(),
    })?;
    EventChannel::from_name(&args.name).ok_or_else(|| CommandError::InvalidArgument {
        field: "name",
        reason: format!("unknown channel {}", args.name),
    })
}

fn listen<R: RadioStack>(state: &AppState<R>, channel: EventChannel, out_tx: &OutgoingSender) {
    let out = out_tx.clone();
    match channel {
        EventChannel::ScanResult => {
            tokio::spawn(forward_events(channel, state.bluetooth_manager.scan_results(), out));
        }
        EventChannel::Connector => {
            tokio::spawn(forward_events(channel, state.bluetooth_manager.messages(), out));
        }
    }
    debug!("Host listening on {}", channel.name());
}

async fn forward_events<T: Serialize>(
    channel: EventChannel,
    mut stream: EventStream<T>,
    out: OutgoingSender,
) {
    while let Some(event) = stream.recv().await {
        let event = match serde_json::to_value(&event) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to encode {} event: {}", channel.name(), e);
                continue;
            }
        };
        if out
            .send(Outgoing::Event {
                channel: channel.name(),
                event,
            })
            .is_err()
        {
            break;
        }
    }
    debug!("Listener on {} detached", channel.name());
}
