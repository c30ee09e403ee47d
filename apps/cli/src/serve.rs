//! JSON-lines method channel over stdio
//!
//! One request per input line, `{"id", "method", "args"?}`. Each request
//! runs on its own task and is answered with `{"id", "result"}` or
//! `{"id", "error"}`. While subscribed, events are written as
//! `{"event": ...}` lines. A single writer task owns stdout.

use anyhow::Result;
use dlsession_core::{DownloadService, EventSink};
use dlsession_types::{ErrorCode, ErrorPayload, Event};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    args: Value,
}

/// One line written to stdout
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outgoing {
    Reply { id: Value, result: Value },
    Failure { id: Value, error: ErrorPayload },
    Event { event: Event },
}

/// Forwards bus events into the output queue
struct EventForwarder(mpsc::UnboundedSender<Outgoing>);

impl EventSink for EventForwarder {
    fn deliver(&mut self, event: Event) {
        let _ = self.0.send(Outgoing::Event { event });
    }
}

/// Handles request lines against a service
struct Channel {
    service: DownloadService,
    out: mpsc::UnboundedSender<Outgoing>,
}

impl Channel {
    fn handle_line(&self, line: &str) {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed request: {}", e);
                self.send(Outgoing::Failure {
                    id: Value::Null,
                    error: ErrorPayload {
                        code: ErrorCode::BadArgs,
                        message: format!("malformed request: {}", e),
                    },
                });
                return;
            }
        };

        match request.method.as_str() {
            "subscribeEvents" => {
                self.service.subscribe(EventForwarder(self.out.clone()));
                self.send(Outgoing::Reply {
                    id: request.id,
                    result: Value::Null,
                });
            }
            "unsubscribeEvents" => {
                self.service.unsubscribe();
                self.send(Outgoing::Reply {
                    id: request.id,
                    result: Value::Null,
                });
            }
            _ => {
                let service = self.service.clone();
                let out = self.out.clone();
                tokio::spawn(async move {
                    let reply = match service.dispatch(&request.method, &request.args).await {
                        Ok(result) => Outgoing::Reply {
                            id: request.id,
                            result,
                        },
                        Err(e) => {
                            debug!(method = %request.method, "Request failed: {}", e);
                            Outgoing::Failure {
                                id: request.id,
                                error: e.payload(),
                            }
                        }
                    };
                    let _ = out.send(reply);
                });
            }
        }
    }

    fn send(&self, message: Outgoing) {
        let _ = self.out.send(message);
    }
}

async fn write_lines(
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    mut writer: impl AsyncWrite + Unpin,
) -> Result<()> {
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Serve until stdin closes
pub async fn run(service: DownloadService) -> Result<()> {
    let (out, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(rx, tokio::io::stdout()));

    info!(engine = service.engine_name(), "Serving method channel on stdio");

    let channel = Channel {
        service: service.clone(),
        out,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            channel.handle_line(&line);
        }
    }

    info!("Input closed");
    // Drops the event forwarder along with the bus task
    service.stop().await;
    drop(channel);
    writer.await?
}
