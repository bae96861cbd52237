//! Fire-and-forget log of rejected requests.
//!
//! Rejections are formatted into single lines and pushed over an unbounded
//! channel to a writer task, which appends them to the configured file in
//! batches: a flush fires when 100 entries are buffered or one second after
//! the first unflushed entry, whichever comes first.
//!
//! Logging must never interfere with request handling: `log` does not block,
//! and write errors go to stderr and are swallowed.

use chrono::{SecondsFormat, Utc};
use std::path::PathBuf;
use tokio::{
    io::AsyncWriteExt,
    sync::{broadcast, mpsc},
    time::{Duration, Instant},
};

/// Buffered entries that force a flush.
const FLUSH_AT_ENTRIES: usize = 100;

/// Longest an entry waits before being flushed.
const FLUSH_AFTER: Duration = Duration::from_secs(1);

/// Longest body excerpt carried into the log line.
const BODY_EXCERPT_CHARS: usize = 1000;

/// Handle for recording rejected requests.
#[derive(Clone)]
pub struct RejectLog {
    tx: mpsc::UnboundedSender<String>,
}

impl RejectLog {
    /// Creates the log and spawns its writer task.
    #[must_use]
    pub fn new(path: PathBuf, shutdown_rx: broadcast::Receiver<()>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path, rx, shutdown_rx));
        Self { tx }
    }

    /// Records one rejection. Never blocks, never fails; if the writer task
    /// is gone the entry is silently dropped.
    pub fn log(&self, ip: &str, origin: &str, reason: &str, body: &[u8]) {
        let line = format_line(ip, origin, reason, body);
        let _ = self.tx.send(line);
    }
}

/// `<ISO-timestamp> | <ip> | <origin> | <reason> | <body excerpt>`
fn format_line(ip: &str, origin: &str, reason: &str, body: &[u8]) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("{timestamp} | {ip} | {origin} | {reason} | {}", render_body(body))
}

/// Body excerpt: up to 1000 chars of valid UTF-8, a truncation marker past
/// that, and the bare marker for unreadable bodies. Newlines are flattened
/// to keep the log line-oriented.
fn render_body(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => {
            let flat: String = text
                .chars()
                .take(BODY_EXCERPT_CHARS)
                .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                .collect();
            if text.chars().count() > BODY_EXCERPT_CHARS {
                format!("{flat} [truncated]")
            } else {
                flat
            }
        }
        Err(_) => "[truncated]".to_string(),
    }
}

async fn writer_task(
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buffer: Vec<String> = Vec::with_capacity(FLUSH_AT_ENTRIES);
    let mut deadline: Option<Instant> = None;

    loop {
        // With no pending entries there is no deadline; park far out.
        let until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                while let Ok(line) = rx.try_recv() {
                    buffer.push(line);
                }
                flush(&path, &mut buffer).await;
                break;
            }
            entry = rx.recv() => {
                let Some(line) = entry else {
                    flush(&path, &mut buffer).await;
                    break;
                };
                buffer.push(line);
                if buffer.len() >= FLUSH_AT_ENTRIES {
                    flush(&path, &mut buffer).await;
                    deadline = None;
                } else if deadline.is_none() {
                    deadline = Some(Instant::now() + FLUSH_AFTER);
                }
            }
            () = tokio::time::sleep_until(until), if deadline.is_some() => {
                flush(&path, &mut buffer).await;
                deadline = None;
            }
        }
    }
}

/// Appends buffered lines to the file. Errors go to stderr and the buffer is
/// dropped either way; a broken log file must not wedge the proxy.
async fn flush(path: &PathBuf, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let mut payload = buffer.join("\n");
    payload.push('\n');
    buffer.clear();

    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.flush().await
    }
    .await;

    if let Err(err) = result {
        eprintln!("reject log write to {} failed: {err}", path.display());
    }
}
