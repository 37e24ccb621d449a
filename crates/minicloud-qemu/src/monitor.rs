//! QMP monitor protocol over the VM's unix socket.
//!
//! One monitor per running machine. Requests carry a ULID id; a reader
//! task decodes responses and routes them to the issuing caller through a
//! correlation table guarded by an internal mutex. Asynchronous QMP
//! events are logged and dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use ulid::Ulid;

use minicloud_core::{Backoff, Error, Result};

use crate::OPT_MONITOR_CONNECT_TIMEOUT;

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: Ulid,
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<serde_json::Value>,
}

/// A QMP-level command failure.
#[derive(Debug, Clone, Deserialize)]
pub struct QmpError {
    /// Error class, e.g. `GenericError`.
    pub class: String,
    /// Human-readable description.
    pub desc: String,
}

// Success payloads (the `return` member) are ignored; no caller needs them.
#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    id: Option<Ulid>,
    #[serde(default)]
    error: Option<QmpError>,
    #[serde(default)]
    event: Option<String>,
}

type Pending = Arc<Mutex<HashMap<Ulid, oneshot::Sender<Message>>>>;

/// A connected QMP monitor.
pub struct Monitor {
    path: PathBuf,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl Monitor {
    /// Connects to the monitor socket of a just-started machine.
    ///
    /// The socket appears some time after process spawn, so connection
    /// attempts back off exponentially within the
    /// `qemu_monitor_connect_timeout` budget.
    ///
    /// # Errors
    ///
    /// Returns an external error when the budget lapses or the QMP
    /// handshake fails.
    pub async fn connect(path: &Path) -> Result<Self> {
        let budget = OPT_MONITOR_CONNECT_TIMEOUT.value();
        let mut backoff = Backoff::new(Duration::from_millis(100), budget);
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "monitor connect failed, retrying");
                    if !backoff.wait().await {
                        return Err(Error::external(format!(
                            "monitor at {} did not come up: {e}",
                            path.display()
                        )));
                    }
                }
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The server speaks first.
        let mut greeting = String::new();
        reader
            .read_line(&mut greeting)
            .await
            .map_err(|e| Error::external(format!("monitor handshake failed: {e}")))?;
        tracing::debug!(greeting = greeting.trim(), "monitor hello received");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let routing = pending.clone();
        let reader = tokio::spawn(async move {
            let mut lines = reader.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => route_line(&routing, &line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "monitor read failed");
                        break;
                    }
                }
            }
            // Wake every waiter; their sends will observe the closed channel.
            routing.lock().expect("monitor lock poisoned").clear();
        });

        let monitor = Self {
            path: path.to_path_buf(),
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            reader,
        };
        monitor.execute("qmp_capabilities", None).await?;
        Ok(monitor)
    }

    /// Issues a QMP command and awaits its response.
    ///
    /// # Errors
    ///
    /// Returns an external error on transport failure or a QMP-level
    /// error response.
    pub async fn execute(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<()> {
        let id = Ulid::new();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("monitor lock poisoned")
            .insert(id, tx);

        let request = Request {
            id,
            execute: command,
            arguments,
        };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&line).await {
                self.pending
                    .lock()
                    .expect("monitor lock poisoned")
                    .remove(&id);
                return Err(Error::external(format!(
                    "monitor {} write failed: {e}",
                    self.path.display()
                )));
            }
        }

        let message = rx.await.map_err(|_| {
            Error::external(format!("monitor {} closed", self.path.display()))
        })?;
        if let Some(error) = message.error {
            return Err(Error::external(format!("{}: {}", error.class, error.desc)));
        }
        Ok(())
    }

    /// Resumes the machine's VCPUs.
    ///
    /// # Errors
    ///
    /// Returns an external error on failure.
    pub async fn cont(&self) -> Result<()> {
        self.execute("cont", None).await
    }

    /// Asks the machine to exit.
    ///
    /// # Errors
    ///
    /// Returns an external error on failure.
    pub async fn quit(&self) -> Result<()> {
        self.execute("quit", None).await
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn route_line(pending: &Pending, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let message: Message = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(line, error = %e, "unparseable monitor message");
            return;
        }
    };
    if let Some(event) = &message.event {
        tracing::debug!(%event, "monitor event");
        return;
    }
    let Some(id) = message.id else {
        tracing::debug!(line, "monitor response without id");
        return;
    };
    let waiter = pending.lock().expect("monitor lock poisoned").remove(&id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => tracing::debug!(%id, "monitor response for unknown request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Speaks just enough QMP to handshake and echo success responses.
    async fn fake_qmp(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"QMP\":{\"version\":{},\"capabilities\":[]}}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            let response = serde_json::json!({
                "id": request["id"],
                "return": {},
            });
            let mut bytes = serde_json::to_vec(&response).unwrap();
            bytes.push(b'\n');
            write_half.write_all(&bytes).await.unwrap();
        }
    }

    #[tokio::test]
    async fn handshake_and_command_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mon.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_qmp(listener));

        let monitor = Monitor::connect(&path).await.unwrap();
        monitor.cont().await.unwrap();
        monitor.quit().await.unwrap();
    }

    #[tokio::test]
    async fn connect_backs_off_until_socket_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mon.sock");

        let bind_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = UnixListener::bind(&bind_path).unwrap();
            fake_qmp(listener).await;
        });

        let monitor = Monitor::connect(&path).await.unwrap();
        monitor.cont().await.unwrap();
    }
}
