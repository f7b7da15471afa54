//! Unix socket accepting task submissions
//!
//! One JSON [`TaskRequest`] per line in, one JSON [`TaskReply`] per line out.
//! A connection may carry any number of submissions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, instrument, trace, warn};

use super::dispatch::SchedulerHandle;
use super::task::{TaskReply, TaskRequest};

/// Bound submission socket
pub struct SubmissionListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SubmissionListener {
    /// Bind the socket, replacing a stale socket file left by a previous run
    pub async fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind socket {}", path.display()))?;

        info!("accepting task submissions on {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the listener fails
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn run(self, handle: SchedulerHandle) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("failed to accept connection")?;

            trace!("accepted submission connection");
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, handle).await {
                    warn!("submission connection failed: {e:#}");
                }
            });
        }
    }
}

async fn serve_connection(stream: UnixStream, handle: SchedulerHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<TaskRequest>(&line) {
            Ok(request) => submit_request(&handle, request).await,
            Err(e) => TaskReply::error(format!("malformed request: {e}")),
        };

        let mut payload = serde_json::to_vec(&reply)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }

    debug!("submission connection closed");
    Ok(())
}

async fn submit_request(handle: &SchedulerHandle, request: TaskRequest) -> TaskReply {
    let task = match request.into_task() {
        Ok(task) => task,
        Err(e) => return TaskReply::error(e.to_string()),
    };

    match handle.schedule(task).await {
        Ok(outcome) => outcome.into(),
        Err(e) => TaskReply::error(e.to_string()),
    }
}

/// Submit one task through the socket at `path`
pub async fn submit(path: impl AsRef<Path>, request: &TaskRequest) -> Result<TaskReply> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("failed to connect to {}", path.display()))?;

    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.shutdown().await?;

    let line = BufReader::new(reader)
        .lines()
        .next_line()
        .await?
        .context("connection closed without a reply")?;

    serde_json::from_str(&line).context("failed to decode reply")
}
