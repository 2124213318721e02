use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use uvicoord_core::{RegistrySnapshot, SnapshotSink};

enum Command {
    Write(RegistrySnapshot),
    Flush(oneshot::Sender<()>),
}

/// Hands snapshots to a background writer so registry calls never wait on disk.
#[derive(Clone)]
pub struct FilePersister {
    tx: mpsc::UnboundedSender<Command>,
}

impl FilePersister {
    /// Spawns the writer task. Must be called inside a tokio runtime.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        tokio::spawn(async move {
            let mut writer = SnapshotWriter::new(path);
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Write(snapshot) => {
                        if let Err(err) = writer.write(&snapshot).await {
                            tracing::warn!(
                                path = %writer.path.display(),
                                revision = snapshot.revision,
                                error = %err,
                                "failed to persist registry"
                            );
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Waits until every snapshot queued so far has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl SnapshotSink for FilePersister {
    fn registry_changed(&self, snapshot: RegistrySnapshot) -> anyhow::Result<()> {
        self.tx
            .send(Command::Write(snapshot))
            .map_err(|_| anyhow::anyhow!("registry writer has stopped"))
    }
}

/// Writes snapshots atomically, skipping any older than the last one written.
struct SnapshotWriter {
    path: PathBuf,
    last_revision: Option<u64>,
}

impl SnapshotWriter {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_revision: None,
        }
    }

    async fn write(&mut self, snapshot: &RegistrySnapshot) -> anyhow::Result<bool> {
        if self.last_revision.is_some_and(|r| r >= snapshot.revision) {
            return Ok(false);
        }
        write_snapshot(&self.path, snapshot).await?;
        self.last_revision = Some(snapshot.revision);
        Ok(true)
    }
}

async fn write_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create data root")?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(snapshot).context("serialize registry.json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create registry.json.tmp")?;
    f.write_all(&data).await.context("write registry.json.tmp")?;
    f.flush().await.context("flush registry.json.tmp")?;
    f.sync_all().await.context("sync registry.json.tmp")?;
    drop(f);
    tokio::fs::rename(&tmp, path)
        .await
        .context("persist registry.json")?;
    Ok(())
}

/// Reads a persisted snapshot. A missing file is not an error.
pub async fn load_snapshot(path: &Path) -> anyhow::Result<Option<RegistrySnapshot>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let snapshot = serde_json::from_slice(&data)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(snapshot))
}
