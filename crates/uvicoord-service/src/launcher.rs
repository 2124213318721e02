use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uvicoord_core::{InstanceRecord, Registry, RegistryError, StartRequest};

const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Keeps `--reload` in the command. Defaults to on.
    #[serde(default)]
    pub reload: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Launched {
    pub instance: InstanceRecord,
    pub command: String,
    pub log_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to spawn app: {0:#}")]
    Spawn(anyhow::Error),
}

/// Starts app processes on ports handed out by the registry.
#[derive(Clone)]
pub struct Launcher {
    registry: Arc<Registry>,
    logs_dir: PathBuf,
}

impl Launcher {
    pub fn new(registry: Arc<Registry>, logs_dir: PathBuf) -> Self {
        Self { registry, logs_dir }
    }

    /// Allocates a port, spawns the app's command on it, and watches the child.
    ///
    /// The allocation is owned by this service until the child's pid is attached, and is
    /// released again if the spawn fails. The instance is removed when the child exits.
    pub async fn run(&self, app_name: &str, req: RunRequest) -> Result<Launched, LaunchError> {
        let start = StartRequest {
            instance_id: req.instance_id,
            port: req.port,
            pid: std::process::id(),
        };
        let record = self.registry.start(app_name, start).await?;

        match self.spawn(app_name, &record, req.reload.unwrap_or(true)).await {
            Ok(launched) => Ok(launched),
            Err(err) => {
                if let Err(release_err) = self.registry.release(app_name, &record.instance_id).await {
                    tracing::debug!(app = app_name, error = %release_err, "allocation already gone");
                }
                Err(err)
            }
        }
    }

    async fn spawn(
        &self,
        app_name: &str,
        record: &InstanceRecord,
        reload: bool,
    ) -> Result<Launched, LaunchError> {
        let spawned = self.spawn_child(app_name, record, reload).await?;
        self.adopt(app_name, record, spawned).await
    }

    async fn spawn_child(
        &self,
        app_name: &str,
        record: &InstanceRecord,
        reload: bool,
    ) -> Result<Spawned, LaunchError> {
        let app = self
            .registry
            .get_app(app_name)
            .ok_or_else(|| RegistryError::AppNotFound(app_name.to_string()))?;
        let command = app.command_for_port(record.port, reload);
        let log_path = self
            .logs_dir
            .join(format!("{app_name}-{}.log", record.instance_id));

        let (stdout, stderr) = open_log(&log_path).await.map_err(LaunchError::Spawn)?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&app.path)
            .env("PORT", record.port.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        // Own session so the whole app process group can be signalled together.
        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn `{command}` (cwd {})", app.path.display()))
            .map_err(LaunchError::Spawn)?;
        let pid = child
            .id()
            .ok_or_else(|| LaunchError::Spawn(anyhow::anyhow!("child exited before its pid was read")))?;

        Ok(Spawned {
            child,
            pid,
            command,
            log_path,
        })
    }

    /// Binds a running child to its allocation and watches it until exit.
    ///
    /// If the allocation is gone by now, the child is stopped before returning so no
    /// untracked process keeps serving on a port the registry considers free.
    async fn adopt(
        &self,
        app_name: &str,
        record: &InstanceRecord,
        spawned: Spawned,
    ) -> Result<Launched, LaunchError> {
        let Spawned {
            mut child,
            pid,
            command,
            log_path,
        } = spawned;

        let instance = match self
            .registry
            .attach_pid(app_name, &record.instance_id, pid)
            .await
        {
            Ok(instance) => instance,
            Err(err) => {
                tracing::warn!(
                    app = app_name,
                    instance_id = %record.instance_id,
                    pid,
                    error = %err,
                    "allocation vanished before attach; stopping app"
                );
                stop_child(&mut child, pid).await;
                return Err(err.into());
            }
        };
        tracing::info!(
            app = app_name,
            instance_id = %instance.instance_id,
            port = instance.port,
            pid,
            command = %command,
            "app launched"
        );

        let registry = self.registry.clone();
        let app_name = app_name.to_string();
        let instance_id = instance.instance_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(app = %app_name, instance_id = %instance_id, pid, %status, "app exited");
                }
                Err(err) => {
                    tracing::warn!(app = %app_name, instance_id = %instance_id, pid, error = %err, "failed to wait for app");
                }
            }
            registry.instance_exited(&app_name, &instance_id, pid).await;
        });

        Ok(Launched {
            instance,
            command,
            log_path,
        })
    }
}

struct Spawned {
    child: tokio::process::Child,
    pid: u32,
    command: String,
    log_path: PathBuf,
}

/// SIGTERM to the child's process group, then SIGKILL if it is still around.
async fn stop_child(child: &mut tokio::process::Child, pid: u32) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = i32::try_from(pid) {
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
            if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
                return;
            }
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.start_kill();
    if let Err(err) = child.wait().await {
        tracing::warn!(pid, error = %err, "failed to reap stopped app");
    }
}

async fn open_log(path: &std::path::Path) -> anyhow::Result<(Stdio, Stdio)> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create logs dir")?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?
        .into_std()
        .await;
    let err = file.try_clone().context("clone log handle")?;
    Ok((Stdio::from(file), Stdio::from(err)))
}
