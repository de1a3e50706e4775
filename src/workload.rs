use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use crate::error::Error;

/// Configuration blob passed to a scheduled bot workload (spec §4.1's
/// "schedule a workload passing a configuration blob containing...").
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadConfig {
    pub platform: String,
    pub meeting_url: String,
    pub bot_name: String,
    pub meeting_token: String,
    pub native_meeting_id: String,
    pub session_uid: String,
    pub language: Option<String>,
    pub task: Option<String>,
    pub kv_endpoint: String,
    pub callback_url: String,
    pub waiting_room_timeout_secs: u64,
    pub no_one_joined_timeout_secs: u64,
    pub everyone_left_timeout_secs: u64,
}

/// Bot-display-name prefix every launch config carries, regardless of the
/// caller-supplied name (spec §4.1: "normalized to always include a fixed
/// vendor prefix").
pub const BOT_NAME_PREFIX: &str = "Transcript Bot";

pub fn normalize_bot_name(requested: Option<&str>) -> String {
    match requested {
        Some(name) if !name.trim().is_empty() => format!("{BOT_NAME_PREFIX} ({})", name.trim()),
        _ => BOT_NAME_PREFIX.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadRunState {
    Running,
    Succeeded,
    Failed,
    NotFound,
    Unknown,
}

/// Abstraction over "schedule/kill/inspect a workload" so the reconciler
/// and launch path are testable without a real container runtime. Grounded
/// in the teacher's `ContainerRuntime` (`docker create`/`start`/`stop`/`rm`
/// driven via `tokio::process::Command`), generalized from "one container
/// per coding-agent session" to "one container per bot meeting attempt".
#[async_trait]
pub trait WorkloadScheduler: Send + Sync {
    async fn schedule(&self, config: &WorkloadConfig) -> Result<String, Error>;
    async fn kill(&self, handle: &str) -> Result<(), Error>;
    async fn inspect(&self, handle: &str) -> Result<WorkloadRunState, Error>;
}

/// Docker-backed scheduler: one container per Meeting, running the bot
/// image with the workload config passed as environment variables.
pub struct DockerScheduler {
    pub image: String,
}

impl DockerScheduler {
    pub fn new(image: impl Into<String>) -> Self {
        Self { image: image.into() }
    }
}

#[async_trait]
impl WorkloadScheduler for DockerScheduler {
    async fn schedule(&self, config: &WorkloadConfig) -> Result<String, Error> {
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("-d")
            .arg("--label")
            .arg("transcript-platform=true")
            .arg("-e")
            .arg(format!("PLATFORM={}", config.platform))
            .arg("-e")
            .arg(format!("MEETING_URL={}", config.meeting_url))
            .arg("-e")
            .arg(format!("BOT_NAME={}", config.bot_name))
            .arg("-e")
            .arg(format!("MEETING_TOKEN={}", config.meeting_token))
            .arg("-e")
            .arg(format!("NATIVE_MEETING_ID={}", config.native_meeting_id))
            .arg("-e")
            .arg(format!("SESSION_UID={}", config.session_uid))
            .arg("-e")
            .arg(format!("KV_ENDPOINT={}", config.kv_endpoint))
            .arg("-e")
            .arg(format!("CALLBACK_URL={}", config.callback_url))
            .arg("-e")
            .arg(format!(
                "WAITING_ROOM_TIMEOUT_SECS={}",
                config.waiting_room_timeout_secs
            ))
            .arg("-e")
            .arg(format!(
                "NO_ONE_JOINED_TIMEOUT_SECS={}",
                config.no_one_joined_timeout_secs
            ))
            .arg("-e")
            .arg(format!(
                "EVERYONE_LEFT_TIMEOUT_SECS={}",
                config.everyone_left_timeout_secs
            ));
        if let Some(lang) = &config.language {
            cmd.arg("-e").arg(format!("LANGUAGE={}", lang));
        }
        if let Some(task) = &config.task {
            cmd.arg("-e").arg(format!("TASK={}", task));
        }
        cmd.arg(&self.image);

        let output = cmd
            .output()
            .await
            .map_err(|e| Error::WorkloadScheduling(format!("docker run failed to start: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::WorkloadScheduling(format!(
                "docker run failed: {stderr}"
            )));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(Error::WorkloadScheduling(
                "docker run returned empty container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn kill(&self, handle: &str) -> Result<(), Error> {
        let status = Command::new("docker")
            .arg("kill")
            .arg(handle)
            .status()
            .await
            .map_err(|e| Error::WorkloadScheduling(format!("docker kill failed to start: {e}")))?;
        // A container that already exited returns nonzero here; kill is
        // best-effort (spec §5: "Workload kill is always best-effort").
        let _ = status;
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> Result<WorkloadRunState, Error> {
        let output = Command::new("docker")
            .arg("inspect")
            .arg("--format")
            .arg("{{.State.Status}}|{{.State.ExitCode}}")
            .arg(handle)
            .output()
            .await
            .map_err(|e| Error::WorkloadScheduling(format!("docker inspect failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("no such") {
                return Ok(WorkloadRunState::NotFound);
            }
            return Ok(WorkloadRunState::Unknown);
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let mut parts = stdout.splitn(2, '|');
        let state = parts.next().unwrap_or("");
        let exit_code: i32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok(match state {
            "running" | "created" | "restarting" => WorkloadRunState::Running,
            "exited" => {
                if exit_code == 0 {
                    WorkloadRunState::Succeeded
                } else {
                    WorkloadRunState::Failed
                }
            }
            "dead" => WorkloadRunState::Failed,
            _ => WorkloadRunState::Unknown,
        })
    }
}

/// In-memory scheduler for unit tests: no real process is ever spawned.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct FakeScheduler {
        pub states: Mutex<HashMap<String, WorkloadRunState>>,
    }

    #[async_trait]
    impl WorkloadScheduler for FakeScheduler {
        async fn schedule(&self, _config: &WorkloadConfig) -> Result<String, Error> {
            let handle = uuid::Uuid::new_v4().to_string();
            self.states
                .lock()
                .await
                .insert(handle.clone(), WorkloadRunState::Running);
            Ok(handle)
        }

        async fn kill(&self, handle: &str) -> Result<(), Error> {
            self.states
                .lock()
                .await
                .insert(handle.to_string(), WorkloadRunState::Succeeded);
            Ok(())
        }

        async fn inspect(&self, handle: &str) -> Result<WorkloadRunState, Error> {
            Ok(self
                .states
                .lock()
                .await
                .get(handle)
                .copied()
                .unwrap_or(WorkloadRunState::NotFound))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_name_gets_vendor_prefix() {
        assert_eq!(normalize_bot_name(None), BOT_NAME_PREFIX);
        assert_eq!(
            normalize_bot_name(Some("My Bot")),
            format!("{BOT_NAME_PREFIX} (My Bot)")
        );
    }

    #[tokio::test]
    async fn fake_scheduler_round_trips_lifecycle() {
        use fake::FakeScheduler;
        let sched = FakeScheduler::default();
        let config = WorkloadConfig {
            platform: "google_meet".into(),
            meeting_url: "https://meet.google.com/abc-defg-hij".into(),
            bot_name: "Transcript Bot".into(),
            meeting_token: "token".into(),
            native_meeting_id: "abc-defg-hij".into(),
            session_uid: "uid-1".into(),
            language: None,
            task: None,
            kv_endpoint: "redis://localhost".into(),
            callback_url: "http://localhost/callback".into(),
            waiting_room_timeout_secs: 60,
            no_one_joined_timeout_secs: 60,
            everyone_left_timeout_secs: 60,
        };
        let handle = sched.schedule(&config).await.unwrap();
        assert_eq!(sched.inspect(&handle).await.unwrap(), WorkloadRunState::Running);
        sched.kill(&handle).await.unwrap();
        assert_eq!(sched.inspect(&handle).await.unwrap(), WorkloadRunState::Succeeded);
    }
}
