//! Subprocess supervision
//!
//! Keeps one external tool running for a camera: launch, hand the child to
//! its task, and relaunch after the restart delay whenever it exits. Only a
//! shutdown signal ends the loop.

use crate::config::RestartPolicy;
use crate::recorder::ffmpeg::ToolInvocation;
use async_trait::async_trait;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// A run this long counts as healthy and resets the backoff
const STABLE_RUN: Duration = Duration::from_secs(30);

/// One kind of supervised tool
#[async_trait]
pub trait SupervisedTask: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Invocation for the next launch
    fn invocation(&mut self) -> ToolInvocation;

    /// Adjust stdio before spawning
    fn configure(&self, _command: &mut Command) {}

    /// Drive a running child until it exits
    async fn run(&mut self, child: &mut Child) -> std::io::Result<ExitStatus>;

    /// Called after every exit or failed launch, before the restart delay
    fn on_exit(&mut self) {}
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Shutdown,
}

/// Run `task` until `shutdown` flips to true or its sender is dropped
pub async fn supervise<T: SupervisedTask>(
    camera_id: String,
    mut task: T,
    policy: RestartPolicy,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let invocation = task.invocation();
        let mut command = invocation.command();
        task.configure(&mut command);
        let launched_at = Instant::now();

        match command.spawn() {
            Ok(mut child) => {
                tracing::info!(
                    camera_id = %camera_id,
                    pid = ?child.id(),
                    "{} started",
                    task.name()
                );

                let outcome = tokio::select! {
                    result = task.run(&mut child) => Outcome::Exited(result),
                    _ = shutdown.changed() => Outcome::Shutdown,
                };

                match outcome {
                    Outcome::Shutdown => {
                        terminate(&mut child, grace).await;
                        tracing::info!(camera_id = %camera_id, "{} stopped", task.name());
                        break;
                    }
                    Outcome::Exited(Ok(status)) => {
                        tracing::warn!(
                            camera_id = %camera_id,
                            "{} exited with {}",
                            task.name(),
                            status
                        );
                    }
                    Outcome::Exited(Err(e)) => {
                        tracing::warn!(camera_id = %camera_id, "{} failed: {}", task.name(), e);
                        let _ = child.kill().await;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    camera_id = %camera_id,
                    program = ?invocation.program,
                    "Failed to launch {}: {}",
                    task.name(),
                    e
                );
            }
        }

        task.on_exit();

        if launched_at.elapsed() >= STABLE_RUN {
            failures = 0;
        }
        let delay = policy.delay(failures);
        failures = failures.saturating_add(1);

        tracing::warn!(
            camera_id = %camera_id,
            "Restarting {} in {:.1}s",
            task.name(),
            delay.as_secs_f64()
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// Ask an ffmpeg child to quit, then kill it if it has not exited within `grace`
pub async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(mut stdin) = child.stdin.take() {
        // ffmpeg treats `q` on stdin as a request to finish cleanly
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.flush().await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!(pid = ?child.id(), "Process ignored quit request, killing");
            let _ = child.kill().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingTask {
        program: PathBuf,
        launches: Arc<AtomicU32>,
        exits: Arc<AtomicU32>,
    }

    #[async_trait]
    impl SupervisedTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn invocation(&mut self) -> ToolInvocation {
            self.launches.fetch_add(1, Ordering::SeqCst);
            ToolInvocation {
                program: self.program.clone(),
                args: vec![],
            }
        }

        async fn run(&mut self, child: &mut Child) -> std::io::Result<ExitStatus> {
            child.wait().await
        }

        fn on_exit(&mut self) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting(program: &str) -> (CountingTask, Arc<AtomicU32>, Arc<AtomicU32>) {
        let launches = Arc::new(AtomicU32::new(0));
        let exits = Arc::new(AtomicU32::new(0));
        let task = CountingTask {
            program: PathBuf::from(program),
            launches: launches.clone(),
            exits: exits.clone(),
        };
        (task, launches, exits)
    }

    #[tokio::test]
    async fn test_crashing_process_is_relaunched() {
        let (task, launches, exits) = counting("false");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let policy = RestartPolicy::Fixed { delay_secs: 0.05 };

        let handle = tokio::spawn(supervise(
            "cam".to_string(),
            task,
            policy,
            Duration::from_millis(100),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(launches.load(Ordering::SeqCst) >= 3);
        assert!(exits.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_missing_binary_keeps_retrying() {
        let (task, launches, _exits) = counting("/nonexistent/motion-recorder-tool");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let policy = RestartPolicy::Fixed { delay_secs: 0.05 };

        let handle = tokio::spawn(supervise(
            "cam".to_string(),
            task,
            policy,
            Duration::from_millis(100),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        drop(shutdown_tx);
        handle.await.unwrap();

        assert!(launches.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_running_child() {
        let (task, launches, _exits) = counting("cat");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(supervise(
            "cam".to_string(),
            task,
            RestartPolicy::default(),
            Duration::from_millis(200),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();

        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }
}
