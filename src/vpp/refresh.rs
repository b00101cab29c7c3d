//! Instance refresh
//!
//! A manual update walks uptime, interfaces, logs, stats and the
//! informational CLIs in that order and publishes the partial state after
//! each step. The periodic loop republishes the current state on every tick
//! and runs a full update whenever one is requested.

use super::{Instance, InstanceState};
use crate::Result;
use chrono::Local;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

impl Instance {
    /// Run one full update. Step errors are recorded in the state's `error`
    /// field and do not stop later steps.
    pub async fn update(
        &self,
        info_commands: &[String],
        progress: Option<&watch::Sender<InstanceState>>,
    ) -> InstanceState {
        let publish = |state: InstanceState| {
            if let Some(tx) = progress {
                tx.send_replace(state);
            }
        };

        publish(
            self.modify_state(|s| {
                s.updating = true;
                s.error = None;
            })
            .await,
        );

        let uptime = self.get_uptime().await;
        publish(self.record("uptime", uptime, |s, v| s.uptime = Some(v)).await);

        let interfaces = self.list_interfaces().await;
        publish(self.record("interfaces", interfaces, |s, v| s.interfaces = v).await);

        let logs = self.dump_logs().await;
        publish(self.record("logs", logs, |s, v| s.logs = v).await);

        let stats = self.list_stats().await;
        publish(self.record("stats", stats, |s, v| s.stats = Some(v)).await);

        for cmd in info_commands {
            let output = self.run_cli(cmd).await;
            publish(
                self.record(cmd, output, |s, v| {
                    s.cli_results.insert(cmd.clone(), v);
                })
                .await,
            );
        }

        let state = self
            .modify_state(|s| {
                s.updating = false;
                s.last_update = Some(Local::now());
            })
            .await;
        publish(state.clone());
        state
    }

    async fn record<T, F>(&self, step: &str, result: Result<T>, apply: F) -> InstanceState
    where
        F: FnOnce(&mut InstanceState, T),
    {
        match result {
            Ok(value) => {
                debug!("Refreshed {} on {}", step, self.id());
                self.modify_state(|s| apply(s, value)).await
            }
            Err(e) => {
                warn!("Refreshing {} on {} failed: {}", step, self.id(), e);
                self.modify_state(|s| s.error = Some(format!("{}: {}", step, e)))
                    .await
            }
        }
    }
}

/// Handle to a running refresh loop
pub struct RefreshHandle {
    trigger: Arc<Notify>,
    state: watch::Receiver<InstanceState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Request a full update on the next loop iteration
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn subscribe(&self) -> watch::Receiver<InstanceState> {
        self.state.clone()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Refresh loop ended abnormally: {}", e);
        }
    }
}

/// Start a refresh loop for `instance` that ends when `cancel` fires
pub async fn spawn_refresh(
    instance: Arc<Instance>,
    interval: Duration,
    info_commands: Vec<String>,
    cancel: CancellationToken,
) -> RefreshHandle {
    let (tx, rx) = watch::channel(instance.state().await);
    let trigger = Arc::new(Notify::new());
    let cancel = cancel.child_token();

    let task = tokio::spawn(refresh_loop(
        instance,
        interval,
        info_commands,
        tx,
        trigger.clone(),
        cancel.clone(),
    ));

    RefreshHandle {
        trigger,
        state: rx,
        cancel,
        task,
    }
}

async fn refresh_loop(
    instance: Arc<Instance>,
    interval: Duration,
    info_commands: Vec<String>,
    tx: watch::Sender<InstanceState>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
) {
    let tx = Arc::new(tx);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Refresh loop for {} cancelled", instance.id());
                return;
            }
            _ = ticker.tick() => {
                tx.send_replace(instance.state().await);
            }
            _ = trigger.notified() => {
                let inst = instance.clone();
                let cmds = info_commands.clone();
                let progress = tx.clone();
                let update = async move {
                    inst.update(&cmds, Some(progress.as_ref())).await;
                };
                if !run_guarded(instance.id(), update, &cancel).await {
                    return;
                }
            }
        }
    }
}

/// Run `fut` on its own task so a panic is logged instead of taking down the
/// loop. Returns false when cancelled.
async fn run_guarded<F>(id: &str, fut: F, cancel: &CancellationToken) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    let abort = handle.abort_handle();
    tokio::select! {
        _ = cancel.cancelled() => {
            abort.abort();
            false
        }
        res = handle => {
            if let Err(e) = res {
                if e.is_panic() {
                    error!("Refresh of {} panicked: {}", id, e);
                } else {
                    warn!("Refresh of {} aborted: {}", id, e);
                }
            }
            true
        }
    }
}
