use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EngineEvent;
use crate::{executor::InstanceExecutor, settings::InstanceConfig, template::Template};

/// `Idle → Running → Waiting → Running → … → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Running,
    Waiting,
    Stopped,
}

/// The stop-and-wait loop of one instance. The next tick is armed only after
/// the previous execution finished.
pub struct InstanceTimer {
    cancel: CancellationToken,
    state: watch::Receiver<TimerState>,
    handle: JoinHandle<()>,
    config_hash: String,
}

impl InstanceTimer {
    pub fn start(
        instance: InstanceConfig,
        template: Arc<Template>,
        executor: Arc<InstanceExecutor>,
        cancel: CancellationToken,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let config_hash = instance.config_hash();
        let (tx, state) = watch::channel(TimerState::Idle);
        let handle = tokio::spawn(run_loop(
            instance,
            template,
            executor,
            cancel.clone(),
            events,
            tx,
        ));
        Self {
            cancel,
            state,
            handle,
            config_hash,
        }
    }

    /// Cancel the loop and any execution it is running, then wait for the
    /// task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "instance timer task ended abnormally");
        }
    }

    pub fn state(&self) -> TimerState {
        *self.state.borrow()
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_loop(
    instance: InstanceConfig,
    template: Arc<Template>,
    executor: Arc<InstanceExecutor>,
    cancel: CancellationToken,
    events: broadcast::Sender<EngineEvent>,
    state: watch::Sender<TimerState>,
) {
    let interval: Duration = template.effective_interval(instance.custom_interval);
    info!(instance = %instance.id, template = %template.id, ?interval, "instance timer started");

    while !cancel.is_cancelled() {
        state.send_replace(TimerState::Running);
        let started = Utc::now();
        let clock = Instant::now();

        let report = executor.run(&instance, &template, &cancel).await;

        let _ = events.send(EngineEvent::InstanceExecuted {
            instance_id: instance.id.clone(),
            started,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            targets: report.targets,
            failed_targets: report.failed,
        });
        if cancel.is_cancelled() {
            break;
        }

        state.send_replace(TimerState::Waiting);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    state.send_replace(TimerState::Stopped);
    debug!(instance = %instance.id, "instance timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executor::{Publisher, Stagger, StepExecutor},
        fetch::{FetchError, FetchRequest, HttpFetcher, ResponseCache},
        sink::InMemorySink,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct HangingFetcher;

    #[async_trait]
    impl HttpFetcher for HangingFetcher {
        async fn fetch(&self, _request: &FetchRequest) -> Result<String, FetchError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_after_the_loop_has_exited() {
        let template: Template = serde_json::from_str(
            r#"{ "id": "hang", "execution": { "type": "api_text", "url": "https://hang.example/" } }"#,
        )
        .unwrap();
        let executor = Arc::new(InstanceExecutor::new(
            StepExecutor::new(ResponseCache::new(Arc::new(HangingFetcher))),
            Publisher::new(InMemorySink::new(), "DASH"),
            Stagger::default(),
        ));
        let instance = InstanceConfig {
            id: "h".into(),
            template_id: "hang".into(),
            enabled: true,
            custom_interval: 0,
            inputs: BTreeMap::new(),
            targets: Vec::new(),
        };
        let (events, _rx) = broadcast::channel(8);

        let timer = InstanceTimer::start(
            instance,
            Arc::new(template),
            executor,
            CancellationToken::new(),
            events,
        );
        let state = timer.state.clone();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(timer.state(), TimerState::Running);

        timer.stop().await;
        assert_eq!(*state.borrow(), TimerState::Stopped);
    }
}
