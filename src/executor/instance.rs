use std::{collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::{FutureExt, future::join_all};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ExecutionError, ExecutionScope, Publisher, StepExecutor, StepOutcome};
use crate::{
    expression::{Context, apply_transforms, extract_rules},
    settings::InstanceConfig,
    template::{ExecutionPlan, Template},
};

/// Delay before target `i` starts: `step × i`, never more than `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stagger {
    pub step: Duration,
    pub max: Duration,
}

impl Default for Stagger {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(250),
            max: Duration::from_secs(2),
        }
    }
}

impl Stagger {
    pub fn delay_for(&self, target_index: usize) -> Duration {
        self.step
            .saturating_mul(u32::try_from(target_index).unwrap_or(u32::MAX))
            .min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetResult {
    Published,
    Failed,
    Cancelled,
}

/// Outcome of one tick across all targets of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub targets: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// `instance inputs ← target overrides ← template defaults`; defaults only fill
/// keys that are still absent.
pub fn merge_inputs(
    instance: &InstanceConfig,
    overrides: &BTreeMap<String, String>,
    template: &Template,
) -> Context {
    let mut ctx: Context = instance
        .inputs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in overrides {
        ctx.insert(k.clone(), v.clone());
    }
    for input in &template.inputs {
        ctx.entry(input.key.clone())
            .or_insert_with(|| input.default.clone());
    }
    ctx
}

/// Executes every target of an instance once and publishes the results.
pub struct InstanceExecutor {
    steps: StepExecutor,
    publisher: Publisher,
    stagger: Stagger,
}

impl InstanceExecutor {
    pub fn new(steps: StepExecutor, publisher: Publisher, stagger: Stagger) -> Self {
        Self {
            steps,
            publisher,
            stagger,
        }
    }

    /// Run all targets concurrently and wait for every one of them. Failures
    /// stay inside their target.
    pub async fn run(
        &self,
        instance: &InstanceConfig,
        template: &Template,
        cancel: &CancellationToken,
    ) -> RunReport {
        let targets = instance.target_overrides();
        let results = join_all(targets.into_iter().map(|(index, overrides)| {
            self.run_target(instance, template, index, overrides, cancel)
        }))
        .await;

        RunReport {
            targets: results.len(),
            failed: results
                .iter()
                .filter(|r| **r == TargetResult::Failed)
                .count(),
            cancelled: results.contains(&TargetResult::Cancelled),
        }
    }

    async fn run_target(
        &self,
        instance: &InstanceConfig,
        template: &Template,
        target_index: Option<usize>,
        overrides: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> TargetResult {
        let delay = self.stagger.delay_for(target_index.unwrap_or(0));
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return TargetResult::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let scope = ExecutionScope::new(&instance.id, target_index);
        let mut ctx = merge_inputs(instance, overrides, template);

        let outcome = AssertUnwindSafe(self.execute_plan(template, &mut ctx, &scope, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ExecutionError::Panicked(panic_message(panic))));

        match outcome {
            Ok(last_body) => {
                if cancel.is_cancelled() {
                    return TargetResult::Cancelled;
                }
                if template.outputs.is_empty() {
                    if let Some(body) = last_body {
                        self.publisher.publish_raw(&instance.id, target_index, &body);
                    }
                } else {
                    self.publisher
                        .publish_outputs(template, &instance.id, target_index, &ctx);
                }
                TargetResult::Published
            }
            Err(e) if e.is_cancelled() => {
                debug!(instance = %instance.id, target = ?target_index, "target cancelled");
                TargetResult::Cancelled
            }
            Err(e) => {
                warn!(instance = %instance.id, target = ?target_index, error = %e, "target failed");
                self.publisher
                    .publish_error(template, &instance.id, target_index);
                TargetResult::Failed
            }
        }
    }

    /// Walk the plan. Returns the raw body of the last step that actually
    /// fetched, if any.
    async fn execute_plan(
        &self,
        template: &Template,
        ctx: &mut Context,
        scope: &ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<str>>, ExecutionError> {
        let mut last_body = None;
        match template.execution.plan() {
            ExecutionPlan::Legacy(request) => {
                let step = request.as_step();
                if let StepOutcome::Completed(body) =
                    self.steps.execute(&step, ctx, scope, cancel).await?
                {
                    // plan-level extraction over the same body
                    extract_rules(&body, request.format, request.extract, ctx);
                    last_body = Some(body);
                }
            }
            ExecutionPlan::Chain(steps) => {
                for step in steps {
                    if cancel.is_cancelled() {
                        return Err(ExecutionError::Cancelled);
                    }
                    if let StepOutcome::Completed(body) =
                        self.steps.execute(step, ctx, scope, cancel).await?
                    {
                        last_body = Some(body);
                    }
                }
            }
        }
        apply_transforms(&template.execution.process, ctx);
        Ok(last_body)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executor::publish::ERROR_VALUE,
        fetch::{FetchError, FetchRequest, HttpFetcher, ResponseCache},
        sink::{InMemorySink, ValueSink},
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers by URL substring; `slow` sleeps for a minute.
    #[derive(Default)]
    struct ScriptedFetcher {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpFetcher for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError> {
            self.urls.lock().unwrap().push(request.url.clone());
            if request.url.contains("slow") {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return Err(FetchError::Timeout);
            }
            if request.url.contains("down") {
                return Err(FetchError::Status(503));
            }
            if request.url.contains("ip.") {
                return Ok(r#"{"query":"9.9.9.9"}"#.to_string());
            }
            Ok(format!(r#"{{"value":"{}","score":72}}"#, request.url))
        }
    }

    fn setup() -> (Arc<ScriptedFetcher>, Arc<InMemorySink>, InstanceExecutor) {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let sink = InMemorySink::new();
        let exec = InstanceExecutor::new(
            StepExecutor::new(ResponseCache::new(fetcher.clone())),
            Publisher::new(sink.clone(), "DASH"),
            Stagger {
                step: Duration::from_millis(5),
                max: Duration::from_millis(20),
            },
        );
        (fetcher, sink, exec)
    }

    fn template(v: serde_json::Value) -> Template {
        let t: Template = serde_json::from_value(v).unwrap();
        t.validate().unwrap();
        t
    }

    fn instance(id: &str, template_id: &str, targets: Vec<BTreeMap<String, String>>) -> InstanceConfig {
        InstanceConfig {
            id: id.into(),
            template_id: template_id.into(),
            enabled: true,
            custom_interval: 0,
            inputs: BTreeMap::new(),
            targets,
        }
    }

    fn target(host: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("host".to_string(), host.to_string())])
    }

    #[test]
    fn stagger_grows_and_caps() {
        let s = Stagger::default();
        assert_eq!(s.delay_for(0), Duration::ZERO);
        assert_eq!(s.delay_for(3), Duration::from_millis(750));
        assert_eq!(s.delay_for(100), Duration::from_secs(2));
    }

    #[test]
    fn inputs_merge_in_order() {
        let t = template(json!({
            "id": "t",
            "inputs": [ { "key": "a", "default": "da" }, { "key": "b", "default": "db" },
                        { "key": "c", "default": "dc" } ],
            "execution": { "type": "api_json", "url": "https://x.example/" }
        }));
        let mut inst = instance("i", "t", Vec::new());
        inst.inputs = BTreeMap::from([("a".into(), "ia".into()), ("b".into(), "ib".into())]);
        let overrides = BTreeMap::from([("b".to_string(), "ob".to_string())]);

        let ctx = merge_inputs(&inst, &overrides, &t);
        assert_eq!(ctx["a"], "ia");
        assert_eq!(ctx["b"], "ob");
        assert_eq!(ctx["c"], "dc");
    }

    #[tokio::test]
    async fn failing_target_does_not_affect_siblings() {
        let (_, sink, exec) = setup();
        let t = template(json!({
            "id": "status",
            "execution": { "type": "api_json", "url": "https://{{host}}/status",
                           "extract": { "value": "value" } },
            "outputs": [ { "key": "value", "format": "{{value}}" } ]
        }));
        let inst = instance("st", "status", vec![target("up.example"), target("down.example")]);

        let report = exec.run(&inst, &t, &CancellationToken::new()).await;

        assert_eq!(report, RunReport { targets: 2, failed: 1, cancelled: false });
        assert_eq!(
            sink.get_value("DASH.st.0.value").as_deref(),
            Some("https://up.example/status")
        );
        assert_eq!(sink.get_value("DASH.st.1.value").as_deref(), Some(ERROR_VALUE));
    }

    #[tokio::test]
    async fn chain_runs_steps_in_order_and_applies_plan_transforms() {
        let (fetcher, sink, exec) = setup();
        let t = template(json!({
            "id": "geo",
            "inputs": [ { "key": "ip", "default": "" } ],
            "execution": {
                "type": "chain",
                "steps": [
                    { "id": "lookup", "url": "https://ip.example/", "skip_if_set": "ip",
                      "extract": { "ip": "query" } },
                    { "id": "score", "url": "https://score.example/{{ip}}",
                      "extract": { "score": "score" } }
                ],
                "process": [ { "var": "level", "source_var": "score", "function": "threshold_switch",
                               "map": { "0": "low", "50": "mid", "90": "high" } } ]
            },
            "outputs": [ { "key": "level", "format": "{{level}} ({{ip}})" } ]
        }));

        exec.run(&instance("g", "geo", Vec::new()), &t, &CancellationToken::new())
            .await;

        assert_eq!(
            *fetcher.urls.lock().unwrap(),
            vec!["https://ip.example/".to_string(), "https://score.example/9.9.9.9".to_string()]
        );
        assert_eq!(sink.get_value("DASH.g.level").as_deref(), Some("mid (9.9.9.9)"));
    }

    #[tokio::test]
    async fn raw_body_is_published_without_outputs() {
        let (_, sink, exec) = setup();
        let t = template(json!({
            "id": "motd",
            "execution": { "type": "api_text", "url": "https://motd.example/" }
        }));

        exec.run(&instance("m", "motd", Vec::new()), &t, &CancellationToken::new())
            .await;

        assert_eq!(
            sink.get_value("DASH.m").as_deref(),
            Some(r#"{"value":"https://motd.example/","score":72}"#)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_without_publishing_errors() {
        let (_, sink, exec) = setup();
        let t = template(json!({
            "id": "slow",
            "execution": { "type": "api_json", "url": "https://slow.example/" },
            "outputs": [ { "key": "v", "format": "{{v}}" } ]
        }));
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            })
        };

        let report = exec.run(&instance("s", "slow", Vec::new()), &t, &token).await;
        canceller.await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.failed, 0);
        assert!(sink.get_value("DASH.s.v").is_none());
    }
}
