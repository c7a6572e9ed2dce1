use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ExecutionError, ExecutionScope};
use crate::{
    expression::{Context, apply_transforms, extract_rules, resolve_template},
    fetch::{CacheTtl, FetchError, FetchRequest, ResponseCache, cache::cache_key},
    template::Step,
};

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// `skip_if_set` was satisfied; nothing ran and the context is untouched.
    Skipped,
    /// The raw response body the step extracted from.
    Completed(Arc<str>),
}

/// Runs one step against a target's context.
#[derive(Clone)]
pub struct StepExecutor {
    cache: Arc<ResponseCache>,
}

impl StepExecutor {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }

    pub async fn execute(
        &self,
        step: &Step,
        ctx: &mut Context,
        scope: &ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutionError> {
        if let Some(var) = step.skip_if_set.as_deref() {
            if ctx.get(var).is_some_and(|v| !v.is_empty()) {
                debug!(step = %step.id, %var, "skipping step, variable already set");
                return Ok(StepOutcome::Skipped);
            }
        }
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let request = resolve_request(step, ctx);
        let key = cache_key(&scope.instance_id, &scope.target_suffix(), &step.id, &request);
        let url = request.url.clone();

        let body = match self
            .cache
            .get_or_fetch(
                &scope.instance_id,
                &key,
                CacheTtl::minutes(step.cache_minutes),
                request,
                cancel,
            )
            .await
        {
            Ok(body) => body,
            Err(FetchError::Cancelled) => return Err(ExecutionError::Cancelled),
            Err(source) => {
                warn!(
                    instance = %scope.instance_id,
                    step = %step.id,
                    %url,
                    error = %source,
                    "step failed"
                );
                return Err(ExecutionError::Step {
                    step_id: step.id.clone(),
                    source,
                });
            }
        };

        extract_rules(&body, step.response_format, &step.extract, ctx);
        apply_transforms(&step.process, ctx);
        Ok(StepOutcome::Completed(body))
    }
}

/// Resolve every placeholder in the step's request against `ctx`.
pub fn resolve_request(step: &Step, ctx: &Context) -> FetchRequest {
    FetchRequest {
        method: step.method.clone(),
        url: resolve_template(&step.url, ctx),
        body: step.body.as_deref().map(|b| resolve_template(b, ctx)),
        headers: step
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), resolve_template(v, ctx)))
            .collect(),
        encoding: step.encoding.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::HttpFetcher;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingFetcher {
        seen: Mutex<Vec<FetchRequest>>,
    }

    #[async_trait]
    impl HttpFetcher for RecordingFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError> {
            self.seen.lock().unwrap().push(request.clone());
            if request.url.contains("broken") {
                return Err(FetchError::Status(500));
            }
            Ok(r#"{"city":"Berlin Mitte","temp":21.50}"#.to_string())
        }
    }

    fn step(value: serde_json::Value) -> Step {
        serde_json::from_value(value).unwrap()
    }

    fn executor() -> (Arc<RecordingFetcher>, StepExecutor) {
        let fetcher = Arc::new(RecordingFetcher::default());
        let exec = StepExecutor::new(ResponseCache::new(fetcher.clone()));
        (fetcher, exec)
    }

    #[tokio::test]
    async fn resolves_request_extracts_and_transforms() {
        let (fetcher, exec) = executor();
        let s = step(json!({
            "id": "geo",
            "method": "POST",
            "url": "https://geo.example/{{ip}}",
            "body": "{\"ip\":\"{{ip}}\"}",
            "headers": { "X-Key": "{{token}}" },
            "extract": { "city": "city", "temp": "temp" },
            "process": [ { "var": "city", "function": "regex_replace", "pattern": "\\s+", "to": "_" } ]
        }));
        let mut ctx = Context::from([
            ("ip".to_string(), "1.2.3.4".to_string()),
            ("token".to_string(), "s3cr3t".to_string()),
        ]);

        let outcome = exec
            .execute(&s, &mut ctx, &ExecutionScope::new("geo", None), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Completed(_)));
        assert_eq!(ctx["city"], "Berlin_Mitte");
        assert_eq!(ctx["temp"], "21.50");

        let seen = fetcher.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://geo.example/1.2.3.4");
        assert_eq!(seen[0].body.as_deref(), Some("{\"ip\":\"1.2.3.4\"}"));
        assert_eq!(seen[0].headers["X-Key"], "s3cr3t");
    }

    #[tokio::test]
    async fn skip_leaves_context_untouched() {
        let (fetcher, exec) = executor();
        let s = step(json!({
            "id": "lookup",
            "url": "https://ip.example/json",
            "skip_if_set": "ip",
            "extract": { "ip": "query" }
        }));
        let mut ctx = Context::from([("ip".to_string(), "1.2.3.4".to_string())]);
        let before = ctx.clone();

        let outcome = exec
            .execute(&s, &mut ctx, &ExecutionScope::new("geo", None), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, StepOutcome::Skipped);
        assert_eq!(ctx, before);
        assert!(fetcher.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_skip_variable_still_runs() {
        let (fetcher, exec) = executor();
        let s = step(json!({ "id": "lookup", "url": "https://ip.example/json", "skip_if_set": "ip" }));
        let mut ctx = Context::from([("ip".to_string(), String::new())]);

        exec.execute(&s, &mut ctx, &ExecutionScope::new("geo", None), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fetcher.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_errors_and_cancellation_are_distinct() {
        let (_, exec) = executor();
        let s = step(json!({ "id": "bad", "url": "https://broken.example/" }));
        let scope = ExecutionScope::new("geo", Some(0));

        let err = exec
            .execute(&s, &mut Context::new(), &scope, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Step { ref step_id, source: FetchError::Status(500) } if step_id == "bad"
        ));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = exec
            .execute(&s, &mut Context::new(), &scope, &cancelled)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
