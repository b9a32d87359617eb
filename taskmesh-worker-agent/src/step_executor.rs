//! The browser-automation step executor is explicitly out of scope (§1):
//! "treated as an opaque `run(script, variables) → {steps[], ok}` function".
//! This module is that boundary — a trait the runner (C9) calls through,
//! plus a deterministic stub implementation used in production until a real
//! browser driver is wired in and in tests, where a real driver would be
//! both undesirable and unavailable.

use async_trait::async_trait;
use taskmesh_broker::Step;

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub message: Option<String>,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// A single task's browser, started lazily and never shared across
/// concurrently running tasks (§9's "per-task threads vs. pool" note — the
/// invariant that survives pooling is that no two runners share a driver).
#[async_trait]
pub trait BrowserSession: Send {
    /// `step`'s params have already been through `${name}` interpolation
    /// (§4.9 step 3) by the time the runner calls this.
    async fn run_step(&mut self, step: &Step) -> StepOutcome;

    /// Captures a screenshot after a failed step, returned as the `image_data`
    /// shape `POST /tasks/{id}/screenshot` expects (base64 or a data URL).
    async fn capture_screenshot(&mut self) -> Option<String>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(&self, browser_type: &str) -> anyhow::Result<Box<dyn BrowserSession>>;
}

/// The stub boundary implementation: every step succeeds unless its params
/// carry `{"fail": true}`, which lets tests exercise the failure/screenshot
/// path without a real browser driver. Swapping in a real `BrowserFactory`
/// (Playwright/WebDriver-backed) is the out-of-scope integration point
/// named in §1.
pub struct StubBrowserFactory;

#[async_trait]
impl BrowserFactory for StubBrowserFactory {
    async fn launch(&self, _browser_type: &str) -> anyhow::Result<Box<dyn BrowserSession>> {
        Ok(Box::new(StubBrowserSession))
    }
}

struct StubBrowserSession;

#[async_trait]
impl BrowserSession for StubBrowserSession {
    async fn run_step(&mut self, step: &Step) -> StepOutcome {
        if step.params.get("fail").and_then(serde_json::Value::as_bool).unwrap_or(false) {
            StepOutcome::failed(format!("step '{}' failed", step.name))
        } else {
            StepOutcome::ok()
        }
    }

    async fn capture_screenshot(&mut self) -> Option<String> {
        None
    }

    async fn close(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as Json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn stub_fails_only_steps_marked_to_fail() {
        let factory = StubBrowserFactory;
        let mut session = factory.launch("chromium").await.unwrap();

        let passing = Step {
            step_type: "click".to_string(),
            name: "submit".to_string(),
            params: HashMap::new(),
        };
        let outcome = session.run_step(&passing).await;
        assert!(outcome.success);

        let mut failing_params = HashMap::new();
        failing_params.insert("fail".to_string(), Json::Bool(true));
        let failing = Step {
            step_type: "click".to_string(),
            name: "broken".to_string(),
            params: failing_params,
        };
        let outcome = session.run_step(&failing).await;
        assert!(!outcome.success);
    }
}
