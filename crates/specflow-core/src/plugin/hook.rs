//! Phase hooks: ordered, time-boxed, error-isolated plugin callbacks.
//!
//! Pre-phase hooks run before a phase's work and may veto it. Post-phase
//! hooks run after and are observational only; a veto from one is ignored.
//! A handler that fails or outlives the timeout is logged under its plugin's
//! name and skipped; the remaining hooks still run.

use super::registry::SharedRegistry;
use super::PluginResult;
use crate::state::{FlowMetadata, FlowState};
use crate::types::PhaseKind;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Which phase a hook is bound to. `*` binds to every phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Any,
    Phase(PhaseKind),
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Any => f.write_str("*"),
            HookPhase::Phase(kind) => write!(f, "{kind}"),
        }
    }
}

impl std::str::FromStr for HookPhase {
    type Err = crate::error::FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            Ok(HookPhase::Any)
        } else {
            s.parse().map(HookPhase::Phase)
        }
    }
}

impl Serialize for HookPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HookPhase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookTiming {
    Pre,
    Post,
}

impl fmt::Display for HookTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookTiming::Pre => "pre",
            HookTiming::Post => "post",
        })
    }
}

/// Execution order, earliest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HookPriority {
    Earliest,
    Early,
    #[default]
    Normal,
    Late,
    Latest,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Read-only snapshot handed to hook handlers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    pub phase: PhaseKind,
    pub timing: HookTiming,
    pub feature: String,
    pub spec_metadata: FlowMetadata,
    pub flow_state: FlowState,
}

impl HookContext {
    pub fn snapshot(phase: PhaseKind, timing: HookTiming, state: &FlowState) -> Self {
        Self {
            phase,
            timing,
            feature: state.feature.clone(),
            spec_metadata: state.metadata.clone(),
            flow_state: state.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum HookResponse {
    Continue,
    Veto { reason: String },
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, ctx: &HookContext) -> anyhow::Result<HookResponse>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(&HookContext) -> anyhow::Result<HookResponse> + Send + Sync,
{
    async fn handle(&self, ctx: &HookContext) -> anyhow::Result<HookResponse> {
        (self.0)(ctx)
    }
}

#[derive(Clone)]
pub struct HookRegistration {
    pub phase: HookPhase,
    pub timing: HookTiming,
    pub priority: HookPriority,
    pub handler: Arc<dyn HookHandler>,
}

impl HookRegistration {
    pub fn new(
        phase: HookPhase,
        timing: HookTiming,
        priority: HookPriority,
        handler: Arc<dyn HookHandler>,
    ) -> Self {
        Self {
            phase,
            timing,
            priority,
            handler,
        }
    }

    /// Build a registration around a synchronous closure.
    pub fn from_fn<F>(phase: HookPhase, timing: HookTiming, priority: HookPriority, f: F) -> Self
    where
        F: Fn(&HookContext) -> anyhow::Result<HookResponse> + Send + Sync + 'static,
    {
        Self::new(phase, timing, priority, Arc::new(FnHook(f)))
    }
}

impl fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistration")
            .field("phase", &self.phase)
            .field("timing", &self.timing)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookError {
    pub plugin: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRunResult {
    pub vetoed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub veto_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub veto_plugin: Option<String>,
    /// Owning plugin of every hook that was invoked, in invocation order.
    pub executed_hooks: Vec<String>,
    pub errors: Vec<HookError>,
}

// ---------------------------------------------------------------------------
// HookRunner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HookRunner {
    registry: SharedRegistry,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn register_hook(&self, plugin: &str, registration: HookRegistration) -> PluginResult<()> {
        tracing::debug!(
            plugin = %plugin,
            phase = %registration.phase,
            timing = %registration.timing,
            "hook registered"
        );
        self.registry.write().add_hook(plugin, registration);
        Ok(())
    }

    /// Hooks for `(phase, timing)` merged with wildcard hooks, ordered by
    /// priority and then registration order.
    pub fn ordered_hooks(
        &self,
        phase: PhaseKind,
        timing: HookTiming,
    ) -> Vec<(String, HookRegistration)> {
        let reg = self.registry.read();
        let mut hooks: Vec<_> = reg
            .get_hooks(HookPhase::Phase(phase), timing)
            .into_iter()
            .chain(reg.get_hooks(HookPhase::Any, timing))
            .collect();
        hooks.sort_by_key(|o| (o.registration.priority, o.seq));
        hooks
            .into_iter()
            .map(|o| (o.plugin.clone(), o.registration.clone()))
            .collect()
    }

    pub async fn run_pre_phase_hooks(&self, phase: PhaseKind, ctx: &HookContext) -> HookRunResult {
        self.run(phase, HookTiming::Pre, ctx).await
    }

    pub async fn run_post_phase_hooks(&self, phase: PhaseKind, ctx: &HookContext) -> HookRunResult {
        self.run(phase, HookTiming::Post, ctx).await
    }

    async fn run(&self, phase: PhaseKind, timing: HookTiming, base: &HookContext) -> HookRunResult {
        let ctx = HookContext {
            phase,
            timing,
            ..base.clone()
        };
        let mut result = HookRunResult::default();

        for (plugin, hook) in self.ordered_hooks(phase, timing) {
            result.executed_hooks.push(plugin.clone());
            let handled = super::guarded(hook.handler.handle(&ctx));
            let outcome = tokio::time::timeout(self.timeout, handled).await;

            let message = match outcome {
                Ok(Ok(HookResponse::Continue)) => continue,
                Ok(Ok(HookResponse::Veto { reason })) => {
                    if timing == HookTiming::Post {
                        tracing::debug!(plugin = %plugin, phase = %phase, "veto from post-phase hook ignored");
                        continue;
                    }
                    tracing::info!(plugin = %plugin, phase = %phase, reason = %reason, "phase vetoed");
                    result.vetoed = true;
                    result.veto_reason = Some(reason);
                    result.veto_plugin = Some(plugin);
                    return result;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(_) => format!("timed out after {}ms", self.timeout.as_millis()),
            };

            tracing::warn!(plugin = %plugin, phase = %phase, timing = %timing, error = %message, "hook failed");
            result.errors.push(HookError { plugin, message });
        }

        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkflowMode;
    use parking_lot::Mutex;

    fn ctx() -> HookContext {
        let state = FlowState::new("checkout-coupon", "add coupon", WorkflowMode::Greenfield, None);
        HookContext::snapshot(PhaseKind::DesignGenerating, HookTiming::Pre, &state)
    }

    fn recorder(
        runner: &HookRunner,
        log: &Arc<Mutex<Vec<String>>>,
        plugin: &str,
        phase: HookPhase,
        timing: HookTiming,
        priority: HookPriority,
        response: HookResponse,
    ) {
        let log = Arc::clone(log);
        let tag = plugin.to_string();
        runner
            .register_hook(
                plugin,
                HookRegistration::from_fn(phase, timing, priority, move |_| {
                    log.lock().push(tag.clone());
                    Ok(response.clone())
                }),
            )
            .unwrap();
    }

    fn pass(
        runner: &HookRunner,
        log: &Arc<Mutex<Vec<String>>>,
        plugin: &str,
        phase: HookPhase,
        timing: HookTiming,
        priority: HookPriority,
    ) {
        recorder(runner, log, plugin, phase, timing, priority, HookResponse::Continue);
    }

    const DESIGN: HookPhase = HookPhase::Phase(PhaseKind::DesignGenerating);

    #[tokio::test]
    async fn pre_hooks_run_in_priority_then_registration_order() {
        let runner = HookRunner::new(SharedRegistry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        use HookPriority::*;
        for (name, prio) in [
            ("latest", Latest),
            ("normal-1", Normal),
            ("earliest", Earliest),
            ("late", Late),
            ("normal-2", Normal),
            ("early", Early),
        ] {
            recorder(&runner, &log, name, DESIGN, HookTiming::Pre, prio, HookResponse::Continue);
        }

        let result = runner.run_pre_phase_hooks(PhaseKind::DesignGenerating, &ctx()).await;
        let expected = ["earliest", "early", "normal-1", "normal-2", "late", "latest"];
        assert_eq!(*log.lock(), expected);
        assert_eq!(result.executed_hooks, expected);
        assert!(!result.vetoed);
    }

    #[tokio::test]
    async fn wildcard_hooks_merge_with_phase_hooks() {
        let runner = HookRunner::new(SharedRegistry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        pass(&runner, &log, "specific", DESIGN, HookTiming::Pre, HookPriority::Late);
        pass(&runner, &log, "any", HookPhase::Any, HookTiming::Pre, HookPriority::Early);
        recorder(
            &runner,
            &log,
            "other-phase",
            HookPhase::Phase(PhaseKind::TasksGenerating),
            HookTiming::Pre,
            HookPriority::Earliest,
            HookResponse::Continue,
        );
        pass(&runner, &log, "post", DESIGN, HookTiming::Post, HookPriority::Earliest);

        runner.run_pre_phase_hooks(PhaseKind::DesignGenerating, &ctx()).await;
        assert_eq!(*log.lock(), ["any", "specific"]);
    }

    #[tokio::test]
    async fn normal_veto_stops_late_hooks() {
        let runner = HookRunner::new(SharedRegistry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let veto = HookResponse::Veto {
            reason: "design doc missing".into(),
        };
        pass(&runner, &log, "late", DESIGN, HookTiming::Pre, HookPriority::Late);
        pass(&runner, &log, "latest", DESIGN, HookTiming::Pre, HookPriority::Latest);
        recorder(&runner, &log, "gatekeeper", DESIGN, HookTiming::Pre, HookPriority::Normal, veto);
        pass(&runner, &log, "early", DESIGN, HookTiming::Pre, HookPriority::Early);

        let result = runner.run_pre_phase_hooks(PhaseKind::DesignGenerating, &ctx()).await;
        assert!(result.vetoed);
        assert_eq!(result.veto_plugin.as_deref(), Some("gatekeeper"));
        assert_eq!(result.veto_reason.as_deref(), Some("design doc missing"));
        assert_eq!(*log.lock(), ["early", "gatekeeper"]);
        assert_eq!(result.executed_hooks, ["early", "gatekeeper"]);
    }

    #[tokio::test]
    async fn post_hooks_ignore_vetoes() {
        let runner = HookRunner::new(SharedRegistry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let veto = HookResponse::Veto { reason: "no".into() };
        recorder(&runner, &log, "a", DESIGN, HookTiming::Post, HookPriority::Early, veto);
        pass(&runner, &log, "b", DESIGN, HookTiming::Post, HookPriority::Late);

        let result = runner.run_post_phase_hooks(PhaseKind::DesignGenerating, &ctx()).await;
        assert!(!result.vetoed);
        assert_eq!(*log.lock(), ["a", "b"]);
    }

    #[tokio::test]
    async fn failing_hook_is_isolated() {
        let runner = HookRunner::new(SharedRegistry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        runner
            .register_hook(
                "broken",
                HookRegistration::from_fn(DESIGN, HookTiming::Pre, HookPriority::Early, |_| {
                    anyhow::bail!("exploded")
                }),
            )
            .unwrap();
        pass(&runner, &log, "fine", DESIGN, HookTiming::Pre, HookPriority::Late);

        let result = runner.run_pre_phase_hooks(PhaseKind::DesignGenerating, &ctx()).await;
        assert_eq!(*log.lock(), ["fine"]);
        assert_eq!(
            result.errors,
            vec![HookError {
                plugin: "broken".into(),
                message: "exploded".into()
            }]
        );
    }

    struct Sleeper(Duration);

    #[async_trait]
    impl HookHandler for Sleeper {
        async fn handle(&self, _ctx: &HookContext) -> anyhow::Result<HookResponse> {
            tokio::time::sleep(self.0).await;
            Ok(HookResponse::Veto {
                reason: "too late".into(),
            })
        }
    }

    #[tokio::test]
    async fn timeout_counts_as_error_and_execution_continues() {
        let runner =
            HookRunner::new(SharedRegistry::default()).with_timeout(Duration::from_millis(20));
        let log = Arc::new(Mutex::new(Vec::new()));
        runner
            .register_hook(
                "slow",
                HookRegistration::new(
                    DESIGN,
                    HookTiming::Pre,
                    HookPriority::Earliest,
                    Arc::new(Sleeper(Duration::from_secs(5))),
                ),
            )
            .unwrap();
        pass(&runner, &log, "next", DESIGN, HookTiming::Pre, HookPriority::Normal);

        let result = runner.run_pre_phase_hooks(PhaseKind::DesignGenerating, &ctx()).await;
        assert!(!result.vetoed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].plugin, "slow");
        assert!(result.errors[0].message.contains("timed out"));
        assert_eq!(*log.lock(), ["next"]);
    }

    #[tokio::test]
    async fn panicking_hook_is_isolated() {
        let runner = HookRunner::new(SharedRegistry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        runner
            .register_hook(
                "crashy",
                HookRegistration::from_fn(DESIGN, HookTiming::Pre, HookPriority::Early, |_| {
                    panic!("hook blew up")
                }),
            )
            .unwrap();
        pass(&runner, &log, "next", DESIGN, HookTiming::Pre, HookPriority::Normal);

        let result = runner.run_pre_phase_hooks(PhaseKind::DesignGenerating, &ctx()).await;
        assert!(!result.vetoed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].plugin, "crashy");
        assert!(result.errors[0].message.contains("hook blew up"));
        assert_eq!(*log.lock(), ["next"]);
    }

    #[tokio::test]
    async fn handlers_see_the_requested_phase_and_timing() {
        let runner = HookRunner::new(SharedRegistry::default());
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        runner
            .register_hook(
                "p",
                HookRegistration::from_fn(
                    HookPhase::Any,
                    HookTiming::Post,
                    HookPriority::Normal,
                    move |c| {
                        *s.lock() = Some((c.phase, c.timing, c.feature.clone()));
                        Ok(HookResponse::Continue)
                    },
                ),
            )
            .unwrap();
        runner.run_post_phase_hooks(PhaseKind::Validation, &ctx()).await;
        assert_eq!(
            *seen.lock(),
            Some((PhaseKind::Validation, HookTiming::Post, "checkout-coupon".to_string()))
        );
    }

    #[test]
    fn hook_phase_and_response_serde() {
        assert_eq!(serde_json::to_string(&HookPhase::Any).unwrap(), "\"*\"");
        let p: HookPhase = serde_json::from_str("\"design-generating\"").unwrap();
        assert_eq!(p, DESIGN);
        assert!(serde_json::from_str::<HookPhase>("\"nope\"").is_err());

        let veto: HookResponse = serde_json::from_str(r#"{"action":"veto","reason":"x"}"#).unwrap();
        assert_eq!(veto, HookResponse::Veto { reason: "x".into() });
    }
}
