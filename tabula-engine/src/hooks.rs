//! User hook lifecycle. Hooks observe immutable snapshots of pipeline state
//! and communicate back only through returned annotations; they cannot mutate
//! the document or the run from inside the callback.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tabula_model::{Annotation, ConfigVersionId, HookStage, RunId};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// What a hook invocation reports back.
#[derive(Clone, Debug)]
pub enum HookOutcome {
    /// Completed; optionally carries a value recorded as an annotation.
    Ok(Option<Value>),
    /// Failed in a way the pipeline should note and move past.
    NonFatal(String),
    /// Failed in a way that must stop the enclosing operation.
    Fatal(String),
}

/// Read-only copy of pipeline state handed to one hook invocation. Each hook
/// receives its own deep copy, so mutation inside a callback is invisible to
/// the pipeline and to later hooks.
#[derive(Clone, Debug)]
pub struct StageSnapshot {
    pub stage: HookStage,
    pub config_version: ConfigVersionId,
    pub run_id: Option<RunId>,
    pub attempt: Option<u16>,
    pub data: Value,
}

impl StageSnapshot {
    pub fn activation(config_version: ConfigVersionId, data: Value) -> Self {
        Self {
            stage: HookStage::Activation,
            config_version,
            run_id: None,
            attempt: None,
            data,
        }
    }

    pub fn for_run(
        stage: HookStage,
        config_version: ConfigVersionId,
        run_id: RunId,
        attempt: u16,
        data: Value,
    ) -> Self {
        Self {
            stage,
            config_version,
            run_id: Some(run_id),
            attempt: Some(attempt),
            data,
        }
    }
}

pub type HookCallback = Arc<dyn Fn(StageSnapshot) -> HookOutcome + Send + Sync>;

#[derive(Clone)]
pub struct HookRecord {
    pub name: String,
    pub stage: HookStage,
    pub enabled: bool,
    callback: HookCallback,
}

impl fmt::Debug for HookRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRecord")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl HookRecord {
    pub fn new(
        name: impl Into<String>,
        stage: HookStage,
        callback: HookCallback,
    ) -> Self {
        Self {
            name: name.into(),
            stage,
            enabled: true,
            callback,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Hooks registered by one configuration version, kept in declaration order.
/// The registry is immutable once the version is activated.
#[derive(Clone, Debug, Default)]
pub struct HookRegistry {
    hooks: Vec<HookRecord>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, hook: HookRecord) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Enabled hooks for `stage`, in declaration order.
    pub fn for_stage(&self, stage: HookStage) -> impl Iterator<Item = &HookRecord> {
        self.hooks
            .iter()
            .filter(move |hook| hook.stage == stage && hook.enabled)
    }

    /// Run the hooks of a per-run stage against `snapshot`.
    ///
    /// Non-fatal failures are logged, recorded as annotations, and skipped
    /// past; a fatal outcome aborts immediately with `HookFatal`. Returns the
    /// annotations accumulated from the hooks that ran.
    pub fn run_stage(&self, stage: HookStage, snapshot: &StageSnapshot) -> Result<Vec<Annotation>> {
        let mut annotations = Vec::new();
        for hook in self.for_stage(stage) {
            match (hook.callback)(snapshot.clone()) {
                HookOutcome::Ok(Some(value)) => {
                    debug!(
                        target: "engine::hooks",
                        hook = %hook.name,
                        %stage,
                        "hook completed with annotation"
                    );
                    annotations.push(Annotation::new(stage, &hook.name, value));
                }
                HookOutcome::Ok(None) => {}
                HookOutcome::NonFatal(detail) => {
                    warn!(
                        target: "engine::hooks",
                        hook = %hook.name,
                        %stage,
                        detail,
                        "hook failed non-fatally"
                    );
                    annotations.push(Annotation::new(
                        stage,
                        &hook.name,
                        serde_json::json!({ "error": detail }),
                    ));
                }
                HookOutcome::Fatal(detail) => {
                    return Err(EngineError::HookFatal {
                        hook_name: hook.name.clone(),
                        detail,
                    });
                }
            }
        }
        Ok(annotations)
    }

    /// Run the activation-stage hooks. Activation is gating: any outcome
    /// other than `Ok` fails the whole activation, non-fatal included.
    pub fn run_activation(&self, snapshot: &StageSnapshot) -> Result<Vec<Annotation>> {
        let mut annotations = Vec::new();
        for hook in self.for_stage(HookStage::Activation) {
            match (hook.callback)(snapshot.clone()) {
                HookOutcome::Ok(Some(value)) => {
                    annotations.push(Annotation::new(HookStage::Activation, &hook.name, value));
                }
                HookOutcome::Ok(None) => {}
                HookOutcome::NonFatal(detail) | HookOutcome::Fatal(detail) => {
                    return Err(EngineError::ActivationFailed {
                        config_version: snapshot.config_version,
                        hook_name: hook.name.clone(),
                        detail,
                    });
                }
            }
        }
        Ok(annotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_hook(name: &str, stage: HookStage, value: Value) -> HookRecord {
        HookRecord::new(
            name,
            stage,
            Arc::new(move |_| HookOutcome::Ok(Some(value.clone()))),
        )
    }

    #[test]
    fn hooks_run_in_declaration_order() {
        let registry = HookRegistry::new()
            .register(ok_hook("first", HookStage::PreExecution, json!(1)))
            .register(ok_hook("second", HookStage::PreExecution, json!(2)))
            .register(ok_hook("post-only", HookStage::PostExecution, json!(3)));

        let snapshot = StageSnapshot::for_run(
            HookStage::PreExecution,
            ConfigVersionId::new(),
            RunId::new(),
            1,
            Value::Null,
        );
        let annotations = registry
            .run_stage(HookStage::PreExecution, &snapshot)
            .unwrap();
        let names: Vec<_> = annotations.iter().map(|a| a.hook_name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn non_fatal_failure_is_recorded_and_skipped_past() {
        let registry = HookRegistry::new()
            .register(HookRecord::new(
                "flaky",
                HookStage::PostExecution,
                Arc::new(|_| HookOutcome::NonFatal("upstream 503".into())),
            ))
            .register(ok_hook("steady", HookStage::PostExecution, json!("ok")));

        let snapshot = StageSnapshot::for_run(
            HookStage::PostExecution,
            ConfigVersionId::new(),
            RunId::new(),
            1,
            Value::Null,
        );
        let annotations = registry
            .run_stage(HookStage::PostExecution, &snapshot)
            .unwrap();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].value, json!({ "error": "upstream 503" }));
        assert_eq!(annotations[1].hook_name, "steady");
    }

    #[test]
    fn fatal_failure_aborts_the_stage() {
        let registry = HookRegistry::new().register(HookRecord::new(
            "guard",
            HookStage::PreExecution,
            Arc::new(|_| HookOutcome::Fatal("input rejected".into())),
        ));

        let snapshot = StageSnapshot::for_run(
            HookStage::PreExecution,
            ConfigVersionId::new(),
            RunId::new(),
            1,
            Value::Null,
        );
        let err = registry
            .run_stage(HookStage::PreExecution, &snapshot)
            .unwrap_err();
        assert!(matches!(err, EngineError::HookFatal { .. }));
    }

    #[test]
    fn activation_treats_non_fatal_as_gating() {
        let registry = HookRegistry::new().register(HookRecord::new(
            "schema-check",
            HookStage::Activation,
            Arc::new(|_| HookOutcome::NonFatal("schema drift".into())),
        ));

        let snapshot = StageSnapshot::activation(ConfigVersionId::new(), Value::Null);
        let err = registry.run_activation(&snapshot).unwrap_err();
        assert!(matches!(err, EngineError::ActivationFailed { .. }));
    }

    #[test]
    fn hook_mutation_of_its_snapshot_is_invisible_to_later_hooks() {
        let registry = HookRegistry::new()
            .register(HookRecord::new(
                "mutator",
                HookStage::PreExecution,
                Arc::new(|mut snapshot| {
                    snapshot.data = json!({ "tampered": true });
                    HookOutcome::Ok(None)
                }),
            ))
            .register(HookRecord::new(
                "observer",
                HookStage::PreExecution,
                Arc::new(|snapshot| HookOutcome::Ok(Some(snapshot.data))),
            ));

        let snapshot = StageSnapshot::for_run(
            HookStage::PreExecution,
            ConfigVersionId::new(),
            RunId::new(),
            1,
            json!({ "original": true }),
        );
        let annotations = registry
            .run_stage(HookStage::PreExecution, &snapshot)
            .unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].value, json!({ "original": true }));
    }

    #[test]
    fn disabled_hooks_are_skipped() {
        let registry = HookRegistry::new().register(
            ok_hook("off", HookStage::PreExecution, json!(1)).disabled(),
        );
        let snapshot = StageSnapshot::for_run(
            HookStage::PreExecution,
            ConfigVersionId::new(),
            RunId::new(),
            1,
            Value::Null,
        );
        let annotations = registry
            .run_stage(HookStage::PreExecution, &snapshot)
            .unwrap();
        assert!(annotations.is_empty());
    }
}
