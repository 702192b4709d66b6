use crate::{Condition, GraphError, ThreadState, WorkerRegistry};
use probe_agent::{BROWSER_WORKER, CODER_WORKER, Capability, SUPERVISOR_WORKER};
use serde::{Deserialize, Serialize};

const CAPABILITY_TARGET_PREFIX: &str = "capability:";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "worker", rename_all = "snake_case")]
pub enum NextNode {
    Worker(String),
    End,
}

/// One declared `(condition, target)` pair. `worker` is a registered worker
/// name or `capability:<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    pub when: String,
    pub worker: String,
}

impl RouteRuleConfig {
    pub fn new(when: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            when: when.into(),
            worker: worker.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Routes to END when it matches. Checked before any rule.
    pub terminal: Option<String>,
    pub rules: Vec<RouteRuleConfig>,
    pub default_worker: Option<String>,
}

impl RoutingConfig {
    /// Routing for the browser/coder/supervisor deployment: follow the last
    /// hint, send generation requests to the filesystem worker, browse
    /// otherwise, and stop once a worker finished within the step.
    pub fn standard() -> Self {
        Self {
            terminal: Some("step_invocations && last_result=done".to_string()),
            rules: vec![
                RouteRuleConfig::new(
                    format!("last_result=continue && last_hint={CODER_WORKER}"),
                    CODER_WORKER,
                ),
                RouteRuleConfig::new(
                    format!("last_result=continue && last_hint={BROWSER_WORKER}"),
                    BROWSER_WORKER,
                ),
                RouteRuleConfig::new(
                    format!("last_result=continue && last_hint={SUPERVISOR_WORKER}"),
                    SUPERVISOR_WORKER,
                ),
                RouteRuleConfig::new(
                    "step_invocations=0 && message~=generate",
                    format!("{CAPABILITY_TARGET_PREFIX}filesystem"),
                ),
                RouteRuleConfig::new(
                    "step_invocations=0 && message~=review",
                    format!("{CAPABILITY_TARGET_PREFIX}review"),
                ),
            ],
            default_worker: Some(BROWSER_WORKER.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct RouteRule {
    condition: Condition,
    worker: String,
    guard: Option<Condition>,
}

/// Which part of the routing table produced a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "matched", content = "index", rename_all = "snake_case")]
pub enum RouteMatch {
    Terminal,
    Rule(usize),
    Default,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub next: NextNode,
    pub matched: RouteMatch,
}

/// Compiled routing table. Every target is a registered worker, so routing
/// itself cannot fail.
#[derive(Clone, Debug, PartialEq)]
pub struct Router {
    terminal: Option<Condition>,
    rules: Vec<RouteRule>,
    default_worker: String,
}

impl Router {
    pub fn compile(config: &RoutingConfig, registry: &WorkerRegistry) -> Result<Self, GraphError> {
        let terminal = config
            .terminal
            .as_deref()
            .map(str::trim)
            .filter(|terminal| !terminal.is_empty())
            .map(parse_condition)
            .transpose()?;

        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let worker = resolve_target(&rule.worker, registry)?;
            let guard = registry
                .descriptor(&worker)
                .and_then(|descriptor| descriptor.entry_condition.clone());
            rules.push(RouteRule {
                condition: parse_condition(&rule.when)?,
                worker,
                guard,
            });
        }

        let default_worker = match config.default_worker.as_deref() {
            Some(target) if !target.trim().is_empty() => resolve_target(target, registry)?,
            _ => {
                return Err(GraphError::RoutingExhausted(
                    "no default worker configured".to_string(),
                ));
            }
        };

        Ok(Self {
            terminal,
            rules,
            default_worker,
        })
    }

    pub fn route(&self, state: &ThreadState) -> NextNode {
        self.decide(state).next
    }

    /// Terminal condition first, then rules in declaration order, then the
    /// default worker.
    pub fn decide(&self, state: &ThreadState) -> RouteDecision {
        if self
            .terminal
            .as_ref()
            .is_some_and(|terminal| terminal.evaluate(state))
        {
            return RouteDecision {
                next: NextNode::End,
                matched: RouteMatch::Terminal,
            };
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.condition.evaluate(state) {
                continue;
            }
            if rule.guard.as_ref().is_some_and(|guard| !guard.evaluate(state)) {
                continue;
            }
            return RouteDecision {
                next: NextNode::Worker(rule.worker.clone()),
                matched: RouteMatch::Rule(index),
            };
        }

        RouteDecision {
            next: NextNode::Worker(self.default_worker.clone()),
            matched: RouteMatch::Default,
        }
    }

    pub fn default_worker(&self) -> &str {
        &self.default_worker
    }

    /// Every worker the table can route to, in declaration order.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .map(|rule| rule.worker.as_str())
            .chain(std::iter::once(self.default_worker.as_str()))
    }
}

fn parse_condition(condition: &str) -> Result<Condition, GraphError> {
    Condition::parse(condition).map_err(|reason| GraphError::InvalidCondition {
        condition: condition.to_string(),
        reason,
    })
}

fn resolve_target(target: &str, registry: &WorkerRegistry) -> Result<String, GraphError> {
    let target = target.trim();
    if let Some(capability) = target.strip_prefix(CAPABILITY_TARGET_PREFIX) {
        let capability = Capability::parse(capability).ok_or_else(|| {
            GraphError::InvalidGraph(format!("unknown capability in route target '{target}'"))
        })?;
        return registry
            .find_by_capability(capability)
            .map(|descriptor| descriptor.name.clone())
            .ok_or_else(|| {
                GraphError::UnknownWorker(format!(
                    "no registered worker provides capability '{}'",
                    capability.as_str()
                ))
            });
    }
    if !registry.contains(target) {
        return Err(GraphError::UnknownWorker(target.to_string()));
    }
    Ok(target.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_agent::{AgentError, WorkerContext, WorkerResult, WorkerRun, WorkerUnit};
    use probe_eventlog::SessionState;
    use std::sync::Arc;

    struct NamedWorker {
        name: &'static str,
        capabilities: Vec<Capability>,
    }

    #[async_trait::async_trait]
    impl WorkerUnit for NamedWorker {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &self.capabilities
        }

        async fn run(
            &self,
            _ctx: &WorkerContext,
            _state: &SessionState,
            _input: &str,
        ) -> Result<WorkerRun, AgentError> {
            Ok(WorkerRun::new(Vec::new(), WorkerResult::done("noop")))
        }
    }

    fn registry() -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        for (name, capability) in [
            ("browser", Capability::Browser),
            ("coder", Capability::Filesystem),
            ("supervisor", Capability::Review),
        ] {
            registry
                .register(Arc::new(NamedWorker {
                    name,
                    capabilities: vec![capability],
                }))
                .expect("registration should succeed");
        }
        registry
    }

    fn thread_with_message(message: &str) -> ThreadState {
        let mut state = ThreadState::new("t");
        state.messages.push(message.to_string());
        state
    }

    #[test]
    fn compile_without_default_expected_routing_exhausted() {
        let config = RoutingConfig {
            default_worker: None,
            ..RoutingConfig::standard()
        };
        let error = Router::compile(&config, &registry()).expect_err("compile should fail");
        assert!(matches!(error, GraphError::RoutingExhausted(_)));
    }

    #[test]
    fn compile_unknown_target_expected_unknown_worker() {
        let config = RoutingConfig {
            rules: vec![RouteRuleConfig::new("message~=perf", "performance")],
            default_worker: Some("browser".to_string()),
            terminal: None,
        };
        let error = Router::compile(&config, &registry()).expect_err("compile should fail");
        assert!(matches!(error, GraphError::UnknownWorker(name) if name == "performance"));
    }

    #[test]
    fn compile_invalid_condition_expected_invalid_condition() {
        let config = RoutingConfig {
            rules: vec![RouteRuleConfig::new("outcome=success", "coder")],
            default_worker: Some("browser".to_string()),
            terminal: None,
        };
        let error = Router::compile(&config, &registry()).expect_err("compile should fail");
        assert!(matches!(error, GraphError::InvalidCondition { .. }));
    }

    #[test]
    fn route_capability_target_resolves_to_registered_worker() {
        let router = Router::compile(&RoutingConfig::standard(), &registry())
            .expect("router should compile");
        assert_eq!(
            router.route(&thread_with_message("generate a login test")),
            NextNode::Worker("coder".to_string())
        );
        assert_eq!(
            router.route(&thread_with_message("go to /login, click submit")),
            NextNode::Worker("browser".to_string())
        );
    }

    #[test]
    fn route_same_state_expected_same_target() {
        let router = Router::compile(&RoutingConfig::standard(), &registry())
            .expect("router should compile");
        let state = thread_with_message("review the run");
        let first = router.decide(&state);
        for _ in 0..10 {
            assert_eq!(router.decide(&state), first);
        }
        assert_eq!(first.matched, RouteMatch::Rule(4));
    }

    #[test]
    fn route_overlapping_rules_declaration_order_breaks_tie() {
        let state = thread_with_message("review and generate");
        let generate_first = RoutingConfig {
            terminal: None,
            rules: vec![
                RouteRuleConfig::new("message~=generate", "coder"),
                RouteRuleConfig::new("message~=review", "supervisor"),
            ],
            default_worker: Some("browser".to_string()),
        };
        let review_first = RoutingConfig {
            rules: generate_first.rules.iter().rev().cloned().collect(),
            ..generate_first.clone()
        };

        let router = Router::compile(&generate_first, &registry()).expect("compile");
        assert_eq!(router.route(&state), NextNode::Worker("coder".to_string()));
        let router = Router::compile(&review_first, &registry()).expect("compile");
        assert_eq!(
            router.route(&state),
            NextNode::Worker("supervisor".to_string())
        );

        // A rule matching alone is never skipped by reordering.
        let only_generate = thread_with_message("generate");
        assert_eq!(
            router.route(&only_generate),
            NextNode::Worker("coder".to_string())
        );
    }

    #[test]
    fn route_terminal_checked_before_rules() {
        let router = Router::compile(&RoutingConfig::standard(), &registry())
            .expect("router should compile");
        let mut state = thread_with_message("generate a test");
        state.step_invocations = 1;
        state.last_worker_result = Some(WorkerResult::done("wrote it"));
        let decision = router.decide(&state);
        assert_eq!(decision.next, NextNode::End);
        assert_eq!(decision.matched, RouteMatch::Terminal);
    }

    #[test]
    fn route_follows_continue_hint() {
        let router = Router::compile(&RoutingConfig::standard(), &registry())
            .expect("router should compile");
        let mut state = thread_with_message("go to /login");
        state.step_invocations = 1;
        state.last_worker_result = Some(WorkerResult::Continue {
            next_hint: Some("coder".to_string()),
        });
        assert_eq!(router.route(&state), NextNode::Worker("coder".to_string()));
    }

    #[test]
    fn route_rule_target_with_failing_entry_guard_falls_through() {
        let mut registry = WorkerRegistry::new();
        registry
            .register(Arc::new(NamedWorker {
                name: "browser",
                capabilities: vec![Capability::Browser],
            }))
            .expect("register");
        registry
            .register_with_entry(
                Arc::new(NamedWorker {
                    name: "coder",
                    capabilities: vec![Capability::Filesystem],
                }),
                Some("fields.repo_ready=true"),
            )
            .expect("register");
        let config = RoutingConfig {
            terminal: None,
            rules: vec![RouteRuleConfig::new("message~=generate", "coder")],
            default_worker: Some("browser".to_string()),
        };
        let router = Router::compile(&config, &registry).expect("compile");

        let mut state = thread_with_message("generate");
        assert_eq!(router.route(&state), NextNode::Worker("browser".to_string()));
        state
            .fields
            .insert("repo_ready".to_string(), serde_json::json!(true));
        assert_eq!(router.route(&state), NextNode::Worker("coder".to_string()));
    }
}
