//! Self-healing playbook: a data table from failure triggers to recovery
//! strategies. New strategies are added as rows, not as branches.

use crate::capability::{Action, observation_error_text};
use async_trait::async_trait;
use probe_eventlog::ObservationRecord;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

#[derive(Clone, Debug)]
pub enum Trigger {
    /// Case-insensitive substring of the error text or error type.
    Keyword(String),
    Pattern(Regex),
}

impl Trigger {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self::Keyword(keyword.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Pattern(Regex::new(pattern)?))
    }

    pub fn matches(&self, text: &str) -> bool {
        match self {
            Self::Keyword(keyword) => text
                .to_ascii_lowercase()
                .contains(&keyword.to_ascii_lowercase()),
            Self::Pattern(regex) => regex.is_match(text),
        }
    }
}

fn missing_node_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)no (such )?(node|element)").expect("pattern is valid"))
}

/// Proposes a replacement for an action whose observation failed. Returning
/// `None` means the strategy has nothing left to try.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn recover(&self, failed: &Action, observation: &ObservationRecord) -> Option<Action>;
}

#[derive(Clone)]
pub struct PlaybookRule {
    pub trigger: Trigger,
    pub strategy: Arc<dyn RecoveryStrategy>,
}

#[derive(Clone, Default)]
pub struct HealingPlaybook {
    rules: Vec<PlaybookRule>,
}

impl std::fmt::Debug for HealingPlaybook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|rule| rule.strategy.name()))
            .finish()
    }
}

impl HealingPlaybook {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rows for the common locator failures reported by browser executors.
    pub fn browser_defaults() -> Self {
        let fallback: Arc<dyn RecoveryStrategy> = Arc::new(SelectorFallbackStrategy);
        Self::empty()
            .with_rule(Trigger::keyword("ElementNotFound"), fallback.clone())
            .with_rule(Trigger::keyword("not visible"), fallback.clone())
            .with_rule(Trigger::Pattern(missing_node_pattern().clone()), fallback)
    }

    pub fn with_rule(mut self, trigger: Trigger, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.rules.push(PlaybookRule { trigger, strategy });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule whose trigger matches the failed observation.
    pub fn select(&self, observation: &ObservationRecord) -> Option<Arc<dyn RecoveryStrategy>> {
        let text = match observation.error_type.as_deref() {
            Some(error_type) => format!("{error_type}: {}", observation_error_text(observation)),
            None => observation_error_text(observation),
        };
        self.rules
            .iter()
            .find(|rule| rule.trigger.matches(&text))
            .map(|rule| rule.strategy.clone())
    }
}

/// Regenerates a locator from the failed action's context: the next entry of
/// `fallback_selectors`, then a `text=` locator built from the `text` parameter.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectorFallbackStrategy;

#[async_trait]
impl RecoveryStrategy for SelectorFallbackStrategy {
    fn name(&self) -> &str {
        "selector_fallback"
    }

    async fn recover(&self, failed: &Action, _observation: &ObservationRecord) -> Option<Action> {
        let mut parameters = failed.parameters.as_object()?.clone();

        let mut fallbacks: Vec<Value> = parameters
            .get("fallback_selectors")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if !fallbacks.is_empty() {
            let next = fallbacks.remove(0);
            if !next.is_string() {
                return None;
            }
            parameters.insert("selector".to_string(), next);
            parameters.insert("fallback_selectors".to_string(), Value::Array(fallbacks));
            return Some(Action::new(failed.tool.clone(), Value::Object(parameters)));
        }

        let text = failed.param_str("text")?;
        let locator = format!("text={text}");
        if failed.param_str("selector") == Some(locator.as_str()) {
            return None;
        }
        parameters.insert("selector".to_string(), Value::String(locator));
        Some(Action::new(failed.tool.clone(), Value::Object(parameters)))
    }
}
