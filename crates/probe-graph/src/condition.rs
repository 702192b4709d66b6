use crate::ThreadState;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Contains,
    Exists,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Clause {
    key: String,
    operator: Operator,
    value: Option<String>,
}

/// A parsed route predicate over [`ThreadState`].
///
/// Clauses are joined with `&&` and take the forms `key=value`, `key!=value`,
/// `key~=text` (case-insensitive contains) or a bare `key` (present and
/// truthy). An empty expression always matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    source: String,
    clauses: Vec<Clause>,
}

impl Condition {
    pub fn parse(condition: &str) -> Result<Self, String> {
        let clauses = parse_clauses(condition)?;
        for clause in &clauses {
            if !is_condition_key(&clause.key) {
                return Err(format!("condition key '{}' is invalid", clause.key));
            }
            if clause.operator != Operator::Exists
                && clause.value.as_deref().unwrap_or_default().is_empty()
            {
                return Err(format!("condition clause on '{}' has empty value", clause.key));
            }
        }
        Ok(Self {
            source: condition.trim().to_string(),
            clauses,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, state: &ThreadState) -> bool {
        self.clauses.iter().all(|clause| {
            let actual = resolve_key(&clause.key, state);
            let expected = clause.value.as_deref().unwrap_or_default();
            match clause.operator {
                Operator::Exists => is_truthy(actual.as_ref()),
                Operator::Eq => equals(actual.as_ref(), expected),
                Operator::Ne => !equals(actual.as_ref(), expected),
                Operator::Contains => actual.as_ref().is_some_and(|value| {
                    json_to_string(value)
                        .to_lowercase()
                        .contains(&expected.to_lowercase())
                }),
            }
        })
    }
}

fn parse_clauses(condition: &str) -> Result<Vec<Clause>, String> {
    let mut out = Vec::new();
    for raw_clause in condition.split("&&") {
        let clause = raw_clause.trim();
        if clause.is_empty() {
            continue;
        }
        let (key, operator, value) = match split_operator(clause) {
            Some((left, operator, right)) => (left, operator, Some(right)),
            None => (clause, Operator::Exists, None),
        };
        let key = key.trim();
        if key.is_empty() {
            return Err("condition clause has empty key".to_string());
        }
        out.push(Clause {
            key: key.to_string(),
            operator,
            value: value.map(|raw| unquote(raw.trim()).to_string()),
        });
    }
    Ok(out)
}

/// Splits at the first `=`; the character before it picks `!=` or `~=`.
/// Operators inside the value stay part of the value.
fn split_operator(clause: &str) -> Option<(&str, Operator, &str)> {
    let index = clause.find('=')?;
    let (left, value) = (&clause[..index], &clause[index + 1..]);
    if let Some(key) = left.strip_suffix('!') {
        Some((key, Operator::Ne, value))
    } else if let Some(key) = left.strip_suffix('~') {
        Some((key, Operator::Contains, value))
    } else {
        Some((left, Operator::Eq, value))
    }
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(raw)
}

fn is_condition_key(key: &str) -> bool {
    if matches!(
        key,
        "last_result"
            | "last_hint"
            | "last_worker"
            | "message"
            | "steps"
            | "step_invocations"
            | "invocations"
            | "artifact"
    ) {
        return true;
    }
    let Some(field) = key.strip_prefix("fields.") else {
        return false;
    };
    let mut chars = field.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
}

fn resolve_key(key: &str, state: &ThreadState) -> Option<Value> {
    match key {
        "last_result" => state.last_result_label().map(|label| Value::String(label.to_string())),
        "last_hint" => state.last_hint().map(|hint| Value::String(hint.to_string())),
        "last_worker" => state.last_worker.clone().map(Value::String),
        "message" => state.latest_message().map(|message| Value::String(message.to_string())),
        "steps" => Some(Value::from(state.step_count)),
        "step_invocations" => Some(Value::from(state.step_invocations)),
        "invocations" => Some(Value::from(state.invocations)),
        "artifact" => state.generated_artifact_path.clone().map(Value::String),
        _ => key
            .strip_prefix("fields.")
            .and_then(|field| state.fields.get(field).cloned()),
    }
}

fn equals(actual: Option<&Value>, expected_raw: &str) -> bool {
    let expected = parse_literal(expected_raw);
    match (actual, expected) {
        (Some(Value::String(left)), Value::String(right)) => *left == right,
        (Some(Value::Bool(left)), Value::Bool(right)) => *left == right,
        (Some(Value::Number(left)), Value::Number(right)) => left.as_f64() == right.as_f64(),
        (Some(left), right) => json_to_string(left) == json_to_string(&right),
        (None, Value::Null) => true,
        (None, _) => false,
    }
}

fn parse_literal(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(integer) = trimmed.parse::<i64>() {
        return Value::Number(integer.into());
    }
    Value::String(trimmed.to_string())
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(inner) => inner.clone(),
        _ => value.to_string(),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(inner)) => *inner,
        Some(Value::String(inner)) => !inner.is_empty(),
        Some(Value::Number(number)) => number.as_f64() != Some(0.0),
        Some(Value::Array(inner)) => !inner.is_empty(),
        Some(Value::Object(inner)) => !inner.is_empty(),
    }
}
