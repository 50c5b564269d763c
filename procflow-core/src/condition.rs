use crate::types::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boolean entry-condition expression, evaluated against instance data.
///
/// An activity whose condition evaluates to false is created `Skipped`
/// instead of `Pending`; all other node kinds have no condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Const(bool),
    /// True when the key is present and not null.
    Defined(String),
    /// True when the key holds exactly this value.
    Equals { key: String, value: Value },
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn evaluate(&self, data: &Payload) -> bool {
        match self {
            Condition::Const(b) => *b,
            Condition::Defined(key) => data.get(key).is_some_and(|v| !v.is_null()),
            Condition::Equals { key, value } => data.get(key) == Some(value),
            Condition::Not(inner) => !inner.evaluate(data),
            Condition::All(parts) => parts.iter().all(|c| c.evaluate(data)),
            Condition::Any(parts) => parts.iter().any(|c| c.evaluate(data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> Payload {
        Payload::from([
            ("amount".to_string(), json!(250)),
            ("approved".to_string(), json!(true)),
            ("note".to_string(), json!(null)),
        ])
    }

    #[test]
    fn const_evaluates_to_itself() {
        assert!(Condition::Const(true).evaluate(&data()));
        assert!(!Condition::Const(false).evaluate(&data()));
    }

    #[test]
    fn defined_ignores_null_values() {
        assert!(Condition::Defined("amount".into()).evaluate(&data()));
        assert!(!Condition::Defined("note".into()).evaluate(&data()));
        assert!(!Condition::Defined("missing".into()).evaluate(&data()));
    }

    #[test]
    fn equals_compares_json_values() {
        assert!(Condition::Equals {
            key: "approved".into(),
            value: json!(true),
        }
        .evaluate(&data()));
        assert!(!Condition::Equals {
            key: "amount".into(),
            value: json!(999),
        }
        .evaluate(&data()));
    }

    #[test]
    fn composites_combine() {
        let cond = Condition::All(vec![
            Condition::Defined("amount".into()),
            Condition::Not(Box::new(Condition::Equals {
                key: "approved".into(),
                value: json!(false),
            })),
        ]);
        assert!(cond.evaluate(&data()));

        let cond = Condition::Any(vec![Condition::Const(false), Condition::Const(true)]);
        assert!(cond.evaluate(&data()));
        // Empty All is vacuously true, empty Any is vacuously false.
        assert!(Condition::All(vec![]).evaluate(&data()));
        assert!(!Condition::Any(vec![]).evaluate(&data()));
    }
}
