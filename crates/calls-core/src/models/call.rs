use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::schema::EMPLOYEES_FIELD;

/// One call as returned by `get.calls_report`
///
/// Kept as a raw JSON object: the API omits fields freely, and the normalizer
/// decides which keys survive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallRecord(Map<String, Value>);

impl CallRecord {
    /// Field lookup; `None` when the API omitted the key
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Call id rendered as text (the API sends it as a number)
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The `employees` collection when it is a proper list
    pub fn employees(&self) -> Option<&Vec<Value>> {
        self.0.get(EMPLOYEES_FIELD).and_then(Value::as_array)
    }
}

impl TryFrom<Value> for CallRecord {
    type Error = Value;

    /// Accepts JSON objects only; anything else is handed back
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}
