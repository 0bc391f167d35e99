use crate::change::FieldChange;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tessel_types::{FieldId, FieldUpdate, ListSplice, SchemaId, TextSplice};

/// The kind of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// A string edited with character splices.
    Text,
    /// An ordered sequence of JSON values edited with splices.
    List,
    /// A string-keyed map of JSON values edited key by key.
    Map,
    /// A single opaque JSON value replaced as a whole.
    Register,
}

impl FieldKind {
    /// Short name of the kind, matching [`FieldUpdate::kind_name`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::List => "list",
            Self::Map => "map",
            Self::Register => "register",
        }
    }

    /// The value an unset field of this kind reads as.
    #[must_use]
    pub fn default_value(&self) -> FieldValue {
        match self {
            Self::Text => FieldValue::Text(String::new()),
            Self::List => FieldValue::List(Vec::new()),
            Self::Map => FieldValue::Map(BTreeMap::new()),
            Self::Register => FieldValue::Register(Value::Null),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Describes a table's shape: its name and the kinds of its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub id: SchemaId,
    pub fields: BTreeMap<FieldId, FieldKind>,
}

impl Schema {
    /// Creates a schema with no fields.
    pub fn new(id: impl Into<SchemaId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field declaration.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<FieldId>, kind: FieldKind) -> Self {
        self.fields.insert(field.into(), kind);
        self
    }

    /// Shorthand for a text field.
    #[must_use]
    pub fn text(self, field: impl Into<FieldId>) -> Self {
        self.with_field(field, FieldKind::Text)
    }

    /// Shorthand for a list field.
    #[must_use]
    pub fn list(self, field: impl Into<FieldId>) -> Self {
        self.with_field(field, FieldKind::List)
    }

    /// Shorthand for a map field.
    #[must_use]
    pub fn map(self, field: impl Into<FieldId>) -> Self {
        self.with_field(field, FieldKind::Map)
    }

    /// Shorthand for a register field.
    #[must_use]
    pub fn register(self, field: impl Into<FieldId>) -> Self {
        self.with_field(field, FieldKind::Register)
    }

    /// Looks up a field's kind.
    pub fn kind_of(&self, field: &FieldId) -> StoreResult<FieldKind> {
        self.fields
            .get(field)
            .copied()
            .ok_or_else(|| StoreError::UnknownField {
                schema: self.id.clone(),
                field: field.clone(),
            })
    }
}

/// The current value of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Register(Value),
}

impl FieldValue {
    /// The kind this value belongs to.
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::List(_) => FieldKind::List,
            Self::Map(_) => FieldKind::Map,
            Self::Register(_) => FieldKind::Register,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<&Value> {
        match self {
            Self::Register(v) => Some(v),
            _ => None,
        }
    }

    /// Plain JSON form used by checkpoints.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::List(v) => Value::Array(v.clone()),
            Self::Map(m) => Value::Object(m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Self::Register(v) => v.clone(),
        }
    }

    /// Parses the plain JSON form of a field of the given kind.
    pub fn from_json(kind: FieldKind, field: &FieldId, value: Value) -> StoreResult<Self> {
        let mismatch = |actual: &'static str| StoreError::KindMismatch {
            field: field.clone(),
            expected: kind.name(),
            actual,
        };
        match (kind, value) {
            (FieldKind::Text, Value::String(s)) => Ok(Self::Text(s)),
            (FieldKind::List, Value::Array(v)) => Ok(Self::List(v)),
            (FieldKind::Map, Value::Object(m)) => Ok(Self::Map(
                m.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            )),
            (FieldKind::Register, v) => Ok(Self::Register(v)),
            (_, other) => Err(mismatch(json_type_name(&other))),
        }
    }

    /// Applies an update in place and returns the raw change it produced.
    ///
    /// On error the value is left untouched.
    pub fn apply(&mut self, field: &FieldId, update: &FieldUpdate) -> StoreResult<FieldChange> {
        match (self, update) {
            (Self::Text(text), FieldUpdate::Text { splices }) => {
                let mut chars: Vec<char> = text.chars().collect();
                for splice in splices {
                    apply_text_splice(&mut chars, field, splice)?;
                }
                *text = chars.into_iter().collect();
                Ok(FieldChange::Text(splices.clone()))
            }
            (Self::List(items), FieldUpdate::List { splices }) => {
                let mut next = items.clone();
                for splice in splices {
                    apply_list_splice(&mut next, field, splice)?;
                }
                *items = next;
                Ok(FieldChange::List(splices.clone()))
            }
            (Self::Map(map), FieldUpdate::Map { entries }) => {
                let mut previous = BTreeMap::new();
                let mut current = BTreeMap::new();
                for (key, value) in entries {
                    let old = if value.is_null() {
                        map.remove(key)
                    } else {
                        map.insert(key.clone(), value.clone())
                    };
                    previous
                        .entry(key.clone())
                        .or_insert_with(|| old.unwrap_or(Value::Null));
                    current.insert(key.clone(), value.clone());
                }
                Ok(FieldChange::Map { previous, current })
            }
            (Self::Register(value), FieldUpdate::Register { value: next }) => {
                let previous = std::mem::replace(value, next.clone());
                Ok(FieldChange::Register {
                    previous,
                    current: next.clone(),
                })
            }
            (this, update) => Err(StoreError::KindMismatch {
                field: field.clone(),
                expected: this.kind().name(),
                actual: update.kind_name(),
            }),
        }
    }

    /// The change that turns `self` into `next` wholesale.
    ///
    /// Returns `None` when the two are equal.
    #[must_use]
    pub fn replacement_change(&self, next: &FieldValue) -> Option<FieldChange> {
        if self == next {
            return None;
        }
        match (self, next) {
            (Self::Text(old), Self::Text(new)) => Some(FieldChange::Text(vec![TextSplice {
                index: 0,
                removed: old.clone(),
                inserted: new.clone(),
            }])),
            (Self::List(old), Self::List(new)) => Some(FieldChange::List(vec![ListSplice {
                index: 0,
                removed: old.clone(),
                inserted: new.clone(),
            }])),
            (Self::Map(old), Self::Map(new)) => {
                let mut previous = BTreeMap::new();
                let mut current = BTreeMap::new();
                for key in old.keys().chain(new.keys()) {
                    let before = old.get(key).cloned().unwrap_or(Value::Null);
                    let after = new.get(key).cloned().unwrap_or(Value::Null);
                    if before != after {
                        previous.insert(key.clone(), before);
                        current.insert(key.clone(), after);
                    }
                }
                Some(FieldChange::Map { previous, current })
            }
            (Self::Register(old), Self::Register(new)) => Some(FieldChange::Register {
                previous: old.clone(),
                current: new.clone(),
            }),
            _ => None,
        }
    }
}

fn apply_text_splice(chars: &mut Vec<char>, field: &FieldId, splice: &TextSplice) -> StoreResult<()> {
    let removed: Vec<char> = splice.removed.chars().collect();
    let Some(end) = splice
        .index
        .checked_add(removed.len())
        .filter(|&end| end <= chars.len())
    else {
        return Err(StoreError::SpliceOutOfRange {
            field: field.clone(),
            index: splice.index,
            len: chars.len(),
        });
    };
    if chars[splice.index..end] != removed[..] {
        return Err(StoreError::SpliceMismatch {
            field: field.clone(),
            index: splice.index,
        });
    }
    chars.splice(splice.index..end, splice.inserted.chars());
    Ok(())
}

fn apply_list_splice(items: &mut Vec<Value>, field: &FieldId, splice: &ListSplice) -> StoreResult<()> {
    let Some(end) = splice
        .index
        .checked_add(splice.removed.len())
        .filter(|&end| end <= items.len())
    else {
        return Err(StoreError::SpliceOutOfRange {
            field: field.clone(),
            index: splice.index,
            len: items.len(),
        });
    };
    if items[splice.index..end] != splice.removed[..] {
        return Err(StoreError::SpliceMismatch {
            field: field.clone(),
            index: splice.index,
        });
    }
    items.splice(splice.index..end, splice.inserted.iter().cloned());
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Converts a snapshot object into a map, rejecting other JSON types.
pub(crate) fn expect_object(value: Value, what: &str) -> StoreResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidCheckpoint(format!(
            "{what} must be an object, got {}",
            json_type_name(&other)
        ))),
    }
}
