//! Stash: a named, versioned value cell with type-specific operations.
//!
//! Every mutating method bumps `version` by exactly one when it succeeds and
//! leaves the stash untouched when it fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{format_timestamp, str_enum};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StashType {
    #[default]
    Resource,
    Artifact,
    Context,
    Counter,
    Lock,
}

str_enum!(StashType, "stash type" {
    Resource => "resource",
    Artifact => "artifact",
    Context => "context",
    Counter => "counter",
    Lock => "lock",
});

impl StashType {
    /// Whether `set_value` may replace the whole value.
    pub fn is_free_form(&self) -> bool {
        matches!(
            self,
            StashType::Resource | StashType::Artifact | StashType::Context
        )
    }

    pub fn initial_value(&self) -> Value {
        match self {
            StashType::Counter => json!({ "value": 0 }),
            _ => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Stash {
    pub id: String,
    pub name: String,
    pub stash_type: StashType,
    /// Free-form for resource/artifact/context, `{"value": n}` for counters,
    /// `null` or `{"holder", "acquired_at"}` for locks.
    pub value: Value,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stash {
    pub fn new(name: impl Into<String>, stash_type: StashType) -> Self {
        Self {
            name: name.into(),
            stash_type,
            value: stash_type.initial_value(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("stash name is required".to_string()));
        }
        match self.stash_type {
            StashType::Counter => {
                if !self.value.get("value").is_some_and(Value::is_i64) {
                    return Err(Error::Validation(format!(
                        "counter stash {} needs an integer \"value\" entry",
                        self.name
                    )));
                }
            }
            StashType::Lock => {
                if !self.value.is_null() && self.holder().is_none() {
                    return Err(Error::Validation(format!(
                        "lock stash {} value must be null or carry a holder",
                        self.name
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Fills the type's initial value when a new stash arrives without one.
    pub fn normalize(&mut self) {
        if self.value.is_null() {
            self.value = self.stash_type.initial_value();
        }
    }

    pub fn get_value(&self) -> &Value {
        &self.value
    }

    pub fn set_value(&mut self, value: Value) -> Result<()> {
        self.require(|t| t.is_free_form(), "set_value")?;
        self.value = value;
        self.bump();
        Ok(())
    }

    /// Adds `delta` to a counter and returns the new count.
    pub fn increment(&mut self, delta: i64) -> Result<i64> {
        self.require(|t| *t == StashType::Counter, "increment")?;
        let current = self.value.get("value").and_then(Value::as_i64).unwrap_or(0);
        let next = current.checked_add(delta).ok_or_else(|| {
            Error::Validation(format!("counter {} overflows adding {delta}", self.name))
        })?;
        self.value = json!({ "value": next });
        self.bump();
        Ok(next)
    }

    /// Current lock holder, if any.
    pub fn holder(&self) -> Option<&str> {
        self.value
            .get("holder")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
    }

    /// Takes the lock. Re-acquiring by the current holder succeeds.
    pub fn acquire(&mut self, holder: &str) -> Result<()> {
        self.require(|t| *t == StashType::Lock, "acquire")?;
        if holder.is_empty() {
            return Err(Error::InvalidHolder);
        }
        match self.holder() {
            Some(current) if current == holder => {}
            Some(current) => {
                return Err(Error::LockHeld {
                    holder: current.to_string(),
                })
            }
            None => {
                self.value = json!({
                    "holder": holder,
                    "acquired_at": format_timestamp(&Utc::now()),
                });
            }
        }
        self.bump();
        Ok(())
    }

    pub fn release(&mut self, holder: &str) -> Result<()> {
        self.require(|t| *t == StashType::Lock, "release")?;
        if holder.is_empty() || self.holder() != Some(holder) {
            return Err(Error::NotLockHolder {
                holder: holder.to_string(),
            });
        }
        self.value = Value::Null;
        self.bump();
        Ok(())
    }

    fn require(&self, allowed: impl Fn(&StashType) -> bool, operation: &'static str) -> Result<()> {
        if allowed(&self.stash_type) {
            Ok(())
        } else {
            Err(Error::InvalidStashType {
                operation,
                stash_type: self.stash_type.to_string(),
            })
        }
    }

    fn bump(&mut self) {
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_scenario() {
        let mut lock = Stash::new("deploy", StashType::Lock);
        lock.acquire("w1").unwrap();
        assert_eq!(lock.version, 1);
        assert_eq!(lock.holder(), Some("w1"));

        let err = lock.acquire("w2").unwrap_err();
        assert!(matches!(err, Error::LockHeld { ref holder } if holder == "w1"));
        assert_eq!(lock.version, 1);

        lock.release("w1").unwrap();
        assert!(lock.get_value().is_null());
        assert_eq!(lock.version, 2);

        lock.acquire("w2").unwrap();
        assert_eq!(lock.holder(), Some("w2"));
        assert_eq!(lock.version, 3);
    }

    #[test]
    fn test_lock_reentrant_and_release_rules() {
        let mut lock = Stash::new("l", StashType::Lock);
        assert!(matches!(lock.acquire(""), Err(Error::InvalidHolder)));
        assert!(matches!(lock.release("w1"), Err(Error::NotLockHolder { .. })));

        lock.acquire("w1").unwrap();
        let acquired_at = lock.value["acquired_at"].clone();
        lock.acquire("w1").unwrap();
        assert_eq!(lock.value["acquired_at"], acquired_at);
        assert_eq!(lock.version, 2);

        assert!(matches!(lock.release("w2"), Err(Error::NotLockHolder { .. })));
        assert_eq!(lock.version, 2);
    }

    #[test]
    fn test_counter_increment() {
        let mut counter = Stash::new("hits", StashType::Counter);
        assert_eq!(counter.increment(5).unwrap(), 5);
        assert_eq!(counter.increment(-2).unwrap(), 3);
        assert_eq!(counter.value, json!({ "value": 3 }));
        assert_eq!(counter.version, 2);

        counter.value = json!({ "value": i64::MAX });
        assert!(counter.increment(1).is_err());
        assert_eq!(counter.version, 2);
    }

    #[test]
    fn test_wrong_type_leaves_version() {
        let mut counter = Stash::new("hits", StashType::Counter);
        let mut lock = Stash::new("l", StashType::Lock);
        let mut ctx = Stash::new("ctx", StashType::Context);

        assert!(matches!(
            counter.set_value(json!({})),
            Err(Error::InvalidStashType { operation: "set_value", .. })
        ));
        assert!(matches!(lock.set_value(json!(1)), Err(Error::InvalidStashType { .. })));
        assert!(matches!(ctx.increment(1), Err(Error::InvalidStashType { .. })));
        assert!(matches!(ctx.acquire("w1"), Err(Error::InvalidStashType { .. })));
        assert!(matches!(counter.release("w1"), Err(Error::InvalidStashType { .. })));
        assert_eq!((counter.version, lock.version, ctx.version), (0, 0, 0));

        ctx.set_value(json!({ "branch": "main" })).unwrap();
        assert_eq!(ctx.get_value()["branch"], "main");
        assert_eq!(ctx.version, 1);
    }

    #[test]
    fn test_validate_shapes() {
        let mut counter = Stash::new("c", StashType::Counter);
        counter.validate().unwrap();
        counter.value = json!("three");
        assert!(counter.validate().is_err());

        let mut lock = Stash::new("l", StashType::Lock);
        lock.validate().unwrap();
        lock.value = json!({ "owner": "w1" });
        assert!(lock.validate().is_err());

        let mut raw = Stash {
            name: "c2".to_string(),
            stash_type: StashType::Counter,
            ..Default::default()
        };
        raw.normalize();
        assert_eq!(raw.value, json!({ "value": 0 }));
    }
}
