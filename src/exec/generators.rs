//! Value generators for plan expressions.
//!
//! Plans may call named generators instead of carrying literals. The
//! built-in `now` generator is frozen once per plan evaluation so every
//! call site inside a single plan observes the same instant.

use std::collections::HashMap;
use std::sync::Arc;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PlanError, Result};
use crate::value::Value;

/// A user-registered generator invoked by name from plan expressions.
pub trait ValueGenerator: Send + Sync {
    /// Produces a value from the (already evaluated) call arguments.
    fn generate(&self, args: &[Value]) -> Result<Value>;
}

/// Registry of custom generators, shared across plan evaluations.
#[derive(Default, Clone)]
pub struct GeneratorRegistry {
    custom: HashMap<String, Arc<dyn ValueGenerator>>,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GeneratorRegistry {
    /// Registers a custom generator. Re-registering a name replaces the
    /// previous generator.
    pub fn register(&mut self, name: impl Into<String>, generator: Arc<dyn ValueGenerator>) {
        self.custom.insert(name.into(), generator);
    }

    /// Freezes the registry for one plan evaluation.
    pub fn snapshot(&self) -> GeneratorSnapshot {
        GeneratorSnapshot {
            now: OffsetDateTime::now_utc(),
            custom: self.custom.clone(),
        }
    }
}

/// A per-evaluation view of the registry with `now` pinned.
pub struct GeneratorSnapshot {
    now: OffsetDateTime,
    custom: HashMap<String, Arc<dyn ValueGenerator>>,
}

impl GeneratorSnapshot {
    /// Invokes a generator by name.
    ///
    /// `now` ignores its arguments and returns the pinned timestamp as an
    /// RFC 3339 string; `uuid` returns a fresh v4 UUID per call. Custom
    /// generators take precedence over neither built-in.
    pub fn generate(&self, name: &str, args: &[Value]) -> Result<Value> {
        match name {
            "now" => {
                let formatted = self
                    .now
                    .format(&Rfc3339)
                    .map_err(|e| PlanError::InvalidLiteral(format!("timestamp format: {e}")))?;
                Ok(Value::DateTime(formatted))
            }
            "uuid" => Ok(Value::Text(Uuid::new_v4().to_string())),
            other => match self.custom.get(other) {
                Some(generator) => generator.generate(args),
                None => Err(PlanError::UnknownGenerator {
                    name: other.to_string(),
                }
                .into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_stable_within_a_snapshot() {
        let snapshot = GeneratorRegistry::default().snapshot();
        let a = snapshot.generate("now", &[]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = snapshot.generate("now", &[]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn uuid_is_fresh_per_call() {
        let snapshot = GeneratorRegistry::default().snapshot();
        let a = snapshot.generate("uuid", &[]).unwrap();
        let b = snapshot.generate("uuid", &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_generator_is_an_error() {
        let snapshot = GeneratorRegistry::default().snapshot();
        let err = snapshot.generate("nope", &[]).unwrap_err();
        assert_eq!(err.code(), "MalformedQueryPlan");
    }

    struct Fixed;

    impl ValueGenerator for Fixed {
        fn generate(&self, args: &[Value]) -> Result<Value> {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        }
    }

    #[test]
    fn custom_generator_receives_args() {
        let mut registry = GeneratorRegistry::default();
        registry.register("fixed", Arc::new(Fixed));
        let snapshot = registry.snapshot();
        let out = snapshot.generate("fixed", &[Value::Int(42)]).unwrap();
        assert_eq!(out, Value::Int(42));
    }
}
