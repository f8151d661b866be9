// Permit id allocation.
//
// Ids only need to be unique within a resource ledger for the lifetime of a
// permit. The default generator is random (UUID v4), so it is immune to the
// clock regressions that bite time-ordered schemes; callers with their own id
// discipline can inject an `IdGenerator` through the factory.

use std::fmt;

use uuid::Uuid;

/// Error type produced by id generators.
pub type IdError = Box<dyn std::error::Error + Send + Sync>;

/// Pluggable permit id source.
///
/// Implementations must return a unique, non-empty string per call. Failures
/// surface from acquire as [`Error::IdGenerationFailed`] and never trigger
/// fallback.
///
/// [`Error::IdGenerationFailed`]: crate::Error::IdGenerationFailed
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<String, IdError>;
}

/// Default generator: 32 hex chars of UUID v4.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> Result<String, IdError> {
        Ok(Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Debug for dyn IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdGenerator")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{IdGenerator, UuidGenerator};

    #[test]
    fn generated_ids_are_unique_and_plain() {
        let generator = UuidGenerator;
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = generator.generate().expect("uuid generation should not fail");
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(id), "ids should not repeat");
        }
    }
}
