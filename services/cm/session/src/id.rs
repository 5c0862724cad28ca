//! Stream id allocation.

use rand::Rng;

/// Allocates stream ids of the form `{manager_name}{random hex}`
#[derive(Debug, Clone)]
pub struct StreamIdFactory {
    prefix: String,
}

impl StreamIdFactory {
    /// Create a factory for a manager
    pub fn new(manager_name: impl Into<String>) -> Self {
        Self {
            prefix: manager_name.into(),
        }
    }

    /// A fresh candidate id. Uniqueness is enforced by the registry, not here.
    pub fn next_id(&self) -> String {
        let suffix: u64 = rand::thread_rng().gen();
        format!("{}{:x}", self.prefix, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_carry_manager_prefix() {
        let factory = StreamIdFactory::new("cm1");
        let a = factory.next_id();
        let b = factory.next_id();
        assert!(a.starts_with("cm1"));
        assert!(a[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
