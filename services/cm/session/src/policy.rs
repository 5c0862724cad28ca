//! Client-facing policy pushed by the backend.
//!
//! The backend announces, per configuration push, whether clients may or must
//! use TLS, whether compression is offered, which SASL mechanisms exist and
//! whether non-SASL auth and in-band registration are available. Every client
//! state machine reads the current snapshot; pushes replace it atomically.

use arc_swap::ArcSwap;
use cm_wire::Element;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::SessionError;

/// TLS policy for client streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// STARTTLS is not offered
    #[default]
    Disabled,
    /// STARTTLS is offered
    Optional,
    /// STARTTLS must complete before any stanza is routed
    Required,
}

/// Stream compression policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionPolicy {
    /// Compression is not offered
    #[default]
    Disabled,
    /// Compression is offered
    Optional,
}

impl FromStr for CompressionPolicy {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" => Ok(CompressionPolicy::Disabled),
            "optional" => Ok(CompressionPolicy::Optional),
            other => Err(SessionError::InvalidPolicy(other.to_string())),
        }
    }
}

/// Snapshot of the backend-advertised client policy
#[derive(Debug, Clone, Default)]
pub struct ClientPolicy {
    /// TLS policy
    pub tls: TlsPolicy,
    /// Compression policy
    pub compression: CompressionPolicy,
    /// Cached `<mechanisms>` element, if the backend sent one
    pub mechanisms: Option<Element>,
    /// Non-SASL authentication available
    pub non_sasl_auth: bool,
    /// In-band registration available
    pub registration: bool,
}

impl ClientPolicy {
    /// Derive a new snapshot from a `<configuration>` push.
    ///
    /// Mechanisms are only replaced when the push carries a `<mechanisms>` element.
    pub fn apply_configuration(&self, configuration: &Element) -> ClientPolicy {
        let tls = match configuration.find("starttls") {
            Some(starttls) if starttls.has_child("required") => TlsPolicy::Required,
            Some(_) => TlsPolicy::Optional,
            None => TlsPolicy::Disabled,
        };
        let compression = if configuration.has_child("compression") {
            CompressionPolicy::Optional
        } else {
            CompressionPolicy::Disabled
        };
        let mechanisms = configuration
            .find("mechanisms")
            .cloned()
            .or_else(|| self.mechanisms.clone());

        ClientPolicy {
            tls,
            compression,
            mechanisms,
            non_sasl_auth: configuration.has_child("auth"),
            registration: configuration.has_child("register"),
        }
    }
}

/// Shared, atomically swapped [`ClientPolicy`]
#[derive(Debug, Default)]
pub struct PolicyCache {
    current: ArcSwap<ClientPolicy>,
    write_lock: Mutex<()>,
}

impl PolicyCache {
    /// Create a cache holding `initial`
    pub fn new(initial: ClientPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            write_lock: Mutex::new(()),
        }
    }

    /// Current snapshot; never blocks
    pub fn load(&self) -> Arc<ClientPolicy> {
        self.current.load_full()
    }

    /// Replace the snapshot with one derived from the current value
    pub fn update<F>(&self, derive: F) -> Arc<ClientPolicy>
    where
        F: FnOnce(&ClientPolicy) -> ClientPolicy,
    {
        // Serializes writers; readers go through the ArcSwap untouched.
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = Arc::new(derive(&self.current.load()));
        self.current.store(next.clone());
        debug!(
            "Client policy updated: tls={:?} compression={:?} auth={} register={}",
            next.tls, next.compression, next.non_sasl_auth, next.registration
        );
        next
    }

    /// Apply a `<configuration>` push
    pub fn apply_configuration(&self, configuration: &Element) -> Arc<ClientPolicy> {
        self.update(|current| current.apply_configuration(configuration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_wire::parse_element;

    #[test]
    fn test_configuration_push() {
        let cache = PolicyCache::default();
        let push = parse_element(
            "<configuration xmlns='http://jabber.org/protocol/connectionmanager'>\
               <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
               <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
               <compression xmlns='http://jabber.org/features/compress'><method>zlib</method></compression>\
               <register xmlns='http://jabber.org/features/iq-register'/>\
             </configuration>",
        )
        .unwrap();

        let policy = cache.apply_configuration(&push);
        assert_eq!(policy.tls, TlsPolicy::Required);
        assert_eq!(policy.compression, CompressionPolicy::Optional);
        assert!(policy.registration);
        assert!(!policy.non_sasl_auth);
        assert!(policy.mechanisms.is_some());
        assert_eq!(cache.load().tls, TlsPolicy::Required);
    }

    #[test]
    fn test_mechanisms_survive_push_without_them() {
        let cache = PolicyCache::default();
        cache.apply_configuration(
            &parse_element("<configuration><mechanisms><mechanism>PLAIN</mechanism></mechanisms></configuration>")
                .unwrap(),
        );
        let policy = cache.apply_configuration(
            &parse_element("<configuration><starttls/><auth/></configuration>").unwrap(),
        );

        assert_eq!(policy.tls, TlsPolicy::Optional);
        assert_eq!(policy.compression, CompressionPolicy::Disabled);
        assert!(policy.non_sasl_auth);
        assert!(policy.mechanisms.is_some());
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let cache = PolicyCache::default();
        let before = cache.load();
        cache.update(|p| ClientPolicy {
            tls: TlsPolicy::Optional,
            ..p.clone()
        });
        assert_eq!(before.tls, TlsPolicy::Disabled);
        assert_eq!(cache.load().tls, TlsPolicy::Optional);
    }

    #[test]
    fn test_compression_policy_from_str() {
        assert_eq!(
            "Optional".parse::<CompressionPolicy>().unwrap(),
            CompressionPolicy::Optional
        );
        assert!("sometimes".parse::<CompressionPolicy>().is_err());
    }
}
