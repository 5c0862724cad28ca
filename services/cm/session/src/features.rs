//! `<stream:features>` advertisement.

use cm_wire::{ns, Element};

use crate::policy::{ClientPolicy, CompressionPolicy, TlsPolicy};

/// Supported stream compression method
pub const COMPRESSION_METHOD: &str = "zlib";

/// Build the features element a client should see in its current state.
///
/// While TLS is required and the stream is not secured, only `starttls` and the
/// SASL mechanisms are offered. `compressible` is false once the stream is
/// compressed or when the transport has no codec.
pub fn stream_features(
    policy: &ClientPolicy,
    secured: bool,
    compressible: bool,
    authenticated: bool,
) -> Element {
    let mut features = Element::new("stream:features");

    if policy.tls != TlsPolicy::Disabled && !secured {
        let mut starttls = Element::with_ns("starttls", ns::TLS);
        if policy.tls == TlsPolicy::Required {
            starttls.push_child(Element::new("required"));
        }
        features.push_child(starttls);
    }

    if !authenticated {
        if let Some(mechanisms) = &policy.mechanisms {
            features.push_child(mechanisms.clone());
        }
    }

    if policy.tls == TlsPolicy::Required && !secured {
        return features;
    }

    if policy.compression == CompressionPolicy::Optional && compressible {
        features.push_child(
            Element::with_ns("compression", ns::COMPRESS_FEATURE)
                .child(Element::new("method").text_node(COMPRESSION_METHOD)),
        );
    }

    if authenticated {
        features.push_child(Element::with_ns("bind", ns::BIND));
        features.push_child(Element::with_ns("session", ns::SESSION));
    } else {
        if policy.non_sasl_auth {
            features.push_child(Element::with_ns("auth", ns::IQ_AUTH));
        }
        if policy.registration {
            features.push_child(Element::with_ns("register", ns::IQ_REGISTER));
        }
    }

    features
}
