//! Channel/domain registry collaborator.
//!
//! Validates channel names and gates which domains a client may subscribe
//! to. Rejections surface to the client as `error` messages with
//! `error_type: "invalid_channel"` or `"domain_denied"`.

use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::validate;

pub trait ChannelRegistry: Send + Sync {
    /// Check that `client_id` may join `channel`. Domain channels are gated
    /// by the per-domain ACL; task channels are open to any authenticated
    /// client.
    fn authorize(&self, client_id: &str, channel: &str) -> EngineResult<()>;
}

/// Registry configured from the `[domains]` table in config.toml.
///
/// A domain absent from the table is open; a present domain lists the client
/// ids allowed into its channels (empty list = locked).
#[derive(Debug, Default)]
pub struct StaticRegistry {
    domain_acl: HashMap<String, Vec<String>>,
}

impl StaticRegistry {
    pub fn new(domain_acl: HashMap<String, Vec<String>>) -> Self {
        Self { domain_acl }
    }

    /// An open registry: every well-formed channel is joinable.
    pub fn open() -> Self {
        Self::default()
    }
}

impl ChannelRegistry for StaticRegistry {
    fn authorize(&self, client_id: &str, channel: &str) -> EngineResult<()> {
        validate::validate_channel_name(channel)?;

        let Some(domain) = channel.strip_prefix("domain:") else {
            // Task-scoped channels carry no domain gate.
            return Ok(());
        };
        match self.domain_acl.get(domain) {
            None => Ok(()),
            Some(allowed) if allowed.iter().any(|c| c == client_id) => Ok(()),
            Some(_) => Err(EngineError::DomainDenied {
                domain: domain.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_channel_rejected() {
        let registry = StaticRegistry::open();
        let err = registry.authorize("c1", "no-scope").unwrap_err();
        assert!(matches!(err, EngineError::InvalidChannel { .. }));
        assert!(registry.authorize("c1", "domain:").is_err());
        assert!(registry.authorize("c1", "task:t1").is_ok());
    }

    #[test]
    fn test_domain_acl_denies_unlisted_clients() {
        let mut acl = HashMap::new();
        acl.insert("professional".to_string(), vec!["c1".to_string()]);
        let registry = StaticRegistry::new(acl);

        assert!(registry.authorize("c1", "domain:professional").is_ok());
        let err = registry.authorize("c2", "domain:professional").unwrap_err();
        assert!(matches!(err, EngineError::DomainDenied { .. }));
        // Unlisted domains stay open.
        assert!(registry.authorize("c2", "domain:personal").is_ok());
    }
}
