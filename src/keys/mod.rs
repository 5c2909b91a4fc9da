//! Cache key resolution for platform credentials.
//!
//! Every credential is cached under two keys: the one native to the active
//! [`KeyStrategy`] and the one the other strategy would read. A deployment can
//! flip strategies without a cold cache on either side.
//!
//! ```text
//! kind             scoped                                   legacy
//! VerifyTicket     wechat:component_verify_ticket:{appid}   wechat:component:verify_ticket
//! ComponentToken   wechat:component_access_token:{appid}    wechat:component:access_token
//! PreAuthCode      wechat:component_preauth_code:{appid}    wechat:component:pre_auth_code
//! AuthorizerToken  wechat:authorizer_access_token:{appid}   wechat:authorizer:{appid}:access_token
//! ```

use serde::{Deserialize, Serialize};

/// Historical ticket key written by the first single-tenant deployment.
pub const LEGACY_TICKET_ALIAS: &str = "wechat:component:ticket";

/// Which key family a deployment reads and writes natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Keys embed the owning app id (multi-tenant isolation)
    #[default]
    Scoped,
    /// Fixed keys for component-scoped credentials
    Legacy,
}

impl KeyStrategy {
    /// The strategy whose keys are written for compatibility.
    pub fn other(self) -> Self {
        match self {
            KeyStrategy::Scoped => KeyStrategy::Legacy,
            KeyStrategy::Legacy => KeyStrategy::Scoped,
        }
    }
}

/// The credential kinds the token chain caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    VerifyTicket,
    ComponentToken,
    PreAuthCode,
    AuthorizerToken,
}

/// Primary key plus the keys written and read for compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeySet {
    pub primary: String,
    pub compat: String,
    /// Extra historical keys, read after `compat` and always written
    pub aliases: Vec<String>,
}

impl CacheKeySet {
    /// Keys in read order: primary first, then compat, then aliases.
    pub fn read_order(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str())
            .chain(std::iter::once(self.compat.as_str()))
            .chain(self.aliases.iter().map(String::as_str))
    }

    /// Every key a write must populate.
    pub fn write_keys(&self) -> impl Iterator<Item = &str> {
        self.read_order()
    }
}

/// Key native to `strategy` for `kind` owned by `owner_id`.
///
/// `owner_id` is the component app id for component-scoped kinds and the
/// authorizer app id for [`ResourceKind::AuthorizerToken`]. Legacy keys drop
/// the owner only for component-scoped kinds.
pub fn resolve_key(strategy: KeyStrategy, owner_id: &str, kind: ResourceKind) -> String {
    match (strategy, kind) {
        (KeyStrategy::Scoped, ResourceKind::VerifyTicket) => {
            format!("wechat:component_verify_ticket:{}", owner_id)
        }
        (KeyStrategy::Scoped, ResourceKind::ComponentToken) => {
            format!("wechat:component_access_token:{}", owner_id)
        }
        (KeyStrategy::Scoped, ResourceKind::PreAuthCode) => {
            format!("wechat:component_preauth_code:{}", owner_id)
        }
        (KeyStrategy::Scoped, ResourceKind::AuthorizerToken) => {
            format!("wechat:authorizer_access_token:{}", owner_id)
        }
        (KeyStrategy::Legacy, ResourceKind::VerifyTicket) => {
            "wechat:component:verify_ticket".to_string()
        }
        (KeyStrategy::Legacy, ResourceKind::ComponentToken) => {
            "wechat:component:access_token".to_string()
        }
        (KeyStrategy::Legacy, ResourceKind::PreAuthCode) => {
            "wechat:component:pre_auth_code".to_string()
        }
        (KeyStrategy::Legacy, ResourceKind::AuthorizerToken) => {
            format!("wechat:authorizer:{}:access_token", owner_id)
        }
    }
}

/// Key the other strategy would use for the same credential.
pub fn compat_key(strategy: KeyStrategy, owner_id: &str, kind: ResourceKind) -> String {
    resolve_key(strategy.other(), owner_id, kind)
}

/// Full key set for a credential.
pub fn key_set(strategy: KeyStrategy, owner_id: &str, kind: ResourceKind) -> CacheKeySet {
    let aliases = match kind {
        ResourceKind::VerifyTicket => vec![LEGACY_TICKET_ALIAS.to_string()],
        _ => Vec::new(),
    };

    CacheKeySet {
        primary: resolve_key(strategy, owner_id, kind),
        compat: compat_key(strategy, owner_id, kind),
        aliases,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [ResourceKind; 4] = [
        ResourceKind::VerifyTicket,
        ResourceKind::ComponentToken,
        ResourceKind::PreAuthCode,
        ResourceKind::AuthorizerToken,
    ];

    #[test]
    fn test_scoped_keys_embed_owner() {
        for kind in KINDS {
            let key = resolve_key(KeyStrategy::Scoped, "wx_owner", kind);
            assert!(key.contains("wx_owner"), "{:?} -> {}", kind, key);
        }
    }

    #[test]
    fn test_legacy_keys_drop_owner_for_component_kinds() {
        assert_eq!(
            resolve_key(KeyStrategy::Legacy, "wx_a", ResourceKind::ComponentToken),
            resolve_key(KeyStrategy::Legacy, "wx_b", ResourceKind::ComponentToken)
        );
        assert_eq!(
            resolve_key(KeyStrategy::Legacy, "wx_a", ResourceKind::VerifyTicket),
            "wechat:component:verify_ticket"
        );
        assert_eq!(
            resolve_key(KeyStrategy::Legacy, "wx_a", ResourceKind::PreAuthCode),
            "wechat:component:pre_auth_code"
        );
    }

    #[test]
    fn test_legacy_authorizer_keys_stay_per_authorizer() {
        assert_eq!(
            resolve_key(KeyStrategy::Legacy, "wxabc", ResourceKind::AuthorizerToken),
            "wechat:authorizer:wxabc:access_token"
        );
        assert_ne!(
            resolve_key(KeyStrategy::Legacy, "wx_a", ResourceKind::AuthorizerToken),
            resolve_key(KeyStrategy::Legacy, "wx_b", ResourceKind::AuthorizerToken)
        );
    }

    #[test]
    fn test_compat_is_other_strategy_primary() {
        for strategy in [KeyStrategy::Scoped, KeyStrategy::Legacy] {
            for kind in KINDS {
                let set = key_set(strategy, "wx1", kind);
                let other = key_set(strategy.other(), "wx1", kind);
                assert_eq!(set.compat, other.primary);
                assert_eq!(set.primary, other.compat);
            }
        }
    }

    #[test]
    fn test_distinct_templates_per_kind() {
        for strategy in [KeyStrategy::Scoped, KeyStrategy::Legacy] {
            let keys: std::collections::HashSet<String> = KINDS
                .iter()
                .map(|k| resolve_key(strategy, "wx1", *k))
                .collect();
            assert_eq!(keys.len(), KINDS.len());
        }
    }

    #[test]
    fn test_ticket_read_order_ends_with_alias() {
        let set = key_set(KeyStrategy::Scoped, "wx1", ResourceKind::VerifyTicket);
        let order: Vec<&str> = set.read_order().collect();
        assert_eq!(
            order,
            vec![
                "wechat:component_verify_ticket:wx1",
                "wechat:component:verify_ticket",
                LEGACY_TICKET_ALIAS,
            ]
        );

        let token = key_set(KeyStrategy::Scoped, "wx1", ResourceKind::ComponentToken);
        assert_eq!(token.read_order().count(), 2);
    }

    #[test]
    fn test_strategy_deserialization() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: KeyStrategy,
        }
        let w: Wrapper = toml::from_str(r#"strategy = "legacy""#).unwrap();
        assert_eq!(w.strategy, KeyStrategy::Legacy);
        assert_eq!(KeyStrategy::default(), KeyStrategy::Scoped);
    }
}
