//! Authorization boundary.
//!
//! Every engine operation asks an [`Authorizer`] whether a [`Principal`] may perform an [`Action`]
//! on a [`Resource`] before touching any state. [`AllowAll`] is the default. [`RuleAuthorizer`]
//! evaluates an ordered list of allow/deny [`Rule`]s whose resource patterns use the same wildcard
//! syntax as topic exchanges; the first matching rule decides and no match means deny.

use std::borrow::Cow;
use std::fmt;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::topic::Pattern;
use crate::types::Principal;
use crate::Result;

/// Placeholder replaced by the principal name when a rule is evaluated
pub const PLACEHOLDER_PRINCIPAL: &str = "${principal}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Publish,
    Consume,
    Create,
    Delete,
    Bind,
    Unbind,
    Acknowledge,
}

impl TryFrom<&str> for Action {
    type Error = anyhow::Error;
    #[inline]
    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "publish" => Ok(Action::Publish),
            "consume" => Ok(Action::Consume),
            "create" => Ok(Action::Create),
            "delete" => Ok(Action::Delete),
            "bind" => Ok(Action::Bind),
            "unbind" => Ok(Action::Unbind),
            "acknowledge" => Ok(Action::Acknowledge),
            _ => Err(anyhow!("Unknown Action")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Exchange,
    Queue,
    RoutingKey,
}

impl TryFrom<&str> for ResourceKind {
    type Error = anyhow::Error;
    #[inline]
    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "exchange" => Ok(ResourceKind::Exchange),
            "queue" => Ok(ResourceKind::Queue),
            "routingkey" | "routing_key" => Ok(ResourceKind::RoutingKey),
            _ => Err(anyhow!("Unknown Resource")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource<'a> {
    Exchange(&'a str),
    Queue(&'a str),
    RoutingKey(&'a str),
}

impl Resource<'_> {
    #[inline]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Exchange(_) => ResourceKind::Exchange,
            Resource::Queue(_) => ResourceKind::Queue,
            Resource::RoutingKey(_) => ResourceKind::RoutingKey,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        match self {
            Resource::Exchange(n) | Resource::Queue(n) | Resource::RoutingKey(n) => n,
        }
    }
}

impl fmt::Display for Resource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:?})", self.kind(), self.name())
    }
}

#[async_trait]
pub trait Authorizer: Sync + Send {
    async fn authorize(&self, principal: &Principal, action: Action, resource: Resource<'_>) -> Result<bool>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    #[inline]
    async fn authorize(&self, _principal: &Principal, _action: Action, _resource: Resource<'_>) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Permission {
    Allow,
    Deny,
}

impl TryFrom<&str> for Permission {
    type Error = anyhow::Error;
    #[inline]
    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "allow" => Ok(Permission::Allow),
            "deny" => Ok(Permission::Deny),
            _ => Err(anyhow!("Unknown Permission")),
        }
    }
}

/// Resource name matcher. `eq ` prefixed patterns compare literally, others use wildcard matching.
#[derive(Debug, Clone)]
pub enum ResourcePattern {
    Eq(String),
    Wildcard(String),
}

impl ResourcePattern {
    #[inline]
    pub fn is_match(&self, principal: &Principal, name: &str) -> bool {
        match self {
            ResourcePattern::Eq(p) => replaces(p, principal) == name,
            ResourcePattern::Wildcard(p) => Pattern::parse(&replaces(p, principal)).matches(name),
        }
    }
}

impl TryFrom<&str> for ResourcePattern {
    type Error = anyhow::Error;
    #[inline]
    fn try_from(cfg: &str) -> std::result::Result<Self, Self::Error> {
        if let Some(stripped) = cfg.strip_prefix("eq ") {
            Ok(ResourcePattern::Eq(stripped.to_owned()))
        } else if !cfg.is_empty() {
            Ok(ResourcePattern::Wildcard(cfg.to_owned()))
        } else {
            Err(anyhow!(format!("ACL Rule config error, resource config is {:?}", cfg)))
        }
    }
}

#[inline]
fn replaces<'a>(pattern: &'a str, principal: &Principal) -> Cow<'a, str> {
    if pattern.contains(PLACEHOLDER_PRINCIPAL) {
        Cow::Owned(pattern.replace(PLACEHOLDER_PRINCIPAL, &*principal.name))
    } else {
        Cow::Borrowed(pattern)
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub permission: Permission,
    /// `None` applies to every action
    pub action: Option<Action>,
    pub resource: ResourceKind,
    pub pattern: ResourcePattern,
    /// `None` applies to every principal
    pub principal: Option<String>,
}

impl Rule {
    #[inline]
    pub fn hit(&self, principal: &Principal, action: Action, resource: &Resource<'_>) -> bool {
        if !self.action.map(|a| a == action).unwrap_or(true) {
            return false;
        }
        if self.resource != resource.kind() {
            return false;
        }
        if !self.principal.as_ref().map(|p| p.as_str() == &*principal.name).unwrap_or(true) {
            return false;
        }
        self.pattern.is_match(principal, resource.name())
    }
}

impl TryFrom<&serde_json::Value> for Rule {
    type Error = anyhow::Error;
    #[inline]
    fn try_from(cfg: &serde_json::Value) -> std::result::Result<Self, Self::Error> {
        let err_msg = || anyhow!(format!("ACL Rule config error, rule config is {:?}", cfg));

        let obj = cfg.as_object().ok_or_else(err_msg)?;
        let permission =
            obj.get("permission").and_then(|p| p.as_str().map(Permission::try_from)).ok_or_else(err_msg)??;
        let action = match obj.get("action").and_then(|a| a.as_str()) {
            None | Some("all") => None,
            Some(a) => Some(Action::try_from(a)?),
        };
        let resource =
            obj.get("resource").and_then(|r| r.as_str().map(ResourceKind::try_from)).ok_or_else(err_msg)??;
        let pattern =
            obj.get("pattern").and_then(|p| p.as_str().map(ResourcePattern::try_from)).ok_or_else(err_msg)??;
        let principal = obj.get("principal").and_then(|p| p.as_str()).map(String::from);

        Ok(Rule { permission, action, resource, pattern, principal })
    }
}

#[derive(Debug, Default, Clone)]
pub struct RuleAuthorizer {
    rules: Vec<Rule>,
}

impl RuleAuthorizer {
    #[inline]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Parses a JSON array of rule objects.
    pub fn from_json(cfg: &serde_json::Value) -> anyhow::Result<Self> {
        let rules = cfg
            .as_array()
            .ok_or_else(|| anyhow!("ACL config error, rules must be an array"))?
            .iter()
            .map(Rule::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    #[inline]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

#[async_trait]
impl Authorizer for RuleAuthorizer {
    async fn authorize(&self, principal: &Principal, action: Action, resource: Resource<'_>) -> Result<bool> {
        if principal.superuser {
            return Ok(true);
        }
        let allowed = self
            .rules
            .iter()
            .find(|r| r.hit(principal, action, &resource))
            .map(|r| matches!(r.permission, Permission::Allow))
            .unwrap_or(false);
        if !allowed {
            log::debug!("{} {:?} {} denied", principal, action, resource);
        }
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn authorizer() -> RuleAuthorizer {
        RuleAuthorizer::from_json(&json!([
            {"permission": "deny", "action": "publish", "resource": "routingkey", "pattern": "secret.#"},
            {"permission": "allow", "action": "publish", "resource": "routingkey", "pattern": "#"},
            {"permission": "allow", "resource": "queue", "pattern": "${principal}.*"},
            {"permission": "allow", "action": "create", "resource": "exchange", "pattern": "eq amq.topic", "principal": "admin"},
        ]))
        .unwrap()
    }

    #[tokio::test]
    async fn first_matching_rule_decides() {
        let acl = authorizer();
        let alice = Principal::new("alice");
        assert!(acl.authorize(&alice, Action::Publish, Resource::RoutingKey("sports.cricket")).await.unwrap());
        assert!(!acl.authorize(&alice, Action::Publish, Resource::RoutingKey("secret.plans")).await.unwrap());
        assert!(!acl.authorize(&alice, Action::Publish, Resource::RoutingKey("secret")).await.unwrap());
    }

    #[tokio::test]
    async fn placeholders_and_principals() {
        let acl = authorizer();
        let alice = Principal::new("alice");
        assert!(acl.authorize(&alice, Action::Consume, Resource::Queue("alice.inbox")).await.unwrap());
        assert!(!acl.authorize(&alice, Action::Consume, Resource::Queue("bob.inbox")).await.unwrap());

        assert!(!acl.authorize(&alice, Action::Create, Resource::Exchange("amq.topic")).await.unwrap());
        let admin = Principal::new("admin");
        assert!(acl.authorize(&admin, Action::Create, Resource::Exchange("amq.topic")).await.unwrap());
        assert!(!acl.authorize(&admin, Action::Create, Resource::Exchange("amq.topic.x")).await.unwrap());
    }

    #[tokio::test]
    async fn superuser_and_default_deny() {
        let acl = authorizer();
        assert!(acl.authorize(&Principal::superuser("root"), Action::Delete, Resource::Exchange("x")).await.unwrap());
        assert!(!acl.authorize(&Principal::new("bob"), Action::Delete, Resource::Exchange("x")).await.unwrap());
        assert!(AllowAll.authorize(&Principal::new("bob"), Action::Delete, Resource::Exchange("x")).await.unwrap());
    }

    #[test]
    fn bad_rules() {
        assert!(RuleAuthorizer::from_json(&json!({})).is_err());
        assert!(Rule::try_from(&json!({"permission": "maybe", "resource": "queue", "pattern": "#"})).is_err());
        assert!(Rule::try_from(&json!({"permission": "allow", "resource": "queue", "pattern": ""})).is_err());
        assert!(Rule::try_from(&json!({"permission": "allow", "action": "fly", "resource": "queue", "pattern": "#"})).is_err());
    }
}
