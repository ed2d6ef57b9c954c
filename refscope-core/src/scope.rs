//! Tenant scope tiers and the scope values of the current session.

use serde::{Deserialize, Serialize};

/// One level of the multi-tenant hierarchy, ordered broad to narrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeTier {
    Domain,
    Workspace,
    Project,
    User,
}

impl ScopeTier {
    /// All tiers in broad-to-narrow order.
    pub const ALL: [ScopeTier; 4] = [
        ScopeTier::Domain,
        ScopeTier::Workspace,
        ScopeTier::Project,
        ScopeTier::User,
    ];
}

/// Concrete scope values for the current session.
///
/// Which tiers are present depends on the application mode: an admin
/// session typically carries only a domain, a workspace session carries
/// domain and workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeContext {
    pub domain_id: Option<String>,
    pub workspace_id: Option<String>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
}

impl ScopeContext {
    /// Create an empty scope context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the domain id.
    pub fn with_domain(mut self, id: impl Into<String>) -> Self {
        self.domain_id = Some(id.into());
        self
    }

    /// Set the workspace id.
    pub fn with_workspace(mut self, id: impl Into<String>) -> Self {
        self.workspace_id = Some(id.into());
        self
    }

    /// Set the project id.
    pub fn with_project(mut self, id: impl Into<String>) -> Self {
        self.project_id = Some(id.into());
        self
    }

    /// Set the user id.
    pub fn with_user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Value for a tier. Empty strings count as absent.
    pub fn value(&self, tier: ScopeTier) -> Option<&str> {
        let value = match tier {
            ScopeTier::Domain => self.domain_id.as_deref(),
            ScopeTier::Workspace => self.workspace_id.as_deref(),
            ScopeTier::Project => self.project_id.as_deref(),
            ScopeTier::User => self.user_id.as_deref(),
        };
        value.filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_are_ordered_broad_to_narrow() {
        assert!(ScopeTier::Domain < ScopeTier::Workspace);
        assert!(ScopeTier::Workspace < ScopeTier::Project);
        assert!(ScopeTier::Project < ScopeTier::User);
        let mut shuffled = vec![ScopeTier::User, ScopeTier::Domain, ScopeTier::Project];
        shuffled.sort();
        assert_eq!(shuffled, vec![ScopeTier::Domain, ScopeTier::Project, ScopeTier::User]);
    }

    #[test]
    fn test_value_lookup() {
        let ctx = ScopeContext::new().with_domain("d-1").with_workspace("w-1");
        assert_eq!(ctx.value(ScopeTier::Domain), Some("d-1"));
        assert_eq!(ctx.value(ScopeTier::Workspace), Some("w-1"));
        assert_eq!(ctx.value(ScopeTier::Project), None);
    }

    #[test]
    fn test_empty_value_is_absent() {
        let ctx = ScopeContext::new().with_workspace("");
        assert_eq!(ctx.value(ScopeTier::Workspace), None);
    }

    #[test]
    fn test_tier_serializes_screaming_case() {
        let json = serde_json::to_string(&ScopeTier::Workspace).unwrap();
        assert_eq!(json, "\"WORKSPACE\"");
    }
}
