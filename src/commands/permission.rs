//! Permission levels and the authorization check.

use serde::{Deserialize, Serialize};

use crate::commands::request::AuthUser;
use crate::config::PermissionConfig;

/// Permission a command requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Read,
    Write,
    Grant,
    Full,
    Superuser,
}

impl Permission {
    /// Whether holding `self` is enough for an operation requiring `required`.
    pub fn covers(&self, required: Permission) -> bool {
        use Permission::*;

        match self {
            Superuser => true,
            Full => !matches!(required, Superuser),
            held => *held == required,
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Grant => "grant",
            Self::Full => "full",
            Self::Superuser => "superuser",
        };
        write!(f, "{s}")
    }
}

/// Decides whether a user may run something requiring a permission.
pub trait PermissionCheck: Send + Sync {
    fn is_authorized(&self, user: &AuthUser, required: Permission) -> bool;
}

/// Grants permissions by user name and group membership.
pub struct GroupPermissions {
    config: PermissionConfig,
}

impl GroupPermissions {
    pub fn new(config: PermissionConfig) -> Self {
        Self { config }
    }

    fn granted(&self, user: &AuthUser) -> Vec<Permission> {
        let mut granted = Vec::new();
        if self.config.superusers.contains(&user.username) {
            granted.push(Permission::Superuser);
        }
        let in_any = |groups: &[String]| user.groups.iter().any(|g| groups.contains(g));
        if in_any(&self.config.full_groups) {
            granted.push(Permission::Full);
        }
        if in_any(&self.config.read_groups) {
            granted.push(Permission::Read);
        }
        granted
    }
}

impl PermissionCheck for GroupPermissions {
    fn is_authorized(&self, user: &AuthUser, required: Permission) -> bool {
        self.granted(user).iter().any(|p| p.covers(required))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check() -> GroupPermissions {
        GroupPermissions::new(PermissionConfig {
            superusers: vec!["hacluster".to_string()],
            full_groups: vec!["haclient".to_string()],
            read_groups: vec!["viewers".to_string()],
        })
    }

    #[test]
    fn full_covers_everything_but_superuser() {
        assert!(Permission::Full.covers(Permission::Read));
        assert!(Permission::Full.covers(Permission::Grant));
        assert!(!Permission::Full.covers(Permission::Superuser));
        assert!(Permission::Superuser.covers(Permission::Superuser));
        assert!(!Permission::Read.covers(Permission::Write));
        assert!(Permission::Write.covers(Permission::Write));
    }

    #[test]
    fn superuser_by_name() {
        let user = AuthUser::new("hacluster", &[]);
        assert!(check().is_authorized(&user, Permission::Superuser));
    }

    #[test]
    fn group_membership_grants() {
        let admin = AuthUser::new("alice", &["wheel", "haclient"]);
        assert!(check().is_authorized(&admin, Permission::Write));
        assert!(!check().is_authorized(&admin, Permission::Superuser));

        let viewer = AuthUser::new("bob", &["viewers"]);
        assert!(check().is_authorized(&viewer, Permission::Read));
        assert!(!check().is_authorized(&viewer, Permission::Write));
    }

    #[test]
    fn strangers_get_nothing() {
        let user = AuthUser::new("mallory", &["users"]);
        assert!(!check().is_authorized(&user, Permission::Read));
    }
}
