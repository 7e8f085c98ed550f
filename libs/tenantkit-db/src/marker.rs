//! Session marker: the connection-local record of who a connection acts as.

use serde::{Deserialize, Serialize};
use tenantkit_security::{SUPER_ADMIN_ROLE, SuperAdminContext, TenantContext, TenantId, UserId};

/// Values written by the context setter onto one physical connection.
///
/// A marker is built only from an authenticated principal; there is no way to
/// construct a marker for a tenant without going through [`TenantContext`],
/// [`TenantId`] or [`SuperAdminContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMarker {
    tenant: Option<TenantId>,
    user: Option<UserId>,
    role: Option<String>,
}

impl SessionMarker {
    #[must_use]
    pub fn for_context(ctx: &TenantContext) -> Self {
        Self {
            tenant: Some(ctx.tenant_id().clone()),
            user: ctx.user_id().cloned(),
            role: ctx.role().map(|r| r.as_str().to_owned()),
        }
    }

    #[must_use]
    pub fn for_tenant(tenant: &TenantId) -> Self {
        Self {
            tenant: Some(tenant.clone()),
            user: None,
            role: None,
        }
    }

    /// Marker for a cross-tenant administrative unit of work: no tenant, role `SUPER_ADMIN`.
    #[must_use]
    pub fn super_admin(ctx: &SuperAdminContext) -> Self {
        Self {
            tenant: None,
            user: Some(ctx.user_id().clone()),
            role: Some(SUPER_ADMIN_ROLE.to_owned()),
        }
    }

    /// Rebuild a marker from raw values read back from the database.
    ///
    /// Empty strings are the "unset" sentinel; a marker with every field unset is `None`.
    #[must_use]
    pub fn from_raw(
        tenant: Option<String>,
        user: Option<String>,
        role: Option<String>,
    ) -> Option<Self> {
        let tenant = tenant.as_deref().and_then(|t| TenantId::parse(t).ok());
        let user = user.as_deref().and_then(|u| UserId::parse(u).ok());
        let role = role.filter(|r| !r.trim().is_empty());
        if tenant.is_none() && user.is_none() && role.is_none() {
            return None;
        }
        Some(Self { tenant, user, role })
    }

    #[must_use]
    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    #[must_use]
    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    #[must_use]
    pub fn is_super_admin(&self) -> bool {
        self.role.as_deref() == Some(SUPER_ADMIN_ROLE)
    }

    /// Short label for log fields.
    #[must_use]
    pub fn label(&self) -> &str {
        match (&self.tenant, self.is_super_admin()) {
            (Some(t), _) => t.as_str(),
            (None, true) => SUPER_ADMIN_ROLE,
            (None, false) => "<unset>",
        }
    }
}

/// How long a marker written by the setter survives on its own.
///
/// Units of work clear the marker explicitly in both modes; `Transaction`
/// additionally lets the database drop the values at transaction end, so a
/// crash between set and clear cannot leave them on a pooled connection.
/// On `SQLite` the marker row is transactional either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerScope {
    #[default]
    Transaction,
    Session,
}

impl MarkerScope {
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, MarkerScope::Transaction)
    }
}
