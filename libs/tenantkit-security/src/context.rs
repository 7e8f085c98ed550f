use crate::{Role, TenantId, UserId};

/// `TenantContext` describes who is asking, for the duration of one request.
///
/// A context always names exactly one tenant. It is built by the
/// authentication layer (see [`crate::RequestScope::from_claims`]) and is
/// immutable afterwards: the `with_*` methods consume and return the value.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TenantContext {
    tenant_id: TenantId,
    user_id: Option<UserId>,
    role: Option<Role>,
}

impl TenantContext {
    /// Create a context bound to `tenant_id` with no user and no role.
    #[must_use]
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            user_id: None,
            role: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    #[inline]
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    #[inline]
    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.role
    }
}

/// Principal allowed to run units of work across tenants (administrative tooling).
///
/// Kept as a distinct type so cross-tenant access can only be requested
/// through a dedicated entry point, never by attaching a role to a
/// [`TenantContext`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SuperAdminContext {
    user_id: UserId,
}

impl SuperAdminContext {
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    #[inline]
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}
