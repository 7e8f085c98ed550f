use crate::constants::SUPER_ADMIN_ROLE;
use crate::ids::IdentifierError;
use crate::role::UnknownRole;
use crate::{Role, SuperAdminContext, TenantContext, TenantId, UserId};

/// Errors raised while binding or reading the per-request scope.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// No tenant is bound to the current request.
    #[error("no tenant is bound to the current request")]
    UnauthenticatedScope,

    /// A cross-tenant operation was requested without a super-admin principal.
    #[error("operation requires a super-admin principal")]
    NotSuperAdmin,

    /// Verified claims could not be turned into a principal.
    #[error("invalid claim '{claim}': {reason}")]
    InvalidClaim { claim: &'static str, reason: String },
}

impl ScopeError {
    fn invalid_id(claim: &'static str, err: &IdentifierError) -> Self {
        ScopeError::InvalidClaim {
            claim,
            reason: err.to_string(),
        }
    }
}

/// Claims handed over by the authentication collaborator after it has
/// verified the session or token. Never built from request parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct VerifiedClaims {
    pub tenant: Option<String>,
    pub subject: Option<String>,
    pub role: Option<String>,
}

/// Who a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Tenant(TenantContext),
    SuperAdmin(SuperAdminContext),
}

/// Per-request holder of the active principal.
///
/// The accessors fail fast: there is no fallback tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestScope {
    principal: Option<Principal>,
}

impl RequestScope {
    /// Scope for a request that carries no verified identity.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn tenant(ctx: TenantContext) -> Self {
        Self {
            principal: Some(Principal::Tenant(ctx)),
        }
    }

    #[must_use]
    pub fn super_admin(ctx: SuperAdminContext) -> Self {
        Self {
            principal: Some(Principal::SuperAdmin(ctx)),
        }
    }

    /// Build the scope from verified claims.
    ///
    /// - role `SUPER_ADMIN` with a subject -> super-admin principal (any tenant claim is ignored)
    /// - tenant claim -> tenant principal with optional user and role
    /// - no tenant claim -> anonymous scope; `require_*` accessors fail later
    ///
    /// # Errors
    /// Returns `ScopeError::InvalidClaim` for malformed identifiers, unknown roles,
    /// or a super-admin claim without a subject.
    pub fn from_claims(claims: &VerifiedClaims) -> Result<Self, ScopeError> {
        let subject = claims
            .subject
            .as_deref()
            .map(UserId::parse)
            .transpose()
            .map_err(|e| ScopeError::invalid_id("subject", &e))?;

        let role = claims.role.as_deref().map(str::trim);

        if role.is_some_and(|r| r.eq_ignore_ascii_case(SUPER_ADMIN_ROLE)) {
            let user = subject.ok_or_else(|| ScopeError::InvalidClaim {
                claim: "subject",
                reason: "super-admin claims must name a subject".to_owned(),
            })?;
            return Ok(Self::super_admin(SuperAdminContext::new(user)));
        }

        let Some(raw_tenant) = claims.tenant.as_deref() else {
            return Ok(Self::anonymous());
        };
        let tenant = TenantId::parse(raw_tenant).map_err(|e| ScopeError::invalid_id("tenant", &e))?;

        let mut ctx = TenantContext::new(tenant);
        if let Some(user) = subject {
            ctx = ctx.with_user(user);
        }
        if let Some(raw_role) = role {
            let role: Role = raw_role
                .parse()
                .map_err(|UnknownRole(r)| ScopeError::InvalidClaim {
                    claim: "role",
                    reason: format!("unknown role '{r}'"),
                })?;
            ctx = ctx.with_role(role);
        }
        Ok(Self::tenant(ctx))
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Tenant bound to this request.
    ///
    /// # Errors
    /// Returns `ScopeError::UnauthenticatedScope` when no tenant principal is bound,
    /// including super-admin scopes (which carry no tenant).
    pub fn require_tenant_id(&self) -> Result<&TenantId, ScopeError> {
        self.require_context().map(TenantContext::tenant_id)
    }

    /// Full tenant context bound to this request.
    ///
    /// # Errors
    /// Returns `ScopeError::UnauthenticatedScope` when no tenant principal is bound.
    pub fn require_context(&self) -> Result<&TenantContext, ScopeError> {
        match &self.principal {
            Some(Principal::Tenant(ctx)) => Ok(ctx),
            Some(Principal::SuperAdmin(_)) | None => Err(ScopeError::UnauthenticatedScope),
        }
    }

    /// Super-admin principal bound to this request.
    ///
    /// # Errors
    /// Returns `ScopeError::NotSuperAdmin` for tenant or anonymous scopes.
    pub fn require_super_admin(&self) -> Result<&SuperAdminContext, ScopeError> {
        match &self.principal {
            Some(Principal::SuperAdmin(ctx)) => Ok(ctx),
            Some(Principal::Tenant(_)) | None => Err(ScopeError::NotSuperAdmin),
        }
    }
}
