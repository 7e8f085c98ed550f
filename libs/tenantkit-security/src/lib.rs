#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Request-scoped identity for the tenantkit isolation core.
//!
//! The authentication layer turns verified claims into a [`RequestScope`];
//! data-access code asks it for a [`TenantContext`] and fails fast when none
//! is bound.
//!
//! ```rust
//! use tenantkit_security::{RequestScope, ScopeError, VerifiedClaims};
//!
//! let claims = VerifiedClaims {
//!     tenant: Some("acme".to_owned()),
//!     subject: Some("alice".to_owned()),
//!     role: Some("STAFF".to_owned()),
//! };
//! let scope = RequestScope::from_claims(&claims).unwrap();
//! assert_eq!(scope.require_tenant_id().unwrap().as_str(), "acme");
//!
//! let anonymous = RequestScope::anonymous();
//! assert_eq!(anonymous.require_tenant_id(), Err(ScopeError::UnauthenticatedScope));
//! ```
pub mod constants;
pub mod context;
pub mod ids;
pub mod role;
pub mod scope;

pub use constants::{MAX_IDENTIFIER_LEN, SUPER_ADMIN_ROLE};
pub use context::{SuperAdminContext, TenantContext};
pub use ids::{IdentifierError, TenantId, UserId};
pub use role::{Role, UnknownRole};
pub use scope::{Principal, RequestScope, ScopeError, VerifiedClaims};
