/// Role string written to the session marker for cross-tenant administrative work.
///
/// Not representable as a [`crate::Role`]: only [`crate::SuperAdminContext`] produces it.
pub const SUPER_ADMIN_ROLE: &str = "SUPER_ADMIN";

/// Upper bound for tenant and user identifiers.
pub const MAX_IDENTIFIER_LEN: usize = 128;
