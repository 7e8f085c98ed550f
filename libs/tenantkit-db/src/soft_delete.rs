use crate::backend::IsolationBackend;
use crate::error::Result;
use crate::tables::{SoftDelete, TableError, is_identifier};

/// Retire one row of entity kind `E` by clearing its active flag.
///
/// Runs under the current marker: a row owned by another tenant is left
/// untouched and reported as `false`, same as a row that does not exist.
///
/// # Errors
/// Returns `IsolationError::Tables` when the entity's identifiers are invalid
/// and `IsolationError::Sqlx` when the update fails.
pub async fn soft_delete<E, DB>(conn: &mut DB::Connection, id: &str) -> Result<bool>
where
    E: SoftDelete,
    DB: IsolationBackend,
{
    E::TABLE.validate()?;
    if !is_identifier(E::ACTIVE_COLUMN) {
        return Err(TableError::InvalidIdentifier(E::ACTIVE_COLUMN.to_owned()).into());
    }
    let retired = DB::soft_delete(conn, &E::TABLE, E::ACTIVE_COLUMN, id).await?;
    tracing::debug!(table = E::TABLE.name, id, retired, "soft delete");
    Ok(retired)
}
