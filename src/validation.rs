use crate::error::AppError;

pub fn require_non_empty(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Collection, index and field names are spliced into SQL, so only
/// `[A-Za-z0-9_]` is accepted.
pub fn require_identifier(field: &str, value: &str) -> Result<(), AppError> {
    require_non_empty(field, value)?;
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::Validation(format!(
            "{field} must contain only letters, digits and underscores, got {value:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert!(require_identifier("collection", "__migrations").is_ok());
        assert!(require_identifier("field", "leaseUntil").is_ok());
        assert!(require_identifier("field", "").is_err());
        assert!(require_identifier("field", "a.b").is_err());
        assert!(require_identifier("collection", "x\"; DROP TABLE y").is_err());
    }

    #[test]
    fn test_non_empty() {
        assert!(require_non_empty("name", "init").is_ok());
        assert!(require_non_empty("name", "   ").is_err());
    }
}
