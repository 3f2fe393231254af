//! Typed service-level error kinds (§7), generalizing the teacher's ad hoc
//! `anyhow::bail!` call sites into a boundary the HTTP layer can map to
//! status codes. Internal call sites still use `anyhow::Result` + `?`;
//! this type is only constructed at service boundaries that need to
//! report a specific issue code.

use thiserror::Error;

/// One of the error **kinds** from §7, each carrying the short uppercase
/// issue code (GLOSSARY: "Issue code") a caller surfaces in `issues[]`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation: {code}: {message}")]
    Validation { code: &'static str, message: String },

    #[error("not found: {code}")]
    NotFound { code: &'static str },

    #[error("auth: missing or invalid bearer token")]
    Auth,

    #[error("dependency degraded: {issue}")]
    Dependency { issue: &'static str },

    #[error("translator/validator: {issue}")]
    Translator { issue: &'static str },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ServiceError {
    pub fn issue_code(&self) -> &'static str {
        match self {
            ServiceError::Validation { code, .. } => code,
            ServiceError::NotFound { code } => code,
            ServiceError::Auth => "UNAUTHORIZED",
            ServiceError::Dependency { issue } => issue,
            ServiceError::Translator { issue } => issue,
            ServiceError::Fatal(_) => "FATAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::Validation { .. } => 400,
            ServiceError::NotFound { .. } => 404,
            ServiceError::Auth => 401,
            ServiceError::Dependency { .. } => 200, // degradations are non-fatal, §7
            ServiceError::Translator { .. } => 200,
            ServiceError::Fatal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_degradation_is_not_an_error_status() {
        let e = ServiceError::Dependency { issue: "VECTOR_DOWN" };
        assert_eq!(e.http_status(), 200);
        assert_eq!(e.issue_code(), "VECTOR_DOWN");
    }

    #[test]
    fn fatal_maps_to_500() {
        let e = ServiceError::Fatal("migration failed".into());
        assert_eq!(e.http_status(), 500);
    }
}
