use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Locale used for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Es,
    En,
}

impl Locale {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "es" | "es-es" | "es-mx" => Some(Self::Es),
            "en" | "en-us" | "en-gb" => Some(Self::En),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Es => "es",
            Self::En => "en",
        }
    }
}

/// Machine-readable category of a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Permission,
    Conflict,
    Db,
    External,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Permission => "permission",
            Self::Conflict => "conflict",
            Self::Db => "db",
            Self::External => "external",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Database error during {operation}: {source}")]
    Store {
        operation: String,
        entity_id: Option<Uuid>,
        #[source]
        #[serde(skip)]
        source: DbErr,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cannot move {entity} from '{from}' to '{to}'; allowed: [{}]", .allowed.join(", "))]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
        allowed: Vec<String>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Wraps a store failure with the operation and entity it belongs to.
    pub fn store(operation: impl Into<String>, entity_id: Option<Uuid>, source: DbErr) -> Self {
        let operation = operation.into();
        tracing::error!(
            operation = %operation,
            entity_id = ?entity_id,
            error = %source,
            "store operation failed"
        );
        ServiceError::Store {
            operation,
            entity_id,
            source,
        }
    }

    /// Returns a closure suitable for `map_err` that wraps a `DbErr` with context.
    pub fn db_context(
        operation: &'static str,
        entity_id: impl Into<Option<Uuid>>,
    ) -> impl FnOnce(DbErr) -> ServiceError {
        let entity_id = entity_id.into();
        move |source| ServiceError::store(operation, entity_id, source)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::ValidationError(message.into())
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        ServiceError::NotFound(format!("{entity} {id} not found"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError(_) | Self::InvalidTransition { .. } => ErrorKind::Validation,
            Self::InsufficientStock(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) | Self::Forbidden(_) => ErrorKind::Permission,
            Self::Conflict(_) | Self::ConcurrentModification(_) => ErrorKind::Conflict,
            Self::DatabaseError(_) | Self::Store { .. } => ErrorKind::Db,
            Self::ExternalServiceError(_) => ErrorKind::External,
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// True for outcomes the caller can act on (bad input, wrong state, missing row, no access).
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Permission | ErrorKind::Conflict
        )
    }

    /// Message suitable for end users. Store and internal failures never leak details.
    pub fn localized_message(&self, locale: Locale) -> String {
        match (self, locale) {
            (Self::DatabaseError(_) | Self::Store { .. }, Locale::Es) => {
                "Error de base de datos".to_string()
            }
            (Self::DatabaseError(_) | Self::Store { .. }, Locale::En) => {
                "Database error".to_string()
            }
            (Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_), Locale::Es) => {
                "Error interno del servidor".to_string()
            }
            (Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_), Locale::En) => {
                "Internal server error".to_string()
            }
            (Self::ExternalServiceError(_), Locale::Es) => {
                "Servicio externo no disponible, intente nuevamente".to_string()
            }
            (Self::ExternalServiceError(_), Locale::En) => {
                "External service unavailable, please retry".to_string()
            }
            (Self::ConcurrentModification(id), Locale::Es) => {
                format!("El registro {id} cambió mientras se procesaba; intente nuevamente")
            }
            (Self::ConcurrentModification(id), Locale::En) => {
                format!("Record {id} changed while processing; please retry")
            }
            (
                Self::InvalidTransition {
                    entity,
                    from,
                    to,
                    allowed,
                },
                Locale::Es,
            ) => {
                let allowed = if allowed.is_empty() {
                    "ninguno".to_string()
                } else {
                    allowed.join(", ")
                };
                format!(
                    "No se puede cambiar {entity} de '{from}' a '{to}'. Estados permitidos: {allowed}"
                )
            }
            (Self::ValidationError(msg), Locale::Es) => format!("Error de validación: {msg}"),
            (Self::NotFound(msg), Locale::Es) => format!("No encontrado: {msg}"),
            (Self::Unauthorized(_), Locale::Es) => "Usuario no autenticado".to_string(),
            (Self::Forbidden(msg), Locale::Es) => format!("Acceso denegado: {msg}"),
            (Self::Conflict(msg), Locale::Es) => format!("Conflicto: {msg}"),
            (Self::InsufficientStock(msg), Locale::Es) => format!("Stock insuficiente: {msg}"),
            (_, Locale::En) => self.to_string(),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// Result extensions for easier error handling
pub trait ResultExt<T> {
    fn map_err_to_service(self) -> Result<T, ServiceError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<ServiceError>,
{
    fn map_err_to_service(self) -> Result<T, ServiceError> {
        self.map_err(|e| e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_lists_allowed_destinations() {
        let err = ServiceError::InvalidTransition {
            entity: "order".into(),
            from: "pending".into(),
            to: "delivered".into(),
            allowed: vec!["processing".into(), "cancelled".into()],
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            err.to_string(),
            "Cannot move order from 'pending' to 'delivered'; allowed: [processing, cancelled]"
        );
    }

    #[test]
    fn terminal_transition_names_no_destinations() {
        let err = ServiceError::InvalidTransition {
            entity: "order".into(),
            from: "completed".into(),
            to: "pending".into(),
            allowed: vec![],
        };
        assert!(err.to_string().ends_with("allowed: []"));
        assert!(err.localized_message(Locale::Es).contains("ninguno"));
    }

    #[test]
    fn error_kind_mapping() {
        assert_eq!(ServiceError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(ServiceError::Forbidden("x".into()).kind(), ErrorKind::Permission);
        assert_eq!(ServiceError::Unauthorized("x".into()).kind(), ErrorKind::Permission);
        assert_eq!(ServiceError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            ServiceError::ConcurrentModification(Uuid::nil()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("boom".into())).kind(),
            ErrorKind::Db
        );
        assert_eq!(
            ServiceError::InternalError("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn localized_message_hides_store_details() {
        let err = ServiceError::store(
            "orders.insert",
            Some(Uuid::nil()),
            DbErr::Custom("duplicate key value violates unique constraint".into()),
        );
        assert_eq!(err.localized_message(Locale::En), "Database error");
        assert_eq!(err.localized_message(Locale::Es), "Error de base de datos");
        assert!(err.to_string().contains("orders.insert"));
    }

    #[test]
    fn user_facing_errors_keep_their_message() {
        let err = ServiceError::ValidationError("reason is required".into());
        assert_eq!(
            err.localized_message(Locale::En),
            "Validation error: reason is required"
        );
        assert_eq!(
            err.localized_message(Locale::Es),
            "Error de validación: reason is required"
        );
        assert!(err.is_user_actionable());
        assert!(!ServiceError::InternalError("x".into()).is_user_actionable());
    }

    #[test]
    fn locale_parsing() {
        assert_eq!(Locale::parse("EN"), Some(Locale::En));
        assert_eq!(Locale::parse("es-MX"), Some(Locale::Es));
        assert_eq!(Locale::parse("fr"), None);
    }
}
