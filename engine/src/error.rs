use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Supabase API error: {status} - {message}")]
    SupabaseApi { status: u16, message: String },

    #[error("Airtable API error: {status} - {message}")]
    AirtableApi { status: u16, message: String },

    #[error("Field values rejected: {fields:?}")]
    InvalidFieldValue { fields: Vec<String> },

    #[error("Missing required field on create: {entity}.{field}")]
    MissingRequiredField { entity: String, field: String },

    #[error("Rate limited: retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Record has no usable id: {0}")]
    MissingRecordId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String)
}

impl SyncError {
    /// Transient failures are counted against the record and picked up again
    /// on the next run.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited { .. } => true,
            Self::SupabaseApi { status, .. } | Self::AirtableApi { status, .. } => *status >= 500,
            _ => false
        }
    }

    /// Coarse category used as the error-type key of the run summary.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Config(_) => "config",
            Self::SupabaseApi { .. } => "supabase_api",
            Self::AirtableApi { .. } => "airtable_api",
            Self::InvalidFieldValue { .. } => "invalid_field_value",
            Self::MissingRequiredField { .. } => "missing_required_field",
            Self::RateLimited { .. } => "rate_limited",
            Self::MissingRecordId(_) => "missing_record_id",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::RateLimited {
            retry_after_seconds: 30
        }
        .is_retryable());
        assert!(SyncError::SupabaseApi {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_retryable());
        assert!(!SyncError::AirtableApi {
            status: 422,
            message: "unprocessable".to_string()
        }
        .is_retryable());
        assert!(!SyncError::MissingRequiredField {
            entity: "cars".to_string(),
            field: "make".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        let err = SyncError::InvalidFieldValue {
            fields: vec!["distance".to_string()]
        };
        assert_eq!(err.kind_label(), "invalid_field_value");
        assert_eq!(
            SyncError::Config("missing token".to_string()).kind_label(),
            "config"
        );
    }
}
