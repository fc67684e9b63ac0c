//! Standardized mapping of registry HTTP failures onto [`ImportError`]

use crate::error::ImportError;
use reqwest::StatusCode;

const NO_SPACE_MARKERS: [&str; 3] = [
    "no space left on device",
    "insufficient storage",
    "disk quota exceeded",
];

/// Standard error handler for registry HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Handle errors returned while uploading layer or config blobs
    pub fn handle_upload_error(status: StatusCode, error_text: &str, context: &str) -> ImportError {
        if status == StatusCode::INSUFFICIENT_STORAGE || contains_no_space_marker(error_text) {
            return ImportError::NoSpaceLeft(format!(
                "Registry out of storage during {}: {}",
                context, error_text
            ));
        }

        let error_msg = match status.as_u16() {
            400 => {
                if error_text.contains("DIGEST_INVALID") {
                    format!(
                        "Digest validation failed during {} - uploaded content does not match the declared digest: {}",
                        context, error_text
                    )
                } else {
                    format!("Bad request during {}: {}", context, error_text)
                }
            }
            401 | 403 => return Self::handle_auth_error(status, error_text),
            404 => format!(
                "Repository not found or {} session expired: {}",
                context, error_text
            ),
            413 => format!("Blob too large for {}: {}", context, error_text),
            416 => format!("Upload range rejected during {}: {}", context, error_text),
            500 => format!("Registry server error during {}: {}", context, error_text),
            502 | 503 => format!("Registry unavailable during {}: {}", context, error_text),
            _ => format!("{} failed (status {}): {}", context, status, error_text),
        };

        ImportError::Registry(error_msg)
    }

    /// Handle authentication-related HTTP errors
    pub fn handle_auth_error(status: StatusCode, error_text: &str) -> ImportError {
        let error_msg = match status.as_u16() {
            400 => "Invalid token request parameters".to_string(),
            401 => "Invalid credentials provided".to_string(),
            403 => "Access denied - insufficient permissions".to_string(),
            404 => "Authentication endpoint not found".to_string(),
            _ => format!("Authentication failed (status {}): {}", status, error_text),
        };

        ImportError::Authentication(error_msg)
    }

    /// Handle errors from manifest and other non-blob registry calls
    pub fn handle_registry_error(status: StatusCode, error_text: &str, operation: &str) -> ImportError {
        if status == StatusCode::INSUFFICIENT_STORAGE || contains_no_space_marker(error_text) {
            return ImportError::NoSpaceLeft(format!(
                "Registry out of storage during {}: {}",
                operation, error_text
            ));
        }

        let error_msg = match status.as_u16() {
            401 => format!("Unauthorized to perform {}: {}", operation, error_text),
            403 => format!(
                "Forbidden: insufficient permissions for {}: {}",
                operation, error_text
            ),
            404 => format!("Resource not found for {}: {}", operation, error_text),
            429 => format!("Rate limited during {}: {}", operation, error_text),
            500 => format!("Registry server error during {}: {}", operation, error_text),
            502 | 503 => format!("Registry unavailable for {}: {}", operation, error_text),
            _ => format!("{} failed (status {}): {}", operation, status, error_text),
        };

        ImportError::Registry(error_msg)
    }
}

/// ENOSPC and friends, as reported by the OS or embedded in an error message
pub fn is_no_space_left(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::StorageFull || contains_no_space_marker(&err.to_string())
}

fn contains_no_space_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    NO_SPACE_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_storage_maps_to_no_space_left() {
        let err = HttpErrorHandler::handle_upload_error(
            StatusCode::INSUFFICIENT_STORAGE,
            "",
            "layer upload",
        );
        assert!(matches!(err, ImportError::NoSpaceLeft(_)));

        let err = HttpErrorHandler::handle_registry_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write /var/lib/registry: no space left on device",
            "manifest upload",
        );
        assert!(matches!(err, ImportError::NoSpaceLeft(_)));
    }

    #[test]
    fn unauthorized_upload_is_authentication_error() {
        let err = HttpErrorHandler::handle_upload_error(StatusCode::UNAUTHORIZED, "", "layer upload");
        assert!(matches!(err, ImportError::Authentication(_)));
    }

    #[test]
    fn other_statuses_keep_context() {
        let err = HttpErrorHandler::handle_registry_error(StatusCode::NOT_FOUND, "nope", "manifest upload");
        match err {
            ImportError::Registry(msg) => assert!(msg.contains("manifest upload")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
