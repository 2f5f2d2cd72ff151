use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::{
        backends::BackendError, components::ComponentError, render::RenderError,
    },
    infra::error::InfraError,
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// A failure with a fixed public message and a private report.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<BackendError> for HttpError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::InvalidPattern { .. } | BackendError::InvalidPath(_) => {
                HttpError::from_error(
                    "application::error::backend_error_to_http_error",
                    StatusCode::BAD_REQUEST,
                    "Invalid pattern",
                    &error,
                )
            }
            _ => HttpError::from_error(
                "application::error::backend_error_to_http_error",
                StatusCode::SERVICE_UNAVAILABLE,
                "Cache backend unavailable",
                &error,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Render(
                RenderError::NotFound { .. } | RenderError::BlockNotFound { .. },
            )
            | AppError::Component(ComponentError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Render(RenderError::InvalidContext { .. })
            | AppError::Component(
                ComponentError::MissingProp { .. } | ComponentError::PropType { .. },
            )
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            // The client is gone; the status is only ever logged.
            AppError::Render(RenderError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Component(ComponentError::Backend(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Render(RenderError::Compilation { .. } | RenderError::Runtime { .. })
            | AppError::Component(ComponentError::Invalid { .. } | ComponentError::Scan(_))
            | AppError::Infra(_)
            | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn presentation_message(&self) -> &'static str {
        match self.status_code() {
            StatusCode::NOT_FOUND => "Page not found",
            StatusCode::BAD_REQUEST => "Request could not be processed",
            StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable",
            _ => match self {
                AppError::Render(RenderError::Compilation { .. })
                | AppError::Component(ComponentError::Invalid { .. }) => "Template is broken",
                AppError::Infra(InfraError::Configuration { .. }) => "Service misconfigured",
                _ => "Unexpected error occurred",
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = crate::presentation::views::render_error_page(status, message);
        report.attach(&mut response);
        response
    }
}
