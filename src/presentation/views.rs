use askama::Template;
use axum::{
    http::{StatusCode, header::CONTENT_TYPE},
    response::{Html, IntoResponse, Response},
};
use tracing::warn;

/// Error page shown for failed renders. Never includes internal detail.
#[derive(Template)]
#[template(path = "error.html")]
pub struct ErrorTemplate {
    pub status_code: u16,
    pub title: String,
    pub message: &'static str,
}

impl ErrorTemplate {
    pub fn new(status: StatusCode, message: &'static str) -> Self {
        Self {
            status_code: status.as_u16(),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            message,
        }
    }
}

/// Renders the error page, or the bare message as plain text if the page
/// itself cannot be rendered.
pub fn render_error_page(status: StatusCode, message: &'static str) -> Response {
    match ErrorTemplate::new(status, message).render() {
        Ok(html) => (status, Html(html)).into_response(),
        Err(err) => {
            warn!(
                target = "tessera::presentation::views",
                status = status.as_u16(),
                error = %err,
                "error page failed to render"
            );
            (status, [(CONTENT_TYPE, "text/plain; charset=utf-8")], message).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_page_shows_status_and_message() {
        let html = ErrorTemplate::new(StatusCode::NOT_FOUND, "Page not found")
            .render()
            .expect("render");
        assert!(html.contains("404 · Not Found"));
        assert!(html.contains("<p>Page not found</p>"));
    }

    #[test]
    fn error_page_response_is_html() {
        let response = render_error_page(StatusCode::BAD_GATEWAY, "Upstream failed");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }
}
