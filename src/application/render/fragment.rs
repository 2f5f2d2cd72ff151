//! Strips the document wrapper from fragment renders.

use lol_html::{RewriteStrSettings, element, rewrite_str};

use super::RenderError;

/// Remove `<head>` and unwrap `<html>`/`<body>`, keeping everything else.
pub fn unwrap_document(template: &str, html: &str) -> Result<String, RenderError> {
    let body = strip_doctype(html);
    if !has_wrapper(body) {
        return Ok(body.to_string());
    }

    rewrite_str(
        body,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("head", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("html", |el| {
                    el.remove_and_keep_content();
                    Ok(())
                }),
                element!("body", |el| {
                    el.remove_and_keep_content();
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .map(|unwrapped| unwrapped.trim().to_string())
    .map_err(|err| RenderError::runtime(template, format!("fragment rewrite failed: {err}")))
}

fn strip_doctype(html: &str) -> &str {
    let trimmed = html.trim_start();
    let Some(prefix) = trimmed.get(..9) else {
        return html;
    };
    if !prefix.eq_ignore_ascii_case("<!doctype") {
        return html;
    }
    match trimmed.find('>') {
        Some(end) => trimmed[end + 1..].trim_start(),
        None => html,
    }
}

fn has_wrapper(html: &str) -> bool {
    let lower = html.to_ascii_lowercase();
    ["<html", "<head", "<body"]
        .iter()
        .any(|tag| lower.contains(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_document_is_unwrapped() {
        let html = "<!DOCTYPE html>\n<html><head><title>t</title></head>\
                    <body><div id=\"x\">hi</div></body></html>";
        assert_eq!(
            unwrap_document("page", html).expect("unwrap"),
            "<div id=\"x\">hi</div>"
        );
    }

    #[test]
    fn bare_markup_passes_through() {
        let html = "<li>one</li><li>two</li>";
        assert_eq!(unwrap_document("page", html).expect("unwrap"), html);
    }

    #[test]
    fn doctype_alone_is_dropped() {
        assert_eq!(
            unwrap_document("page", "<!doctype html><p>x</p>").expect("unwrap"),
            "<p>x</p>"
        );
    }
}
