use axum::http::{HeaderMap, HeaderValue, header};

/// Header understood by the NGINX/Apache edge proxy in front of us.
pub const NGINX_RESPONSE_BUFFER_HEADER: &str = "X-Accel-Buffering";

pub fn detect_content_type(file_name: &str) -> &'static str {
    mime_guess::from_path(file_name)
        .first_raw()
        .unwrap_or("application/octet-stream")
}

pub fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn attachment_disposition(file_name: &str) -> HeaderValue {
    let value = format!("attachment; filename=\"{}\"", escape_quotes(file_name));
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

pub fn disable_response_buffering(headers: &mut HeaderMap) {
    headers.insert(
        NGINX_RESPONSE_BUFFER_HEADER,
        HeaderValue::from_static("no"),
    );
}

pub fn set_no_cache_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, max-age=0, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Fri, 01 Jan 1990 00:00:00 GMT"),
    );
}

pub fn is_content_type(expected: &str, actual: &str) -> bool {
    // Media type comparison must ignore parameters such as charset.
    let media_type = actual.split(';').next().unwrap_or("").trim();
    media_type.eq_ignore_ascii_case(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_by_extension() {
        assert_eq!(detect_content_type("foo.zip"), "application/zip");
        assert_eq!(detect_content_type("foo.zippy"), "application/octet-stream");
        assert_eq!(detect_content_type("no-extension"), "application/octet-stream");
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(escape_quotes(r#"file "x".txt"#), r#"file \"x\".txt"#);
        assert_eq!(escape_quotes(r"back\slash"), r"back\\slash");
    }

    #[test]
    fn content_type_match_ignores_parameters_and_case() {
        assert!(is_content_type(
            "application/vnd.gitlab-workhorse+json",
            "application/vnd.gitlab-workhorse+json; charset=utf-8"
        ));
        assert!(is_content_type("text/html", "TEXT/HTML"));
        assert!(!is_content_type("text/html", "application/json"));
    }
}
