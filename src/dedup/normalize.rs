use regex::Regex;
use std::sync::OnceLock;
use url::Url;

fn non_alphanumeric() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").expect("static pattern is valid"))
}

/// Lowercase, turn every run of non-alphanumerics into one space, trim.
///
/// "Sr. Software Engineer (Remote)" and "sr software engineer remote" share
/// a key.
pub fn normalize_key(input: &str) -> String {
    let lowered = input.to_lowercase();
    non_alphanumeric()
        .replace_all(&lowered, " ")
        .trim()
        .to_string()
}

/// Normalized key of an optional field, `None` when nothing is left.
pub fn normalize_field(input: Option<&str>) -> Option<String> {
    input.map(normalize_key).filter(|key| !key.is_empty())
}

/// Canonical form of a job URL: lowercase host, no default port, no
/// fragment, no tracking parameters, query sorted by key.
///
/// Strings that do not parse as URLs are returned trimmed.
pub fn canonicalize_url(raw: &str) -> String {
    let raw = raw.trim();
    let mut url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => return raw.to_string(),
    };

    url.set_fragment(None);

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if params.is_empty() {
        url.set_query(None);
    } else {
        params.sort();
        url.query_pairs_mut().clear().extend_pairs(params);
    }

    url.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || matches!(key, "trk" | "trackingId" | "refId" | "src")
}

/// Sørensen–Dice similarity of two normalized descriptions, in `[0, 1]`.
pub fn description_similarity(a: &str, b: &str) -> f64 {
    strsim::sorensen_dice(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(
            normalize_key("  Sr. Software-Engineer (Remote)  "),
            "sr software engineer remote"
        );
        assert_eq!(normalize_key("Zürich, CH"), "zürich ch");
        assert_eq!(normalize_key("--- / ---"), "");
    }

    #[test]
    fn test_normalize_field_treats_blank_as_missing() {
        assert_eq!(normalize_field(None), None);
        assert_eq!(normalize_field(Some("  ?? ")), None);
        assert_eq!(normalize_field(Some("ACME Corp.")), Some("acme corp".to_string()));
    }

    #[test]
    fn test_canonicalize_url() {
        assert_eq!(
            canonicalize_url("https://WWW.LinkedIn.com:443/jobs/view/123/?utm_source=x&b=2&a=1#apply"),
            "https://www.linkedin.com/jobs/view/123?a=1&b=2"
        );
        assert_eq!(
            canonicalize_url("https://example.com/job?trk=feed"),
            "https://example.com/job"
        );
        assert_eq!(canonicalize_url(" not a url "), "not a url");
    }

    #[test]
    fn test_description_similarity() {
        let a = normalize_key("We are hiring a Rust engineer to build data pipelines.");
        let b = normalize_key("We are hiring a Rust engineer to build data pipelines!");
        assert!(description_similarity(&a, &b) > 0.99);

        let c = normalize_key("Seeking a pastry chef for our downtown bakery.");
        assert!(description_similarity(&a, &c) < 0.5);
    }
}
