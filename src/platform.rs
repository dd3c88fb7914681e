use serde::{Deserialize, Serialize};

use crate::utils::enums::text_enum;

/// External job source scraped independently within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linkedin,
    Glassdoor,
    Techfetch,
}

text_enum!(Platform {
    Linkedin => "linkedin",
    Glassdoor => "glassdoor",
    Techfetch => "techfetch",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for platform in Platform::ALL {
            let parsed: Platform = platform.as_str().parse().unwrap();
            assert_eq!(parsed, *platform);
        }
        assert!("indeed".parse::<Platform>().is_err());
        assert_eq!(
            serde_json::to_string(&Platform::Techfetch).unwrap(),
            "\"techfetch\""
        );
    }
}
