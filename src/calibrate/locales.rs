// Embedded locale tables for path-segment masking. Held as static data so
// the detector never touches the filesystem.

use std::collections::HashSet;
use std::sync::LazyLock;

/// ISO 639-1 language codes commonly used as path segments.
static LANGUAGE_CODES: &[&str] = &[
    "ar", "bg", "bn", "ca", "cs", "da", "de", "el", "en", "es", "et", "fa", "fi", "fr", "he",
    "hi", "hr", "hu", "id", "it", "ja", "ko", "lt", "lv", "ms", "nb", "nl", "no", "pl", "pt",
    "ro", "ru", "sk", "sl", "sr", "sv", "th", "tr", "uk", "vi", "zh",
];

/// ISO 3166-1 alpha-2 country codes commonly used as path segments.
static COUNTRY_CODES: &[&str] = &[
    "ae", "ar", "at", "au", "be", "bg", "br", "ca", "ch", "cl", "cn", "co", "cz", "de", "dk",
    "ee", "eg", "es", "fi", "fr", "gb", "gr", "hk", "hr", "hu", "id", "ie", "il", "in", "it",
    "jp", "kr", "lt", "lv", "mx", "my", "nl", "no", "nz", "pe", "ph", "pl", "pt", "ro", "rs",
    "ru", "sa", "se", "sg", "si", "sk", "th", "tr", "tw", "ua", "uk", "us", "vn", "za",
];

static LANGUAGES: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| LANGUAGE_CODES.iter().copied().collect());

static COUNTRIES: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| COUNTRY_CODES.iter().copied().collect());

pub(super) fn is_language_code(segment: &str) -> bool {
    LANGUAGES.contains(segment)
}

pub(super) fn is_country_code(segment: &str) -> bool {
    COUNTRIES.contains(segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_resolve() {
        assert!(is_language_code("en"));
        assert!(is_language_code("zh"));
        assert!(is_country_code("us"));
        assert!(is_country_code("gb"));
        assert!(!is_language_code("xx"));
        assert!(!is_country_code("zz"));
    }
}
