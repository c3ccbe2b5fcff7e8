use std::any::type_name;

/// How the words left after stripping an external account name are joined into a resource name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentifierStyle {
    /// `"Jane Doe"` becomes `"janedoe"`.
    Collapsed,
    /// `"Jane Doe"` becomes `"jane<sep>doe"`.
    Separated(char),
}

/// Normalize an external account name into a resource name.
///
/// The name is lowercased and trimmed, every character outside `[A-Za-z0-9 ]` is dropped and the
/// remaining words are joined according to `style`. Two accounts can normalize to the same
/// identifier; callers do not detect it and the last write wins.
pub fn normalize_identifier(account_name: &str, style: IdentifierStyle) -> String {
    let stripped = account_name
        .to_lowercase()
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect::<String>();
    let mut words = stripped.split_whitespace();
    match style {
        IdentifierStyle::Collapsed => words.collect(),
        IdentifierStyle::Separated(separator) => {
            let mut identifier = words.next().unwrap_or_default().to_string();
            for word in words {
                identifier.push(separator);
                identifier.push_str(word);
            }
            identifier
        }
    }
}

#[inline]
pub fn short_type_name<K>() -> Option<&'static str> {
    let type_name = type_name::<K>();
    type_name.split("::").last()
}

#[cfg(test)]
mod tests {
    use super::{IdentifierStyle, normalize_identifier, short_type_name};

    #[test]
    fn test_normalize_identifier_separated() {
        let style = IdentifierStyle::Separated('-');
        assert_eq!(normalize_identifier("Jane O'Brien", style), "jane-obrien");
        assert_eq!(normalize_identifier("  Max   Mustermann ", style), "max-mustermann");
        assert_eq!(normalize_identifier("admin", style), "admin");
        assert_eq!(normalize_identifier("ops@Example.COM", style), "opsexamplecom");
    }

    #[test]
    fn test_normalize_identifier_collapsed() {
        let style = IdentifierStyle::Collapsed;
        assert_eq!(normalize_identifier("Jane O'Brien", style), "janeobrien");
        assert_eq!(normalize_identifier("Jane - Doe 2", style), "janedoe2");
    }

    #[test]
    fn test_normalize_identifier_is_stable() {
        let style = IdentifierStyle::Separated('-');
        let first = normalize_identifier("Jane O'Brien", style);
        let second = normalize_identifier("Jane O'Brien", style);
        assert_eq!(first, second);
        assert!(
            first
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
    }

    #[test]
    fn test_normalize_identifier_drops_non_ascii() {
        let style = IdentifierStyle::Separated('-');
        assert_eq!(normalize_identifier("Zoë Ångström", style), "zo-ngstrm");
        assert_eq!(normalize_identifier("!!!", style), "");
        assert_eq!(normalize_identifier("Jane\tDoe", style), "janedoe");
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<i32>(), Some("i32"));
        assert_eq!(
            short_type_name::<k8s_openapi::api::core::v1::Pod>(),
            Some("Pod")
        );
    }
}
