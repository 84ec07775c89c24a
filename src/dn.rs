//! helpers to normalize and compare distinguished names

/// escape sequences which are rewritten into their hex form so they survive
/// being used in filters and as base parameters
const DN_REPLACEMENTS: &[(&str, &str)] = &[
    ("\\,", "\\5c2c"),
    ("\\=", "\\5c3d"),
    ("\\+", "\\5c2b"),
    ("\\<", "\\5c3c"),
    ("\\>", "\\5c3e"),
    ("\\;", "\\5c3b"),
    ("\\\"", "\\5c22"),
    ("\\#", "\\5c23"),
    ("(", "\\28"),
    (")", "\\29"),
    ("*", "\\2a"),
];

/// attributes whose values are DNs and get sanitized on read
const DN_ATTRIBUTES: &[&str] = &["dn", "member", "uniquemember", "memberof"];

/// remove whitespace directly after unescaped commas
fn strip_rdn_whitespace(dn: &str) -> String {
    let mut result = String::with_capacity(dn.len());
    let mut chars = dn.chars().peekable();
    while let Some(c) = chars.next() {
        result.push(c);
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    result.push(escaped);
                }
            }
            ',' => {
                while chars.peek().is_some_and(|c| c.is_whitespace()) {
                    chars.next();
                }
            }
            _ => {}
        }
    }
    result
}

/// normalize a DN: no whitespace after RDN separators, lower case and
/// special characters in their escaped hex form
///
/// applying this twice gives the same result as applying it once
pub fn sanitize_dn(dn: &str) -> String {
    let mut dn = strip_rdn_whitespace(dn).to_lowercase();
    for (from, to) in DN_REPLACEMENTS {
        dn = dn.replace(from, to);
    }
    dn
}

/// turn the `\5c` escape back into a plain backslash so the DN can be used as
/// a search base
pub fn dn_as_base_parameter(dn: &str) -> String {
    let mut result = String::with_capacity(dn.len());
    let mut rest = dn;
    while let Some(pos) = rest.find('\\') {
        result.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.get(1..3).is_some_and(|hex| hex.eq_ignore_ascii_case("5c")) {
            result.push('\\');
            rest = &tail[3..];
        } else {
            result.push('\\');
            rest = &tail[1..];
        }
    }
    result.push_str(rest);
    result
}

/// check if the DN is located in one of the bases
///
/// the DN is expected to be sanitized already, the bases are sanitized here
pub fn is_dn_part_of_base<S: AsRef<str>>(dn: &str, bases: &[S]) -> bool {
    let dn = dn.to_lowercase();
    bases
        .iter()
        .map(|base| sanitize_dn(base.as_ref()))
        .filter(|base| !base.is_empty())
        .any(|base| dn.ends_with(&base))
}

/// split a DN into its RDNs at unescaped commas
///
/// returns `None` if any part is not of the form `attribute=value`
pub fn explode_dn(dn: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = dn.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    let parts: Vec<String> = parts.into_iter().map(|p| p.trim().to_string()).collect();
    if parts.iter().any(|p| !p.contains('=') || p.starts_with('=')) {
        return None;
    }
    Some(parts)
}

/// the part of the DN starting at the first `dc=` component
///
/// returns an empty string if there is no domain component
pub fn domain_dn_from_dn(dn: &str) -> String {
    let Some(parts) = explode_dn(dn) else {
        return String::new();
    };
    match parts
        .iter()
        .position(|part| part.to_lowercase().starts_with("dc="))
    {
        Some(first) => parts[first..].join(","),
        None => String::new(),
    }
}

/// check if a string looks like a DN
pub fn string_resembles_dn(value: &str) -> bool {
    !value.is_empty() && explode_dn(value).is_some()
}

/// check if the attribute holds DN values
pub fn attribute_resembles_dn(attribute: &str) -> bool {
    DN_ATTRIBUTES
        .iter()
        .any(|a| a.eq_ignore_ascii_case(attribute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizing_normalizes_case_and_whitespace() {
        assert_eq!(
            sanitize_dn("CN=John Doe, OU=Users,  DC=Example,DC=com"),
            "cn=john doe,ou=users,dc=example,dc=com"
        );
    }

    #[test]
    fn sanitizing_escapes_special_characters() {
        assert_eq!(
            sanitize_dn("cn=Doe\\, John (ext),ou=users,dc=example,dc=com"),
            "cn=doe\\5c2c john \\28ext\\29,ou=users,dc=example,dc=com"
        );
    }

    #[test]
    fn sanitizing_is_idempotent() {
        for dn in [
            "CN=Doe\\, John,OU=Users, DC=example,DC=com",
            "cn=a*b,ou=x, , dc=y",
            "uid=jdoe\\+1,ou=People\\=,dc=Example, dc=org",
            "cn=\\\"quoted\\\"\\#\\<\\>\\;,dc=example",
        ] {
            let once = sanitize_dn(dn);
            assert_eq!(sanitize_dn(&once), once, "input {}", dn);
        }
    }

    #[test]
    fn base_parameter_unescapes_backslash() {
        assert_eq!(
            dn_as_base_parameter("cn=doe\\5c2c john,dc=example"),
            "cn=doe\\2c john,dc=example"
        );
        assert_eq!(dn_as_base_parameter("cn=a\\5Cb"), "cn=a\\b");
        assert_eq!(dn_as_base_parameter("cn=plain"), "cn=plain");
    }

    #[test]
    fn base_membership_is_a_case_insensitive_suffix_match() {
        let bases = vec!["OU=Users, DC=Example,DC=com".to_string()];
        assert!(is_dn_part_of_base("uid=jdoe,ou=users,dc=example,dc=com", &bases));
        assert!(!is_dn_part_of_base("uid=jdoe,ou=groups,dc=example,dc=com", &bases));
        assert!(!is_dn_part_of_base::<String>("uid=jdoe,dc=example,dc=com", &[]));
    }

    #[test]
    fn domain_is_extracted() {
        assert_eq!(
            domain_dn_from_dn("cn=John,ou=Users,DC=example,DC=com"),
            "DC=example,DC=com"
        );
        assert_eq!(domain_dn_from_dn("cn=John,ou=Users"), "");
    }

    #[test]
    fn dn_detection() {
        assert!(string_resembles_dn("cn=group,dc=example,dc=com"));
        assert!(string_resembles_dn("cn=a\\,b,dc=example"));
        assert!(!string_resembles_dn("just a name"));
        assert!(!string_resembles_dn(""));
        assert!(attribute_resembles_dn("memberOf"));
        assert!(!attribute_resembles_dn("cn"));
    }
}
