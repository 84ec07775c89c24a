//! composition and escaping of LDAP search filters

/// combine filters with the given operator (`&` or `|`), filters without
/// surrounding parentheses get them added, empty filters are skipped
pub fn combine_filter<S: AsRef<str>>(filters: &[S], operator: char) -> String {
    let mut combined = format!("({}", operator);
    for filter in filters {
        let filter = filter.as_ref();
        if filter.is_empty() {
            continue;
        }
        if filter.starts_with('(') {
            combined.push_str(filter);
        } else {
            combined.push('(');
            combined.push_str(filter);
            combined.push(')');
        }
    }
    combined.push(')');
    combined
}

/// combine filters so all of them need to match
pub fn combine_filter_with_and<S: AsRef<str>>(filters: &[S]) -> String {
    combine_filter(filters, '&')
}

/// combine filters so any of them needs to match
pub fn combine_filter_with_or<S: AsRef<str>>(filters: &[S]) -> String {
    combine_filter(filters, '|')
}

/// escape user input for use inside a filter (RFC 4515), the special
/// characters become a backslash and two hex digits
///
/// with `allow_asterisk` a single leading `*` is kept as a wildcard
pub fn escape_filter_part(input: &str, allow_asterisk: bool) -> String {
    let (prefix, rest) = match input.strip_prefix('*') {
        Some(rest) if allow_asterisk => ("*", rest),
        _ => ("", input),
    };
    let mut escaped = String::with_capacity(input.len() + 6);
    escaped.push_str(prefix);
    for c in rest.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// make sure a filter is wrapped in parentheses
pub fn parenthesize(filter: &str) -> String {
    if filter.starts_with('(') {
        filter.to_string()
    } else {
        format!("({})", filter)
    }
}

/// add the wildcard for prefix matches to a search term, an empty term
/// matches everything
pub fn prepare_search_term(term: &str, allow_enumeration: bool) -> String {
    if term.is_empty() {
        "*".to_string()
    } else if allow_enumeration {
        format!("{}*", term)
    } else {
        term.to_string()
    }
}

/// filter for multi word searches: every word has to match at least one of
/// the search attributes
///
/// returns `None` if fewer than two search attributes are given
pub fn advanced_filter_part_for_search<S: AsRef<str>>(
    search: &str,
    search_attributes: &[S],
    allow_enumeration: bool,
) -> Option<String> {
    if search_attributes.len() < 2 {
        return None;
    }
    let word_filters: Vec<String> = search
        .split(' ')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let term = prepare_search_term(word, allow_enumeration);
            let alternatives: Vec<String> = search_attributes
                .iter()
                .map(|attribute| format!("{}={}", attribute.as_ref(), term))
                .collect();
            combine_filter_with_or(&alternatives)
        })
        .collect();
    Some(combine_filter_with_and(&word_filters))
}

/// filter part to search for the given term in the search attributes, or in
/// the fallback attribute if no search attributes are configured
pub fn filter_part_for_search<S: AsRef<str>>(
    search: &str,
    search_attributes: &[S],
    fallback_attribute: &str,
    allow_enumeration: bool,
) -> String {
    if !search_attributes.is_empty() && search.contains(' ') {
        match advanced_filter_part_for_search(search, search_attributes, allow_enumeration) {
            Some(filter) => return filter,
            None => tracing::debug!(
                "Creating advanced filter for search requires at least two search attributes, falling back"
            ),
        }
    }
    let term = prepare_search_term(search, allow_enumeration);
    let filters: Vec<String> = if search_attributes.is_empty() {
        if fallback_attribute.is_empty() {
            return String::new();
        }
        vec![format!("{}={}", fallback_attribute, term)]
    } else {
        search_attributes
            .iter()
            .map(|attribute| format!("{}={}", attribute.as_ref(), term))
            .collect()
    };
    if filters.len() == 1 {
        return format!("({})", filters[0]);
    }
    combine_filter_with_or(&filters)
}
