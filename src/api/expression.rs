//! Gateway traffic expressions that match DNS queries against lists.
//!
//! The managed policy blocks a query when any of its domains is in one of
//! the referenced lists:
//!
//! ```text
//! any(dns.domains[*] in $<id1>) or any(dns.domains[*] in $<id2>)
//! ```

/// Gateway documents this as the practical upper bound for a rule.
pub const MAX_EXPRESSION_LEN: usize = 4000;

pub fn build_traffic_expression(list_ids: &[String]) -> String {
    list_ids
        .iter()
        .map(|id| format!("any(dns.domains[*] in ${})", id))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Extracts every `$<id>` list reference in order of appearance,
/// dropping repeats.
pub fn parse_list_references(traffic: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let mut rest = traffic;

    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(rest.len());
        let id = &rest[..end];
        if !id.is_empty() && !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
        rest = &rest[end..];
    }

    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_expression() {
        let ids = vec!["a1".to_string(), "b2".to_string()];
        assert_eq!(
            build_traffic_expression(&ids),
            "any(dns.domains[*] in $a1) or any(dns.domains[*] in $b2)"
        );
        assert_eq!(build_traffic_expression(&[]), "");
    }

    #[test]
    fn test_parse_references() {
        let traffic = "any(dns.domains[*] in $2b5e7c1a-0000-4d3e-9f00-1c2d3e4f5a6b) or any(dns.domains[*] in $abc)";
        assert_eq!(
            parse_list_references(traffic),
            vec![
                "2b5e7c1a-0000-4d3e-9f00-1c2d3e4f5a6b".to_string(),
                "abc".to_string()
            ]
        );
    }

    #[test]
    fn test_parse_ignores_unrelated_and_repeats() {
        assert!(parse_list_references("dns.fqdn == \"example.com\"").is_empty());
        assert_eq!(
            parse_list_references("any(dns.domains[*] in $x) or any(dns.domains[*] in $x)"),
            vec!["x".to_string()]
        );
    }
}
