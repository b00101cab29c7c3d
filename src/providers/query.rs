//! Instance query grammar
//!
//! Every `-q` flag is one OR-clause; within a clause `key=value` pairs are
//! joined by `;` and must all hold. Only the first `=` splits key from value,
//! so `label=app=example` is the pair `label` / `app=example`.

use super::Metadata;
use crate::{ProbeError, Result};
use std::collections::BTreeMap;

/// One conjunction of `key=value` predicates
pub type QueryParams = BTreeMap<String, String>;

pub fn parse_query(clause: &str) -> Result<QueryParams> {
    let mut params = QueryParams::new();

    for pair in clause.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').ok_or_else(|| ProbeError::InvalidQuery {
            query: clause.to_string(),
            reason: format!("expected key=value, got {:?}", pair),
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ProbeError::InvalidQuery {
                query: clause.to_string(),
                reason: "empty key".to_string(),
            });
        }
        params.insert(key.to_string(), value.trim().to_string());
    }

    Ok(params)
}

pub fn parse_queries<S: AsRef<str>>(clauses: &[S]) -> Result<Vec<QueryParams>> {
    clauses.iter().map(|c| parse_query(c.as_ref())).collect()
}

/// Replace an empty clause list by a single match-all clause
pub fn normalize(params: &[QueryParams]) -> Vec<QueryParams> {
    if params.is_empty() {
        vec![QueryParams::new()]
    } else {
        params.to_vec()
    }
}

/// True when `metadata` satisfies at least one clause
pub fn matches(metadata: &Metadata, params: &[QueryParams]) -> bool {
    normalize(params).iter().any(|clause| {
        clause
            .iter()
            .all(|(key, value)| metadata.get(key).is_some_and(|v| v == value))
    })
}

/// True when `metadata` satisfies every pair of `clause` whose key is not
/// in `consumed`. Providers use it for keys they did not turn into a
/// backend-side filter.
pub fn matches_except(metadata: &Metadata, clause: &QueryParams, consumed: &[&str]) -> bool {
    clause
        .iter()
        .filter(|(key, _)| !consumed.contains(&key.as_str()))
        .all(|(key, value)| metadata.get(key).is_some_and(|v| v == value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> QueryParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_queries_disjunction() {
        let parsed =
            parse_queries(&["label=app=example;namespace=my-system", "label=app=hello"]).unwrap();
        assert_eq!(
            parsed,
            vec![
                map(&[("label", "app=example"), ("namespace", "my-system")]),
                map(&[("label", "app=hello")]),
            ]
        );
    }

    #[test]
    fn test_parse_concatenation_distributes() {
        let q1 = vec!["name=vpp1;namespace=a".to_string()];
        let q2 = vec!["label=app=vpp".to_string(), "".to_string()];
        let joined: Vec<String> = q1.iter().chain(q2.iter()).cloned().collect();

        let mut expected = parse_queries(&q1).unwrap();
        expected.extend(parse_queries(&q2).unwrap());
        assert_eq!(parse_queries(&joined).unwrap(), expected);
    }

    #[test]
    fn test_empty_clause_matches_all() {
        assert_eq!(parse_query("").unwrap(), QueryParams::new());
        assert_eq!(parse_query(" ; ").unwrap(), QueryParams::new());

        let meta = map(&[("env", "local"), ("pid", "42")]);
        assert!(matches(&meta, &[]));
        assert!(matches(&meta, &[QueryParams::new()]));
    }

    #[test]
    fn test_invalid_pairs() {
        assert!(matches!(
            parse_query("name"),
            Err(ProbeError::InvalidQuery { .. })
        ));
        assert!(matches!(
            parse_query("=value"),
            Err(ProbeError::InvalidQuery { .. })
        ));
    }

    #[test]
    fn test_matches_any_clause() {
        let meta = map(&[("env", "local"), ("pid", "42")]);
        let clauses = vec![map(&[("pid", "7")]), map(&[("env", "local"), ("pid", "42")])];
        assert!(matches(&meta, &clauses));
        assert!(!matches(&meta, &[map(&[("pid", "42"), ("name", "x")])]));
    }

    #[test]
    fn test_matches_except_consumed_keys() {
        let meta = map(&[("env", "container"), ("image", "vpp:21.01")]);
        let clause = map(&[("label", "app=vpp"), ("image", "vpp:21.01")]);
        assert!(matches_except(&meta, &clause, &["label"]));
        assert!(!matches_except(&meta, &clause, &[]));
    }
}
