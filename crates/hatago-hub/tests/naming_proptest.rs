//! Property tests for public-name generation and parsing.

use proptest::prelude::*;

use hatago_hub::config::NamingStrategy;
use hatago_hub::registry::{generate_public_name, parse_public_name};

fn strategies() -> impl Strategy<Value = NamingStrategy> {
    prop_oneof![
        Just(NamingStrategy::Namespace),
        Just(NamingStrategy::Alias),
    ]
}

proptest! {
    /// parse(generate(u, n)) == (u, n) for every id and name within the
    /// length bounds, under both renaming strategies.
    #[test]
    fn round_trip(
        strategy in strategies(),
        id in "[a-z][a-z0-9-]{0,40}",
        name in "[a-z][a-z0-9_/-]{0,80}",
    ) {
        let public = generate_public_name(strategy, "_", &id, &name);
        let parsed = parse_public_name(strategy, "_", [id.as_str()], &public);
        prop_assert_eq!(parsed, Some((id, name)));
    }

    /// Custom separators round-trip the same way.
    #[test]
    fn round_trip_custom_separator(
        strategy in strategies(),
        id in "[a-z][a-z0-9]{0,20}",
        name in "[a-z][a-z0-9_]{0,40}",
    ) {
        let public = generate_public_name(strategy, "::", &id, &name);
        let parsed = parse_public_name(strategy, "::", [id.as_str()], &public);
        prop_assert_eq!(parsed, Some((id, name)));
    }

    /// Parsing never fabricates an upstream that was not offered.
    #[test]
    fn parse_only_returns_known_labels(
        strategy in strategies(),
        id in "[a-z][a-z0-9]{0,20}",
        other in "[a-z][a-z0-9]{0,20}",
        name in "[a-z][a-z0-9_]{0,40}",
    ) {
        prop_assume!(id != other);
        let public = generate_public_name(strategy, "_", &id, &name);
        if let Some((label, _)) = parse_public_name(strategy, "_", [other.as_str()], &public) {
            prop_assert_eq!(label, other);
        }
    }
}
