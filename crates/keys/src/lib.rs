//! Canonicalization of member and target keys.
//!
//! Every group member and alert target is identified by a structured string
//! key whose canonical form depends on the entity type. Canonicalization is
//! deterministic and idempotent, so raw and already-canonical keys may be
//! used interchangeably at every call site.
//!
//! Keys which don't match the expected segment count for their format pass
//! through unchanged. This leniency is deliberate: bulk imports are not
//! all-or-nothing over a single odd key, and the store can still track such
//! members. They simply never match a network partition.

use models::{AlertType, GroupType};
use uuid::Uuid;

/// Prefix of canonical alert-template references.
pub const TEMPLATE_PREFIX: &str = "template:";

/// The canonicalization strategy of one entity type, selected once at the
/// boundary from a [`GroupType`] or [`AlertType`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyFormat {
    /// `{NETWORK}:{subnet}:{address}`. Network uppercased, subnet lowercased,
    /// `0x..` hex addresses lowercased, other address encodings preserved.
    NetworkAddress,
    /// `{NETWORK}:{subnet}`.
    Network,
    /// `{NETWORK}:{subnet}:{protocol-slug}` with the slug lowercased.
    ProtocolSlug,
    /// Like [`KeyFormat::NetworkAddress`], with an optional fourth
    /// `:token_id` segment preserved verbatim.
    Nft,
    /// `template:{uuid}`, lowercased.
    TemplateRef,
    /// Keys without structure (user ids); passed through unchanged.
    Verbatim,
}

impl KeyFormat {
    pub fn for_group(group_type: GroupType) -> KeyFormat {
        match group_type {
            GroupType::Wallet | GroupType::Token | GroupType::Contract => {
                KeyFormat::NetworkAddress
            }
            GroupType::Network => KeyFormat::Network,
            GroupType::Protocol => KeyFormat::ProtocolSlug,
            GroupType::Nft => KeyFormat::Nft,
            GroupType::Alert => KeyFormat::TemplateRef,
            GroupType::User => KeyFormat::Verbatim,
        }
    }

    pub fn for_alert(alert_type: AlertType) -> KeyFormat {
        match alert_type {
            AlertType::Wallet | AlertType::Token | AlertType::Contract => {
                KeyFormat::NetworkAddress
            }
            AlertType::Network => KeyFormat::Network,
            AlertType::Protocol => KeyFormat::ProtocolSlug,
            AlertType::Nft => KeyFormat::Nft,
        }
    }

    /// Whether keys of this format carry a `{NETWORK}:{subnet}` prefix, and
    /// so participate in per-network partition sets.
    pub fn has_network_prefix(&self) -> bool {
        matches!(
            self,
            KeyFormat::NetworkAddress | KeyFormat::Network | KeyFormat::ProtocolSlug | KeyFormat::Nft
        )
    }
}

/// Canonicalize a raw key under the given format.
pub fn normalize(raw: &str, format: KeyFormat) -> String {
    match format {
        KeyFormat::NetworkAddress => {
            let mut it = raw.splitn(3, ':');
            match (it.next(), it.next(), it.next()) {
                (Some(network), Some(subnet), Some(address)) => format!(
                    "{}:{}:{}",
                    network.to_uppercase(),
                    subnet.to_lowercase(),
                    normalize_address(address),
                ),
                _ => raw.to_string(),
            }
        }
        KeyFormat::Network => {
            let mut it = raw.splitn(2, ':');
            match (it.next(), it.next()) {
                (Some(network), Some(subnet)) => {
                    format!("{}:{}", network.to_uppercase(), subnet.to_lowercase())
                }
                _ => raw.to_string(),
            }
        }
        KeyFormat::ProtocolSlug => {
            let mut it = raw.splitn(3, ':');
            match (it.next(), it.next(), it.next()) {
                (Some(network), Some(subnet), Some(slug)) => format!(
                    "{}:{}:{}",
                    network.to_uppercase(),
                    subnet.to_lowercase(),
                    slug.to_lowercase(),
                ),
                _ => raw.to_string(),
            }
        }
        KeyFormat::Nft => {
            // Split on the first three colons only: a token id may itself
            // contain arbitrary characters and is preserved verbatim.
            let mut it = raw.splitn(4, ':');
            match (it.next(), it.next(), it.next(), it.next()) {
                (Some(network), Some(subnet), Some(address), token_id) => {
                    let mut key = format!(
                        "{}:{}:{}",
                        network.to_uppercase(),
                        subnet.to_lowercase(),
                        normalize_address(address),
                    );
                    if let Some(token_id) = token_id {
                        key.push(':');
                        key.push_str(token_id);
                    }
                    key
                }
                _ => raw.to_string(),
            }
        }
        KeyFormat::TemplateRef => match raw.split_once(':') {
            Some((prefix, id)) if prefix.eq_ignore_ascii_case("template") => {
                format!("template:{}", id.to_lowercase())
            }
            _ => raw.to_string(),
        },
        KeyFormat::Verbatim => raw.to_string(),
    }
}

// EVM hex addresses are case-insensitive and are lowercased. Other encodings
// (e.g. base58) are case-sensitive and must be preserved.
fn normalize_address(address: &str) -> String {
    if address.starts_with("0x") || address.starts_with("0X") {
        address.to_lowercase()
    } else {
        address.to_string()
    }
}

/// The `{NETWORK}:{subnet}` partition of a canonical key, or None if the
/// format carries no network prefix or the key is malformed.
pub fn network_partition(key: &str, format: KeyFormat) -> Option<String> {
    if !format.has_network_prefix() {
        return None;
    }
    let mut it = key.splitn(3, ':');
    match (it.next(), it.next(), it.next()) {
        (Some(network), Some(subnet), rest) => {
            if matches!(format, KeyFormat::Network) && rest.is_some() {
                return None;
            }
            if rest.is_none() && !matches!(format, KeyFormat::Network) {
                return None;
            }
            Some(format!("{network}:{subnet}"))
        }
        _ => None,
    }
}

/// Parse a canonical template reference (`template:{uuid}`) to its id.
pub fn template_id(key: &str) -> Option<Uuid> {
    key.strip_prefix(TEMPLATE_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Render a template id as its canonical member key.
pub fn template_ref(id: Uuid) -> String {
    format!("{TEMPLATE_PREFIX}{id}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wallet_keys_canonicalize_network_subnet_and_hex_address() {
        assert_eq!(
            normalize("eth:MainNet:0xABC", KeyFormat::NetworkAddress),
            "ETH:mainnet:0xabc"
        );
        // Non-hex addresses are case-preserved.
        assert_eq!(
            normalize("SOL:mainnet:5yBb", KeyFormat::NetworkAddress),
            "SOL:mainnet:5yBb"
        );
    }

    #[test]
    fn network_and_protocol_keys() {
        assert_eq!(normalize("eth:MAINNET", KeyFormat::Network), "ETH:mainnet");
        assert_eq!(
            normalize("eth:mainnet:UniSwap-V3", KeyFormat::ProtocolSlug),
            "ETH:mainnet:uniswap-v3"
        );
    }

    #[test]
    fn nft_token_id_segment_is_verbatim() {
        assert_eq!(
            normalize("eth:MainNet:0xDEF", KeyFormat::Nft),
            "ETH:mainnet:0xdef"
        );
        assert_eq!(
            normalize("eth:MainNet:0xDEF:Token:With:Colons", KeyFormat::Nft),
            "ETH:mainnet:0xdef:Token:With:Colons"
        );
    }

    #[test]
    fn template_refs_lowercase_their_uuid() {
        let raw = "template:0E984725-C51C-4BF4-9960-E1C80E27ABA0";
        let canonical = normalize(raw, KeyFormat::TemplateRef);
        assert_eq!(canonical, "template:0e984725-c51c-4bf4-9960-e1c80e27aba0");
        assert_eq!(
            template_id(&canonical),
            Some("0e984725-c51c-4bf4-9960-e1c80e27aba0".parse().unwrap())
        );
        assert_eq!(template_id("ETH:mainnet:0xabc"), None);

        let id = Uuid::new_v4();
        assert_eq!(template_id(&template_ref(id)), Some(id));
    }

    #[test]
    fn malformed_keys_pass_through_unchanged() {
        assert_eq!(normalize("JustAnAddress", KeyFormat::NetworkAddress), "JustAnAddress");
        assert_eq!(normalize("ETH", KeyFormat::Network), "ETH");
        assert_eq!(normalize("not-a-template", KeyFormat::TemplateRef), "not-a-template");
        assert_eq!(network_partition("JustAnAddress", KeyFormat::NetworkAddress), None);
    }

    #[test]
    fn normalize_is_idempotent_across_formats() {
        let cases = [
            ("eth:MainNet:0xABC", KeyFormat::NetworkAddress),
            ("SOL:mainnet:5yBb", KeyFormat::NetworkAddress),
            ("eth:MAINNET", KeyFormat::Network),
            ("eth:mainnet:UniSwap", KeyFormat::ProtocolSlug),
            ("eth:MainNet:0xDEF:42", KeyFormat::Nft),
            ("template:0E984725-C51C-4BF4-9960-E1C80E27ABA0", KeyFormat::TemplateRef),
            ("user-1234", KeyFormat::Verbatim),
            ("malformed", KeyFormat::NetworkAddress),
        ];
        for (raw, format) in cases {
            let once = normalize(raw, format);
            assert_eq!(normalize(&once, format), once, "key {raw:?}");
        }
    }

    #[test]
    fn partitions_of_canonical_keys() {
        assert_eq!(
            network_partition("ETH:mainnet:0xabc", KeyFormat::NetworkAddress),
            Some("ETH:mainnet".to_string())
        );
        assert_eq!(
            network_partition("ETH:mainnet:0xdef:42", KeyFormat::Nft),
            Some("ETH:mainnet".to_string())
        );
        assert_eq!(
            network_partition("ETH:mainnet", KeyFormat::Network),
            Some("ETH:mainnet".to_string())
        );
        assert_eq!(
            network_partition("template:abc", KeyFormat::TemplateRef),
            None
        );
    }
}
