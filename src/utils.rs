use crate::peer::types::ServerConfig;
use rand::Rng;

/// Fresh random identifier, hex encoded (32 chars).
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 16]>())
}

// Adds the protocol scheme to an ICE server URL when it is missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Destination addresses are compared after trimming surrounding whitespace.
pub fn normalize_destination(address: &str) -> Option<String> {
    let trimmed = address.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_fresh() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn scheme_added_by_server_type() {
        let mut config = ServerConfig::stun("stun.example.com:3478");
        assert_eq!(add_ice_url_scheme(&config), "stun:stun.example.com:3478");

        config.r#type = "turn".into();
        assert_eq!(add_ice_url_scheme(&config), "turn:stun.example.com:3478");

        config.url = "stun:already.example.com".into();
        assert_eq!(add_ice_url_scheme(&config), "stun:already.example.com");
    }

    #[test]
    fn destinations_are_trimmed() {
        assert_eq!(
            normalize_destination("  rtmp://a/x \n").as_deref(),
            Some("rtmp://a/x")
        );
        assert_eq!(normalize_destination("   "), None);
    }
}
