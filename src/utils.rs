use rand::RngCore;
use uuid::Uuid;

/// Normalize a Wifi MAC address to upper-case colon-separated form.
///
/// Accepts `:` or `-` separated pairs and any letter case; the normalized
/// form is what gets persisted, so equality checks stay exact.
pub fn normalize_mac_address(raw: &str) -> Result<String, String> {
    let cleaned = raw.trim();
    let parts: Vec<&str> = if cleaned.contains(':') {
        cleaned.split(':').collect()
    } else if cleaned.contains('-') {
        cleaned.split('-').collect()
    } else {
        return Err(format!("invalid MAC address: {}", raw));
    };

    if parts.len() != 6 {
        return Err(format!("invalid MAC address: {}", raw));
    }
    let mut octets = Vec::with_capacity(6);
    for part in parts {
        if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid MAC address: {}", raw));
        }
        octets.push(part.to_ascii_uppercase());
    }
    Ok(octets.join(":"))
}

/// Generate a random bearer token of `bytes` random bytes, hex-encoded.
pub fn generate_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Channel name assigned to a bound device's live connection. The socket
/// layer uses this string to push commands to the device.
pub fn device_channel_name(device_kind: &str, id: Uuid) -> String {
    format!("{}.{}", device_kind, id.simple())
}

/// Login email derived from a coordinator's ID, used to bind the coordinator
/// to a credential with the identity provider.
pub fn coordinator_login_email(id: Uuid) -> String {
    format!("{}@coordinator.localhost", id)
}

/// Derive the full subdomain name for a site from a user-chosen prefix.
///
/// The prefix must be a valid DNS label (lower-case alphanumerics and
/// hyphens, no leading/trailing hyphen).
pub fn derive_subdomain(prefix: &str, namespace: &str, server_domain: &str) -> Result<String, String> {
    let prefix = prefix.trim();
    let valid = !prefix.is_empty()
        && prefix.len() <= 63
        && !prefix.starts_with('-')
        && !prefix.ends_with('-')
        && prefix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(format!("invalid subdomain prefix: {}", prefix));
    }
    Ok(format!("{}.{}.{}", prefix, namespace, server_domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mac_addresses() {
        assert_eq!(
            normalize_mac_address("aa:bb:cc:dd:ee:ff").unwrap(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(
            normalize_mac_address("AA-BB-CC-DD-EE-FF").unwrap(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert!(normalize_mac_address("aa:bb:cc:dd:ee").is_err());
        assert!(normalize_mac_address("zz:bb:cc:dd:ee:ff").is_err());
        assert!(normalize_mac_address("aabbccddeeff").is_err());
    }

    #[test]
    fn token_is_hex_of_requested_length() {
        let token = generate_token(20);
        assert_eq!(token.len(), 40);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        // two draws should practically never collide
        assert_ne!(token, generate_token(20));
    }

    #[test]
    fn derives_subdomains() {
        assert_eq!(
            derive_subdomain("greens", "farms", "example.com").unwrap(),
            "greens.farms.example.com"
        );
        assert!(derive_subdomain("", "farms", "example.com").is_err());
        assert!(derive_subdomain("-greens", "farms", "example.com").is_err());
        assert!(derive_subdomain("Greens", "farms", "example.com").is_err());
    }

    #[test]
    fn channel_names_use_the_simple_uuid_form() {
        let id: Uuid = "6c16bd52-55b4-4f2c-9b1b-1b2f19d58b6a".parse().unwrap();
        assert_eq!(
            device_channel_name("coordinator", id),
            "coordinator.6c16bd5255b44f2c9b1b1b2f19d58b6a"
        );
    }

    #[test]
    fn login_email_embeds_coordinator_id() {
        let id = Uuid::nil();
        assert_eq!(
            coordinator_login_email(id),
            "00000000-0000-0000-0000-000000000000@coordinator.localhost"
        );
    }
}
