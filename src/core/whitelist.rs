//! Sources that are never classified or blocked.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

/// Set of trusted addresses and networks
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    networks: Vec<IpNetwork>,
}

impl Whitelist {
    /// Parse CIDR networks or bare addresses.
    ///
    /// Returns the offending entry when one does not parse.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, String> {
        let networks = entries
            .iter()
            .map(|entry| {
                let entry = entry.as_ref().trim();
                entry
                    .parse::<IpNetwork>()
                    .map_err(|e| format!("invalid whitelist entry '{}': {}", entry, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { networks })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(*ip))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_networks_and_addresses() {
        let whitelist = Whitelist::parse(&["127.0.0.1", "192.168.1.0/24", "fd00::/8"]).unwrap();

        assert!(whitelist.contains(&"127.0.0.1".parse().unwrap()));
        assert!(whitelist.contains(&"192.168.1.77".parse().unwrap()));
        assert!(whitelist.contains(&"fd12::1".parse().unwrap()));
        assert!(!whitelist.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!whitelist.contains(&"127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Whitelist::parse(&["10.0.0.0/33"]).is_err());
        assert!(Whitelist::parse(&["not-an-ip"]).is_err());
        assert!(Whitelist::parse::<&str>(&[]).unwrap().is_empty());
    }
}
