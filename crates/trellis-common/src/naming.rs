// Name validation and symbolic address parsing

use crate::TRELLIS_SCHEME;
use crate::error::{Result, TrellisError};
use crate::model::UrlInfo;

/// Maximum byte length of a network, service or pool name
pub const MAX_NAME_LEN: usize = 128;

/// Validate a network, service or pool name.
///
/// Names are 1..=128 bytes of lowercase ASCII letters, digits, `-`, `_` and
/// `.`, with no leading, trailing or repeated dot.
pub fn validate_name(label: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TrellisError::bad_argument(format!("{} name is empty", label)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(
            TrellisError::bad_argument(format!("{} name exceeds {} bytes", label, MAX_NAME_LEN))
                .with_info("name", name),
        );
    }
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'));
    if !valid_chars || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return Err(
            TrellisError::bad_argument(format!("invalid {} name '{}'", label, name))
                .with_info("name", name),
        );
    }
    Ok(())
}

/// A `trellis://[user@]name[.network]/[path]` address
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SymbolicAddr {
    pub user: Option<String>,
    pub name: String,
    pub network: String,
    pub path: String,
}

impl SymbolicAddr {
    /// Key identifying one logical connection target
    pub fn cache_key(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}.{}/{}", user, self.name, self.network, self.path),
            None => format!("{}.{}/{}", self.name, self.network, self.path),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    /// Resolved through the registry
    Registry(SymbolicAddr),
    /// Any other scheme, connected to directly
    Direct(UrlInfo),
}

/// Parse an address.
///
/// `networks` lists the networks the caller knows about, the first being the
/// default. A host ending in `.<network>` for a known network is split into
/// name and network (longest match wins); any other host is a name in the
/// default network.
pub fn parse_address(input: &str, networks: &[&str]) -> Result<Address> {
    let default_network = networks
        .first()
        .copied()
        .ok_or_else(|| TrellisError::bad_argument("no default network configured"))?;

    let url = url::Url::parse(input)
        .map_err(|e| TrellisError::bad_argument(format!("invalid address '{}': {}", input, e)))?;

    if url.scheme() != TRELLIS_SCHEME {
        return UrlInfo::parse(input).map(Address::Direct);
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TrellisError::bad_argument(format!("address '{}' has no name", input)))?;

    let mut split = None;
    for network in networks {
        if let Some(name) = host.strip_suffix(network).and_then(|h| h.strip_suffix('.'))
            && !name.is_empty()
            && split.is_none_or(|(_, n): (&str, &str)| network.len() > n.len())
        {
            split = Some((name, *network));
        }
    }
    let (name, network) = split.unwrap_or((host, default_network));

    validate_name("service", name)?;
    validate_name("network", network)?;

    let user = match url.username() {
        "" => None,
        user => Some(user.to_string()),
    };

    Ok(Address::Registry(SymbolicAddr {
        user,
        name: name.to_string(),
        network: network.to_string(),
        path: url.path().trim_start_matches('/').to_string(),
    }))
}
