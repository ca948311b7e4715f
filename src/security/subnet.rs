use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Reasons a request fails the trusted subnet check.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubnetError {
    /// The subnet itself is not valid CIDR.
    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),
    /// The request carries no `X-Real-IP`.
    #[error("missing X-Real-IP header")]
    MissingIp,
    /// `X-Real-IP` is not an address.
    #[error("invalid X-Real-IP {0:?}")]
    InvalidIp(String),
    /// The address is outside the subnet.
    #[error("{0} is not in the trusted subnet")]
    Untrusted(IpAddr),
}

/// A CIDR block, such as `192.168.1.0/24` or `fd00::/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    /// Whether `ip` is inside the block. Addresses of the other family never
    /// are.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }

    /// Check a raw `X-Real-IP` header value.
    pub fn check(&self, header: Option<&str>) -> Result<IpAddr, SubnetError> {
        let raw = header.map(str::trim).filter(|s| !s.is_empty()).ok_or(SubnetError::MissingIp)?;
        let ip: IpAddr = raw.parse().map_err(|_| SubnetError::InvalidIp(raw.to_string()))?;
        if self.contains(ip) {
            Ok(ip)
        } else {
            Err(SubnetError::Untrusted(ip))
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Subnet, SubnetError> {
        let invalid = || SubnetError::InvalidCidr(s.to_string());
        let mut parts = s.trim().splitn(2, '/');
        let network: IpAddr = parts.next().and_then(|a| a.parse().ok()).ok_or_else(invalid)?;
        let prefix: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Subnet { network, prefix })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}
