//! Supported blockchain networks.

use std::fmt;

/// Blockchain network a wallet lives on.
///
/// Closed enumeration: the core only routes across networks the custody
/// provider and the cross-chain messenger both support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Network {
    /// Ethereum mainnet.
    #[serde(rename = "ETH")]
    Eth,
    /// Ethereum Sepolia testnet.
    #[serde(rename = "ETH-SEPOLIA")]
    EthSepolia,
    /// Avalanche C-Chain mainnet.
    #[serde(rename = "AVAX")]
    Avax,
    /// Avalanche Fuji testnet.
    #[serde(rename = "AVAX-FUJI")]
    AvaxFuji,
    /// Optimism mainnet.
    #[serde(rename = "OP")]
    Op,
    /// Optimism Sepolia testnet.
    #[serde(rename = "OP-SEPOLIA")]
    OpSepolia,
    /// Arbitrum One mainnet.
    #[serde(rename = "ARB")]
    Arb,
    /// Arbitrum Sepolia testnet.
    #[serde(rename = "ARB-SEPOLIA")]
    ArbSepolia,
    /// Base mainnet.
    #[serde(rename = "BASE")]
    Base,
    /// Base Sepolia testnet.
    #[serde(rename = "BASE-SEPOLIA")]
    BaseSepolia,
    /// Polygon PoS mainnet.
    #[serde(rename = "MATIC")]
    Matic,
    /// Polygon Amoy testnet.
    #[serde(rename = "MATIC-AMOY")]
    MaticAmoy,
    /// Solana mainnet.
    #[serde(rename = "SOL")]
    Sol,
    /// Solana devnet.
    #[serde(rename = "SOL-DEVNET")]
    SolDevnet,
}

impl Network {
    /// Whether addresses on this network are EVM-style (0x + 40 hex).
    pub const fn is_evm(&self) -> bool {
        !matches!(self, Self::Sol | Self::SolDevnet)
    }

    /// Cross-chain messaging domain identifier for this network.
    ///
    /// Testnets share the domain of their mainnet.
    pub const fn domain_id(&self) -> u32 {
        match self {
            Self::Eth | Self::EthSepolia => 0,
            Self::Avax | Self::AvaxFuji => 1,
            Self::Op | Self::OpSepolia => 2,
            Self::Arb | Self::ArbSepolia => 3,
            Self::Sol | Self::SolDevnet => 5,
            Self::Base | Self::BaseSepolia => 6,
            Self::Matic | Self::MaticAmoy => 7,
        }
    }

    /// Wire name, matching the custody provider's blockchain identifiers.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Eth => "ETH",
            Self::EthSepolia => "ETH-SEPOLIA",
            Self::Avax => "AVAX",
            Self::AvaxFuji => "AVAX-FUJI",
            Self::Op => "OP",
            Self::OpSepolia => "OP-SEPOLIA",
            Self::Arb => "ARB",
            Self::ArbSepolia => "ARB-SEPOLIA",
            Self::Base => "BASE",
            Self::BaseSepolia => "BASE-SEPOLIA",
            Self::Matic => "MATIC",
            Self::MaticAmoy => "MATIC-AMOY",
            Self::Sol => "SOL",
            Self::SolDevnet => "SOL-DEVNET",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_matches_wire_names() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(serde_json::to_string(&Network::BaseSepolia)?, "\"BASE-SEPOLIA\"");
        let parsed: Network = serde_json::from_str("\"SOL-DEVNET\"")?;
        assert_eq!(parsed, Network::SolDevnet);
        Ok(())
    }

    #[test]
    fn evm_predicate() {
        assert!(Network::Base.is_evm());
        assert!(!Network::Sol.is_evm());
    }

    #[test]
    fn testnets_share_domains() {
        assert_eq!(Network::Eth.domain_id(), Network::EthSepolia.domain_id());
        assert_eq!(Network::Base.domain_id(), 6);
    }
}
