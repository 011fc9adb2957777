//! ERC-721 DID handling for message subjects.
//!
//! Vehicle assets are identified as `did:erc721:<chainId>:<contract>:<tokenId>`.

use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// A parsed vehicle DID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VehicleDid {
    pub chain_id: u64,
    pub contract: String,
    pub token_id: u64,
}

impl FromStr for VehicleDid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [scheme, method, chain, contract, token] = parts.as_slice() else {
            return Err(format!("expected 5 DID segments, got {}", parts.len()));
        };
        if *scheme != "did" || *method != "erc721" {
            return Err(format!("expected did:erc721, got {scheme}:{method}"));
        }
        let chain_id = chain
            .parse::<u64>()
            .map_err(|e| format!("invalid chain id {chain:?}: {e}"))?;
        if contract.len() != 42
            || !contract.starts_with("0x")
            || !contract[2..].chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(format!("invalid contract address {contract:?}"));
        }
        let token_id = token
            .parse::<u64>()
            .map_err(|e| format!("invalid token id {token:?}: {e}"))?;
        Ok(Self {
            chain_id,
            contract: contract.to_string(),
            token_id,
        })
    }
}

impl fmt::Display for VehicleDid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "did:erc721:{}:{}:{}",
            self.chain_id, self.contract, self.token_id
        )
    }
}

/// Validate a message subject as a vehicle DID and return its canonical
/// string form.
pub fn resolve_asset_did(subject: &str) -> Result<String, Error> {
    let did = subject.parse::<VehicleDid>().map_err(|e| Error::BadRequest {
        message: format!("message subject is not a vehicle DID: {e}"),
    })?;
    Ok(did.to_string())
}
