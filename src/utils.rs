//! Identifier minting helpers.

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::LifecycleError;

// construct a unique uuid7 then encode using bech32 with the given prefix
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String, LifecycleError> {
    let hrp = bech32::Hrp::parse(hrp)
        .map_err(|e| LifecycleError::Codec(format!("invalid hrp {hrp:?}: {e}")))?;
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| LifecycleError::Codec(e.to_string()))
}
