//! Legacy address methods.
//!
//! Protocol 1.2 dropped the `blockchain.address.*` family in favour of
//! `blockchain.scripthash.*`, keyed by the Electrum script hash of the
//! output script instead of the address text. Callers written against the
//! old names keep working by rewriting the method and its first argument
//! before the request is sent.

use std::str::FromStr;

use bitcoin::Address;
use bitcoin::hashes::{Hash, sha256};
use serde_json::Value;

use crate::rpc::{RpcError, RpcResult};

/// Method prefix of the retired address-keyed calls.
pub const ADDRESS_PREFIX: &str = "blockchain.address.";

/// Method prefix of their script-hash replacements.
pub const SCRIPTHASH_PREFIX: &str = "blockchain.scripthash.";

/// Electrum script hash of an address: SHA-256 of its output script, byte
/// order reversed, hex encoded.
///
/// Addresses of any network are accepted.
pub fn address_to_scripthash(address: &str) -> RpcResult<String> {
    let address = Address::from_str(address)
        .map_err(|e| RpcError::InvalidAddress(format!("{}: {}", address, e)))?
        .assume_checked();

    let script = address.script_pubkey();
    let mut digest = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    digest.reverse();
    Ok(hex::encode(digest))
}

/// Rewrite a `blockchain.address.*` call into its script-hash form.
///
/// Any other method is returned untouched.
pub fn rewrite_address_method(
    method: &str,
    mut params: Vec<Value>,
) -> RpcResult<(String, Vec<Value>)> {
    let Some(suffix) = method.strip_prefix(ADDRESS_PREFIX) else {
        return Ok((method.to_string(), params));
    };

    let address = match params.first() {
        Some(Value::String(address)) => address.as_str(),
        Some(other) => {
            return Err(RpcError::InvalidAddress(format!("not a string: {}", other)));
        }
        None => return Err(RpcError::InvalidAddress("missing address argument".to_string())),
    };

    let scripthash = address_to_scripthash(address)?;
    params[0] = Value::String(scripthash);

    Ok((format!("{}{}", SCRIPTHASH_PREFIX, suffix), params))
}
