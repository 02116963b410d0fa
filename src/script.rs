/// Script utilities: extract the set of addresses an output script pays to.
///
/// The `bitcoin` crate's `Address::from_script` knows the P2PKH / P2SH /
/// P2WPKH / P2WSH templates. P2PK and bare multisig carry raw public keys
/// instead of hashes, so those templates are walked byte by byte and
/// rendered as each pubkey's P2PKH address. Anything else (OP_RETURN,
/// nonstandard) yields an empty set and is not indexed in history.

use bitcoin::network::constants::Network;
use bitcoin::util::address::Address;
use bitcoin::util::key::PublicKey;
use bitcoin::Script;

const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

/// All addresses a locking script pays to under the given network.
pub fn extract_addresses(script_bytes: &[u8], network: Network) -> Vec<String> {
    let script = Script::from(script_bytes.to_vec());

    if let Some(addr) = Address::from_script(&script, network) {
        return vec![addr.to_string()];
    }

    if let Some(addr) = p2pk_address(script_bytes, network) {
        return vec![addr];
    }

    bare_multisig_addresses(script_bytes, network)
}

fn pubkey_address(bytes: &[u8], network: Network) -> Option<String> {
    let pubkey = PublicKey::from_slice(bytes).ok()?;
    Some(Address::p2pkh(&pubkey, network).to_string())
}

/// P2PK: one pushed pubkey (33 or 65 bytes) followed by OP_CHECKSIG.
fn p2pk_address(script: &[u8], network: Network) -> Option<String> {
    let key_len = match script.len() {
        35 if script[0] == 33 => 33,
        67 if script[0] == 65 => 65,
        _ => return None,
    };
    if script[script.len() - 1] != OP_CHECKSIG {
        return None;
    }
    pubkey_address(&script[1..1 + key_len], network)
}

/// Bare multisig: OP_M <pubkey>... OP_N OP_CHECKMULTISIG. Pays to every
/// listed pubkey; an unparseable key makes the whole script nonstandard.
fn bare_multisig_addresses(script: &[u8], network: Network) -> Vec<String> {
    if script.len() < 3 || script[script.len() - 1] != OP_CHECKMULTISIG {
        return Vec::new();
    }
    let required = match script[0] {
        op @ OP_1..=OP_16 => (op - OP_1 + 1) as usize,
        _ => return Vec::new(),
    };
    let total = match script[script.len() - 2] {
        op @ OP_1..=OP_16 => (op - OP_1 + 1) as usize,
        _ => return Vec::new(),
    };
    if required > total {
        return Vec::new();
    }

    let mut addresses = Vec::with_capacity(total);
    let mut at = 1;
    let end = script.len() - 2;
    while at < end {
        let key_len = match script[at] {
            33 => 33usize,
            65 => 65usize,
            _ => return Vec::new(),
        };
        if at + 1 + key_len > end {
            return Vec::new();
        }
        match pubkey_address(&script[at + 1..at + 1 + key_len], network) {
            Some(addr) => addresses.push(addr),
            None => return Vec::new(),
        }
        at += 1 + key_len;
    }
    if addresses.len() != total {
        return Vec::new();
    }
    addresses
}
