use ethers::core::k256::ecdsa::{
    RecoveryId, Signature as KSig, SigningKey, VerifyingKey,
};
use ethers::core::types::{Signature as EthSig, U256};

/// Converts a bare `r || s` signature into an Ethereum signature with the
/// recovery id as `v` (0 or 1).
///
/// Remote key stores do not report the recovery id, so both candidates are
/// tried against the known public key. High `s` values are normalized
/// first.
pub fn sig_from_digest_bytes_trial_recovery(
    sig: &KSig,
    digest: [u8; 32],
    vk: &VerifyingKey,
) -> Option<EthSig> {
    let sig = sig.normalize_s().unwrap_or(*sig);
    let bytes = sig.to_bytes();

    let r = U256::from_big_endian(&bytes[..32]);
    let s = U256::from_big_endian(&bytes[32..]);

    [0u8, 1].into_iter().find_map(|byte| {
        let recovery_id = RecoveryId::from_byte(byte)?;
        let recovered =
            VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)
                .ok()?;

        (recovered == *vk).then_some(EthSig {
            r,
            s,
            v: byte as u64,
        })
    })
}

/// Turns a recovery id `v` into a plain EIP-191 `v` (27 or 28)
pub fn apply_legacy_v(sig: &mut EthSig) {
    sig.v += 27;
}

/// Turns a recovery id `v` into an EIP-155 `v`
pub fn apply_eip155(sig: &mut EthSig, chain_id: u64) {
    sig.v += 35 + chain_id * 2;
}

pub fn signing_key_from_hex(s: &str) -> eyre::Result<SigningKey> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);

    let key_bytes = hex::decode(s)?;
    let signing_key = SigningKey::from_slice(key_bytes.as_slice())?;

    Ok(signing_key)
}
