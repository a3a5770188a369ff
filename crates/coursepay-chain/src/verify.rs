//! Token & registry verification.
//!
//! The threat model is a tampered database row: an attacker who can edit
//! `payment_tokens` could point purchases at a hostile token or escrow
//! contract.  Before any payment is trusted we therefore confirm, against
//! the immutable on-chain registry, that the row's addresses are the ones
//! the registry knows for that symbol and chain.
//!
//! Runs on every purchase-processing request and is never cached across
//! requests: the tamper can happen between requests.  Fails closed on any
//! RPC error.

use tracing::warn;

use coursepay_shared::Address;

use crate::adapter::EscrowChain;

/// What the verifier needs to know about the token row under scrutiny.
#[derive(Debug, Clone)]
pub struct TokenUnderVerification {
    pub symbol: String,
    pub token_address: Address,
    pub escrow_address: Address,
    pub registry_address: Address,
}

/// Verification policy.
#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    /// blake3 hex digest of the registry contract's deployed bytecode.
    pub expected_registry_code_hash: String,
    /// Only `false` in non-production configuration; skipping the code
    /// hash check is logged loudly.
    pub enforce_code_hash: bool,
}

/// Outcome of a verification attempt.  The reason is logged server-side
/// with full detail; clients only ever see a generic rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Failed { reason: String },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified)
    }

    fn failed(reason: impl Into<String>) -> Self {
        Verification::Failed {
            reason: reason.into(),
        }
    }
}

/// Verify a payment token against the on-chain registry.
pub async fn verify_payment_token(
    chain: &dyn EscrowChain,
    token: &TokenUnderVerification,
    policy: &VerifyPolicy,
) -> Verification {
    // 1. The registry contract itself must be the deployed bytecode we
    //    pinned, or an attacker could swap in a registry that approves
    //    anything.
    if policy.enforce_code_hash {
        let code = match chain.contract_code(&token.registry_address).await {
            Ok(code) => code,
            Err(e) => return Verification::failed(format!("registry code fetch failed: {e}")),
        };
        if code.is_empty() {
            return Verification::failed(format!(
                "no contract deployed at registry address {}",
                token.registry_address
            ));
        }
        let actual = blake3::hash(&code).to_hex().to_string();
        if actual != policy.expected_registry_code_hash.to_lowercase() {
            return Verification::failed(format!(
                "registry bytecode hash mismatch: expected {}, got {actual}",
                policy.expected_registry_code_hash
            ));
        }
    } else {
        warn!(
            registry = %token.registry_address,
            "registry bytecode hash check skipped (non-production configuration)"
        );
    }

    // 2. The registry must vouch for exactly this symbol/token/escrow
    //    triple on this chain.
    match chain
        .verify_token_entry(
            &token.registry_address,
            &token.symbol,
            &token.token_address,
            &token.escrow_address,
        )
        .await
    {
        Ok(true) => Verification::Verified,
        Ok(false) => Verification::failed(format!(
            "registry does not recognize {} at {} / escrow {}",
            token.symbol, token.token_address, token.escrow_address
        )),
        Err(e) => Verification::failed(format!("registry verifyToken call failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChain;
    use coursepay_shared::{Blockchain, ChainKey};

    fn addr(byte: &str) -> Address {
        Address::parse(&format!("0x{}", byte.repeat(20)), Blockchain::Evm).unwrap()
    }

    fn token() -> TokenUnderVerification {
        TokenUnderVerification {
            symbol: "USDC".into(),
            token_address: addr("aa"),
            escrow_address: addr("bb"),
            registry_address: addr("cc"),
        }
    }

    /// Pins the bytecode the mock serves by default.
    fn pinned_policy() -> VerifyPolicy {
        let code = vec![0x60, 0x80, 0x60, 0x40];
        VerifyPolicy {
            expected_registry_code_hash: blake3::hash(&code).to_hex().to_string(),
            enforce_code_hash: true,
        }
    }

    #[tokio::test]
    async fn verifies_matching_token() {
        let chain = MockChain::new(ChainKey::new(Blockchain::Evm, 137));
        let policy = pinned_policy();
        let v = verify_payment_token(&chain, &token(), &policy).await;
        assert!(v.is_verified());
    }

    #[tokio::test]
    async fn fails_closed_on_registry_rejection() {
        let chain = MockChain::new(ChainKey::new(Blockchain::Evm, 137));
        chain.set_registry_verdict(false);
        let policy = pinned_policy();
        let v = verify_payment_token(&chain, &token(), &policy).await;
        assert!(matches!(v, Verification::Failed { reason } if reason.contains("USDC")));
    }

    #[tokio::test]
    async fn fails_on_bytecode_mismatch() {
        let chain = MockChain::new(ChainKey::new(Blockchain::Evm, 137));
        chain.set_contract_code(vec![0xde, 0xad]);
        let policy = pinned_policy();
        let v = verify_payment_token(&chain, &token(), &policy).await;
        assert!(matches!(v, Verification::Failed { reason } if reason.contains("hash mismatch")));
    }

    #[tokio::test]
    async fn fails_on_undeployed_registry() {
        let chain = MockChain::new(ChainKey::new(Blockchain::Evm, 137));
        chain.set_contract_code(Vec::new());
        let policy = pinned_policy();
        let v = verify_payment_token(&chain, &token(), &policy).await;
        assert!(matches!(v, Verification::Failed { reason } if reason.contains("no contract")));
    }

    #[tokio::test]
    async fn skips_code_hash_outside_production() {
        let chain = MockChain::new(ChainKey::new(Blockchain::Evm, 137));
        chain.set_contract_code(vec![0xde, 0xad]); // would fail the pin
        let policy = VerifyPolicy {
            expected_registry_code_hash: "unused".into(),
            enforce_code_hash: false,
        };
        let v = verify_payment_token(&chain, &token(), &policy).await;
        assert!(v.is_verified());
    }
}
