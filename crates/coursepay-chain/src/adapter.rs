//! Escrow chain adapter.
//!
//! [`EscrowChain`] is the seam between the settlement pipeline and a
//! concrete chain: four escrow operations plus the state reads the
//! verifier and reconciliation job need.  The orchestrator and scheduler
//! only ever see the trait, so tests substitute a mock adapter.
//!
//! [`EvmEscrowChain`] talks to an EVM JSON-RPC endpoint whose node
//! manages the operator account.  Connection material (HTTP client,
//! operator address) is built once per `(blockchain, chain_id)` by the
//! registry and reused for every call.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use coursepay_shared::constants::GAS_BUFFER_PERCENT;
use coursepay_shared::{Address, ChainKey, EscrowId, TokenAmount, TxHash};

use crate::error::{ChainError, Result};
use crate::rpc::{parse_hex_quantity, to_hex_quantity, JsonRpcClient};

// Function selectors, precomputed from the escrow/registry contract ABIs.
const SEL_CREATE_ESCROW: &str = "0x8f1e9405"; // createEscrow(address,address,uint256,bytes32,uint256,uint256)
const SEL_RELEASE_ESCROW: &str = "0x6b2fafa9"; // releaseEscrow(uint256)
const SEL_REFUND_ESCROW: &str = "0x2c3a45f1"; // refundEscrow(uint256)
const SEL_BATCH_RELEASE: &str = "0xd5b2a01e"; // batchReleaseEscrows(uint256[])
const SEL_CAN_RELEASE: &str = "0x9d78c3b2"; // canRelease(uint256)
const SEL_GET_ESCROW_STATE: &str = "0x41c64e52"; // escrowState(uint256)
const SEL_VERIFY_TOKEN: &str = "0xa67d2f83"; // verifyToken(string,address,address,uint256)
const SEL_HAS_ROLE: &str = "0x91d14854"; // hasRole(bytes32,address)

/// keccak256("OPERATOR_ROLE"), pinned from the escrow contract.
const OPERATOR_ROLE: &str = "97667070c54ef182b0f5858b034beac1b6f3089aa2d3188bb1e8929f4fa9b929";

/// Everything `create_escrow` needs to lock funds.
#[derive(Debug, Clone)]
pub struct EscrowCreateParams {
    pub buyer: Address,
    pub instructor: Address,
    pub amount: TokenAmount,
    /// Course reference, carried on-chain as a 32-byte digest.
    pub course_ref: String,
    pub escrow_period_days: i64,
    pub platform_fee_bps: u16,
}

/// Result of a successful escrow creation.
#[derive(Debug, Clone)]
pub struct EscrowReceipt {
    pub escrow_id: EscrowId,
    pub tx_hash: TxHash,
}

/// Result of a release/refund submission.
#[derive(Debug, Clone)]
pub struct ReleaseReceipt {
    pub tx_hash: TxHash,
}

/// Escrow state as the contract reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnChainEscrowState {
    /// The contract has no entry for this id.
    Absent,
    Locked,
    Released,
    Refunded,
}

/// The narrow contract every chain backend implements.
#[async_trait]
pub trait EscrowChain: Send + Sync {
    fn key(&self) -> ChainKey;

    /// Lock funds in escrow.  Gas is estimated and padded before
    /// submission; failure carries enough detail for the caller to mark
    /// the purchase `failed` without losing the buyer's approval hash.
    async fn create_escrow(
        &self,
        contract: &Address,
        params: &EscrowCreateParams,
    ) -> Result<EscrowReceipt>;

    /// Release a single escrow to the instructor.  Pre-checks the
    /// contract's own release predicate rather than submitting a doomed
    /// transaction.
    async fn release_escrow(&self, contract: &Address, id: &EscrowId) -> Result<ReleaseReceipt>;

    /// Return escrowed funds to the buyer.
    async fn refund_escrow(&self, contract: &Address, id: &EscrowId) -> Result<ReleaseReceipt>;

    /// Release several escrows in one transaction.  On failure the caller
    /// must fall back to per-item [`release_escrow`] calls.
    async fn batch_release_escrows(
        &self,
        contract: &Address,
        ids: &[EscrowId],
    ) -> Result<ReleaseReceipt>;

    /// The contract's "can release" predicate for one escrow.
    async fn can_release(&self, contract: &Address, id: &EscrowId) -> Result<bool>;

    /// Current contract-side state of an escrow.
    async fn escrow_state(&self, contract: &Address, id: &EscrowId) -> Result<OnChainEscrowState>;

    /// Deployed bytecode at an address (empty if nothing is deployed).
    async fn contract_code(&self, addr: &Address) -> Result<Vec<u8>>;

    /// Ask the registry contract whether this symbol/token/escrow triple
    /// is the trusted one for this chain.
    async fn verify_token_entry(
        &self,
        registry: &Address,
        symbol: &str,
        token: &Address,
        escrow: &Address,
    ) -> Result<bool>;

    /// Whether the operator wallet holds the escrow contract's
    /// OPERATOR_ROLE.
    async fn operator_has_role(&self, contract: &Address) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// ABI call-data helpers
// ---------------------------------------------------------------------------

fn word_u128(n: u128) -> String {
    format!("{n:064x}")
}

fn word_address(addr: &Address) -> String {
    let hex_part = addr.as_str().trim_start_matches("0x").to_lowercase();
    format!("{hex_part:0>64}")
}

fn word_bytes32(hex64: &str) -> String {
    format!("{:0<64}", hex64.to_lowercase())
}

/// 32-byte digest of an off-chain reference string.
fn reference_digest(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().to_string()
}

/// ABI-encode a dynamic `string` tail: length word plus right-padded data.
fn string_tail(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = word_u128(bytes.len() as u128);
    let mut data = hex::encode(bytes);
    let rem = data.len() % 64;
    if rem != 0 {
        data.push_str(&"0".repeat(64 - rem));
    }
    out.push_str(&data);
    out
}

// ---------------------------------------------------------------------------
// EVM adapter
// ---------------------------------------------------------------------------

/// How long to poll for a transaction receipt before declaring the
/// submission ambiguous (reconciliation picks it up from there).
const RECEIPT_WAIT: Duration = Duration::from_secs(90);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct TxReceipt {
    status: String,
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    #[serde(default)]
    logs: Vec<LogEntry>,
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    #[serde(default)]
    data: String,
}

/// JSON-RPC escrow adapter for one EVM chain.
pub struct EvmEscrowChain {
    key: ChainKey,
    rpc: JsonRpcClient,
    /// Node-managed operator account used as `from` for every write.
    operator: Address,
}

impl EvmEscrowChain {
    pub fn new(key: ChainKey, rpc_url: String, operator: Address) -> Self {
        Self {
            key,
            rpc: JsonRpcClient::new(rpc_url),
            operator,
        }
    }

    /// `eth_call` a view function and return the raw hex word(s).
    async fn view_call(&self, to: &Address, data: String) -> Result<String> {
        self.rpc
            .call(
                "eth_call",
                json!([{ "to": to.as_str(), "data": data }, "latest"]),
            )
            .await
    }

    /// Estimate gas, pad by the configured buffer, submit, and wait for
    /// the receipt.
    async fn submit(&self, to: &Address, data: String) -> Result<TxReceipt> {
        let tx = json!({
            "from": self.operator.as_str(),
            "to": to.as_str(),
            "data": data,
        });

        let estimate_hex: String = self
            .rpc
            .call("eth_estimateGas", json!([tx]))
            .await
            .map_err(|e| ChainError::GasEstimation(e.to_string()))?;
        let estimate = parse_hex_quantity(&estimate_hex)?;
        // Under-estimated gas is a common chain failure mode.
        let gas = estimate + estimate * GAS_BUFFER_PERCENT as u128 / 100;

        debug!(chain = %self.key, estimate, gas, "submitting transaction");

        let tx = json!({
            "from": self.operator.as_str(),
            "to": to.as_str(),
            "data": data,
            "gas": to_hex_quantity(gas),
        });
        let tx_hash: String = self.rpc.call("eth_sendTransaction", json!([tx])).await?;

        self.wait_for_receipt(&tx_hash).await
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<TxReceipt> {
        let deadline = tokio::time::Instant::now() + RECEIPT_WAIT;
        loop {
            let receipt: Option<TxReceipt> = self
                .rpc
                .call("eth_getTransactionReceipt", json!([tx_hash]))
                .await?;

            if let Some(receipt) = receipt {
                if receipt.status == "0x1" {
                    return Ok(receipt);
                }
                return Err(ChainError::Reverted {
                    tx_hash: receipt.transaction_hash,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(tx_hash, chain = %self.key, "receipt wait timed out; transaction is ambiguous");
                return Err(ChainError::Timeout(RECEIPT_WAIT.as_secs()));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    fn escrow_id_word(id: &EscrowId) -> Result<String> {
        let n: u128 = id
            .as_str()
            .parse()
            .map_err(|_| ChainError::InvalidResponse(format!("bad evm escrow id: {id}")))?;
        Ok(word_u128(n))
    }
}

#[async_trait]
impl EscrowChain for EvmEscrowChain {
    fn key(&self) -> ChainKey {
        self.key
    }

    async fn create_escrow(
        &self,
        contract: &Address,
        params: &EscrowCreateParams,
    ) -> Result<EscrowReceipt> {
        let mut data = SEL_CREATE_ESCROW.to_string();
        data.push_str(&word_address(&params.buyer));
        data.push_str(&word_address(&params.instructor));
        data.push_str(&word_u128(params.amount.base_units()));
        data.push_str(&word_bytes32(&reference_digest(&params.course_ref)));
        data.push_str(&word_u128(params.escrow_period_days.max(0) as u128));
        data.push_str(&word_u128(params.platform_fee_bps as u128));

        let receipt = self.submit(contract, data).await?;

        // The EscrowCreated event carries the new escrow id as the first
        // data word.
        let id_word = receipt
            .logs
            .first()
            .map(|log| log.data.as_str())
            .filter(|d| d.len() >= 66)
            .ok_or_else(|| {
                ChainError::InvalidResponse("create receipt missing EscrowCreated log".into())
            })?;
        let escrow_id = u128::from_str_radix(&id_word[2..66], 16)
            .map_err(|e| ChainError::InvalidResponse(format!("bad escrow id word: {e}")))?;

        info!(
            chain = %self.key,
            escrow_id,
            tx_hash = %receipt.transaction_hash,
            "escrow created"
        );

        Ok(EscrowReceipt {
            escrow_id: EscrowId(escrow_id.to_string()),
            tx_hash: TxHash::from_trusted(receipt.transaction_hash),
        })
    }

    async fn release_escrow(&self, contract: &Address, id: &EscrowId) -> Result<ReleaseReceipt> {
        if !self.can_release(contract, id).await? {
            return Err(ChainError::NotReleasable {
                escrow_id: id.to_string(),
                reason: "contract release predicate returned false".into(),
            });
        }

        let mut data = SEL_RELEASE_ESCROW.to_string();
        data.push_str(&Self::escrow_id_word(id)?);
        let receipt = self.submit(contract, data).await?;

        info!(chain = %self.key, escrow = %id, tx_hash = %receipt.transaction_hash, "escrow released");
        Ok(ReleaseReceipt {
            tx_hash: TxHash::from_trusted(receipt.transaction_hash),
        })
    }

    async fn refund_escrow(&self, contract: &Address, id: &EscrowId) -> Result<ReleaseReceipt> {
        let mut data = SEL_REFUND_ESCROW.to_string();
        data.push_str(&Self::escrow_id_word(id)?);
        let receipt = self.submit(contract, data).await?;

        info!(chain = %self.key, escrow = %id, tx_hash = %receipt.transaction_hash, "escrow refunded");
        Ok(ReleaseReceipt {
            tx_hash: TxHash::from_trusted(receipt.transaction_hash),
        })
    }

    async fn batch_release_escrows(
        &self,
        contract: &Address,
        ids: &[EscrowId],
    ) -> Result<ReleaseReceipt> {
        if ids.is_empty() {
            return Err(ChainError::BatchFailed("empty batch".into()));
        }

        // uint256[]: head offset word, then length, then items.
        let mut data = SEL_BATCH_RELEASE.to_string();
        data.push_str(&word_u128(0x20));
        data.push_str(&word_u128(ids.len() as u128));
        for id in ids {
            data.push_str(&Self::escrow_id_word(id)?);
        }

        let receipt = self
            .submit(contract, data)
            .await
            .map_err(|e| ChainError::BatchFailed(e.to_string()))?;

        info!(
            chain = %self.key,
            count = ids.len(),
            tx_hash = %receipt.transaction_hash,
            "batch release submitted"
        );
        Ok(ReleaseReceipt {
            tx_hash: TxHash::from_trusted(receipt.transaction_hash),
        })
    }

    async fn can_release(&self, contract: &Address, id: &EscrowId) -> Result<bool> {
        let mut data = SEL_CAN_RELEASE.to_string();
        data.push_str(&Self::escrow_id_word(id)?);
        let word = self.view_call(contract, data).await?;
        Ok(parse_hex_quantity(&word)? != 0)
    }

    async fn escrow_state(&self, contract: &Address, id: &EscrowId) -> Result<OnChainEscrowState> {
        let mut data = SEL_GET_ESCROW_STATE.to_string();
        data.push_str(&Self::escrow_id_word(id)?);
        let word = self.view_call(contract, data).await?;
        match parse_hex_quantity(&word)? {
            0 => Ok(OnChainEscrowState::Absent),
            1 => Ok(OnChainEscrowState::Locked),
            2 => Ok(OnChainEscrowState::Released),
            3 => Ok(OnChainEscrowState::Refunded),
            other => Err(ChainError::InvalidResponse(format!(
                "unknown escrow state {other}"
            ))),
        }
    }

    async fn contract_code(&self, addr: &Address) -> Result<Vec<u8>> {
        let code_hex: String = self
            .rpc
            .call("eth_getCode", json!([addr.as_str(), "latest"]))
            .await?;
        let stripped = code_hex.trim_start_matches("0x");
        hex::decode(stripped).map_err(|e| ChainError::InvalidResponse(e.to_string()))
    }

    async fn verify_token_entry(
        &self,
        registry: &Address,
        symbol: &str,
        token: &Address,
        escrow: &Address,
    ) -> Result<bool> {
        // verifyToken(string,address,address,uint256): the string head is
        // an offset to the tail after the four head words.
        let mut data = SEL_VERIFY_TOKEN.to_string();
        data.push_str(&word_u128(0x80));
        data.push_str(&word_address(token));
        data.push_str(&word_address(escrow));
        data.push_str(&word_u128(self.key.chain_id as u128));
        data.push_str(&string_tail(symbol));

        let word = self.view_call(registry, data).await?;
        Ok(parse_hex_quantity(&word)? != 0)
    }

    async fn operator_has_role(&self, contract: &Address) -> Result<bool> {
        let mut data = SEL_HAS_ROLE.to_string();
        data.push_str(&word_bytes32(OPERATOR_ROLE));
        data.push_str(&word_address(&self.operator));
        let word = self.view_call(contract, data).await?;
        Ok(parse_hex_quantity(&word)? != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursepay_shared::Blockchain;

    #[test]
    fn abi_words() {
        assert_eq!(word_u128(1).len(), 64);
        assert!(word_u128(0x20).ends_with("20"));

        let addr = Address::parse(&format!("0x{}", "ab".repeat(20)), Blockchain::Evm).unwrap();
        let w = word_address(&addr);
        assert_eq!(w.len(), 64);
        assert!(w.starts_with("000000000000000000000000"));
    }

    #[test]
    fn string_tail_pads_to_word_boundary() {
        let tail = string_tail("USDC");
        // length word + one padded data word
        assert_eq!(tail.len(), 128);
        assert!(tail.starts_with(&word_u128(4)));
    }

    #[test]
    fn reference_digest_is_stable() {
        let a = reference_digest("course-42");
        assert_eq!(a.len(), 64);
        assert_eq!(a, reference_digest("course-42"));
        assert_ne!(a, reference_digest("course-43"));
    }
}
