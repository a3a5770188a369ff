//! In-memory [`EscrowChain`] implementation for tests.
//!
//! Behavior is scripted per instance: individual escrows can be made to
//! revert, whole batch calls can be failed, and every call is recorded so
//! tests can assert that no chain call happened on a rejected request.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use coursepay_shared::{Address, ChainKey, EscrowId, TxHash};

use crate::adapter::{
    EscrowChain, EscrowCreateParams, EscrowReceipt, OnChainEscrowState, ReleaseReceipt,
};
use crate::error::{ChainError, Result};

#[derive(Default)]
struct MockState {
    escrows: HashMap<String, OnChainEscrowState>,
    reverting: HashSet<String>,
    fail_create: bool,
    fail_batch: bool,
    registry_verdict: bool,
    has_operator_role: bool,
    contract_code: Vec<u8>,
    calls: Vec<String>,
}

pub struct MockChain {
    key: ChainKey,
    next_escrow: AtomicU64,
    next_tx: AtomicU64,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(key: ChainKey) -> Self {
        Self {
            key,
            next_escrow: AtomicU64::new(1),
            next_tx: AtomicU64::new(1),
            state: Mutex::new(MockState {
                registry_verdict: true,
                has_operator_role: true,
                contract_code: vec![0x60, 0x80, 0x60, 0x40],
                ..Default::default()
            }),
        }
    }

    pub fn fail_create(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    pub fn fail_batch(&self) {
        self.state.lock().unwrap().fail_batch = true;
    }

    /// Make one escrow revert on individual release.
    pub fn revert_escrow(&self, id: &EscrowId) {
        self.state.lock().unwrap().reverting.insert(id.0.clone());
    }

    pub fn set_registry_verdict(&self, verdict: bool) {
        self.state.lock().unwrap().registry_verdict = verdict;
    }

    pub fn set_operator_role(&self, has_role: bool) {
        self.state.lock().unwrap().has_operator_role = has_role;
    }

    pub fn set_contract_code(&self, code: Vec<u8>) {
        self.state.lock().unwrap().contract_code = code;
    }

    /// Seed an escrow directly in a given state (for reconciliation tests).
    pub fn seed_escrow(&self, id: &EscrowId, state: OnChainEscrowState) {
        self.state
            .lock()
            .unwrap()
            .escrows
            .insert(id.0.clone(), state);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn tx_hash(&self) -> TxHash {
        let n = self.next_tx.fetch_add(1, Ordering::Relaxed);
        TxHash::from_trusted(format!("0xmock{n:060x}"))
    }
}

#[async_trait]
impl EscrowChain for MockChain {
    fn key(&self) -> ChainKey {
        self.key
    }

    async fn create_escrow(
        &self,
        _contract: &Address,
        params: &EscrowCreateParams,
    ) -> Result<EscrowReceipt> {
        self.record(format!("create_escrow:{}", params.course_ref));
        if self.state.lock().unwrap().fail_create {
            return Err(ChainError::GasEstimation("simulated revert".into()));
        }
        let id = self.next_escrow.fetch_add(1, Ordering::Relaxed);
        let escrow_id = EscrowId(id.to_string());
        self.state
            .lock()
            .unwrap()
            .escrows
            .insert(escrow_id.0.clone(), OnChainEscrowState::Locked);
        Ok(EscrowReceipt {
            escrow_id,
            tx_hash: self.tx_hash(),
        })
    }

    async fn release_escrow(&self, _contract: &Address, id: &EscrowId) -> Result<ReleaseReceipt> {
        self.record(format!("release_escrow:{id}"));
        let mut state = self.state.lock().unwrap();
        if state.reverting.contains(&id.0) {
            return Err(ChainError::Reverted {
                tx_hash: format!("0xrevert{id}"),
            });
        }
        match state.escrows.get(&id.0) {
            Some(OnChainEscrowState::Locked) => {
                state.escrows.insert(id.0.clone(), OnChainEscrowState::Released);
                drop(state);
                Ok(ReleaseReceipt {
                    tx_hash: self.tx_hash(),
                })
            }
            Some(other) => Err(ChainError::NotReleasable {
                escrow_id: id.to_string(),
                reason: format!("state {other:?}"),
            }),
            None => Err(ChainError::NotReleasable {
                escrow_id: id.to_string(),
                reason: "unknown escrow".into(),
            }),
        }
    }

    async fn refund_escrow(&self, _contract: &Address, id: &EscrowId) -> Result<ReleaseReceipt> {
        self.record(format!("refund_escrow:{id}"));
        let mut state = self.state.lock().unwrap();
        match state.escrows.get(&id.0) {
            Some(OnChainEscrowState::Locked) => {
                state.escrows.insert(id.0.clone(), OnChainEscrowState::Refunded);
                drop(state);
                Ok(ReleaseReceipt {
                    tx_hash: self.tx_hash(),
                })
            }
            _ => Err(ChainError::Reverted {
                tx_hash: format!("0xrefundfail{id}"),
            }),
        }
    }

    async fn batch_release_escrows(
        &self,
        contract: &Address,
        ids: &[EscrowId],
    ) -> Result<ReleaseReceipt> {
        self.record(format!("batch_release:{}", ids.len()));
        let (fail, any_reverting) = {
            let state = self.state.lock().unwrap();
            (
                state.fail_batch,
                ids.iter().any(|id| state.reverting.contains(&id.0)),
            )
        };
        // A batch atomically reverts if any member reverts.
        if fail || any_reverting {
            return Err(ChainError::BatchFailed("simulated batch revert".into()));
        }
        let mut last = None;
        for id in ids {
            last = Some(self.release_escrow(contract, id).await?);
        }
        last.ok_or_else(|| ChainError::BatchFailed("empty batch".into()))
    }

    async fn can_release(&self, _contract: &Address, id: &EscrowId) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(matches!(
            state.escrows.get(&id.0),
            Some(OnChainEscrowState::Locked)
        ))
    }

    async fn escrow_state(&self, _contract: &Address, id: &EscrowId) -> Result<OnChainEscrowState> {
        let state = self.state.lock().unwrap();
        Ok(state
            .escrows
            .get(&id.0)
            .copied()
            .unwrap_or(OnChainEscrowState::Absent))
    }

    async fn contract_code(&self, _addr: &Address) -> Result<Vec<u8>> {
        Ok(self.state.lock().unwrap().contract_code.clone())
    }

    async fn verify_token_entry(
        &self,
        _registry: &Address,
        _symbol: &str,
        _token: &Address,
        _escrow: &Address,
    ) -> Result<bool> {
        self.record("verify_token_entry".into());
        Ok(self.state.lock().unwrap().registry_verdict)
    }

    async fn operator_has_role(&self, _contract: &Address) -> Result<bool> {
        Ok(self.state.lock().unwrap().has_operator_role)
    }
}
