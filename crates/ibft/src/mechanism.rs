//! Pluggable per-height consensus mechanisms.
//!
//! A fork list picks which mechanism (PoA or PoS) is active over which
//! height range. Hooks run for every in-range mechanism in registration
//! order; the first error aborts the hook point.

use ember_types::{Block, Header, View};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Mechanism hook points. Mirrors the fixed hook set the engine invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    /// Header verification during sync and import.
    VerifyHeaders,
    /// Header post-processing (validator bookkeeping).
    ProcessHeaders,
    /// A finalized block is being inserted.
    InsertBlock,
    /// The proposer is preparing a candidate header.
    CandidateVote,
    /// Accept state entry, for mechanism-specific logging.
    AcceptStateLog,
    /// A proposal is being verified before voting.
    VerifyBlock,
    /// The packer finished and state is about to commit.
    PreStateCommit,
}

/// Errors raised by mechanism hooks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("mechanism hook failed: {0}")]
pub struct MechanismError(pub String);

/// Errors parsing the fork list from engine configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForkError {
    /// Neither `type` nor `types` present.
    #[error("current IBFT type not found")]
    TypeNotFound,
    /// A fork entry failed to parse.
    #[error("malformed IBFT fork entry: {0}")]
    Malformed(String),
}

/// Which mechanism family a fork activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MechanismType {
    /// Static validator set per epoch, no on-chain contract.
    PoA,
    /// Validator set read from a deployed staking contract.
    PoS,
}

/// One entry of the fork sequence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IbftFork {
    /// Mechanism family.
    #[serde(rename = "type")]
    pub mechanism_type: MechanismType,
    /// First height (inclusive) the mechanism is active at.
    #[serde(default)]
    pub from: u64,
    /// Last height (inclusive); `None` means open-ended.
    #[serde(default)]
    pub to: Option<u64>,
    /// PoS only: height the staking contract is deployed at.
    #[serde(default)]
    pub deployment: Option<u64>,
}

/// Parse the fork list out of the consensus engine's JSON parameters.
///
/// Accepts either a single `{"type": "PoA"}` or a `"types"` array of fork
/// entries.
pub fn get_ibft_forks(config: &serde_json::Value) -> Result<Vec<IbftFork>, ForkError> {
    if let Some(single) = config.get("type") {
        let mechanism_type: MechanismType = serde_json::from_value(single.clone())
            .map_err(|e| ForkError::Malformed(e.to_string()))?;
        return Ok(vec![IbftFork {
            mechanism_type,
            from: 0,
            to: None,
            deployment: None,
        }]);
    }
    if let Some(list) = config.get("types") {
        return serde_json::from_value(list.clone())
            .map_err(|e| ForkError::Malformed(e.to_string()));
    }
    Err(ForkError::TypeNotFound)
}

/// Height range and mechanism parameters shared by both variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MechanismParams {
    /// First height (inclusive).
    pub from: u64,
    /// Last height (inclusive); `None` means open-ended.
    pub to: Option<u64>,
}

impl MechanismParams {
    /// Whether `height` falls inside `[from, to]`.
    pub fn is_in_range(&self, height: u64) -> bool {
        self.from <= height && self.to.is_none_or(|to| height <= to)
    }
}

/// The fixed hook set every mechanism exposes. All hooks default to no-ops.
pub trait ConsensusMechanism: Send + Sync {
    /// The mechanism family.
    fn mechanism_type(&self) -> MechanismType;

    /// Height range parameters.
    fn params(&self) -> &MechanismParams;

    /// Whether the mechanism is active at `height`.
    fn is_in_range(&self, height: u64) -> bool {
        self.params().is_in_range(height)
    }

    /// Hook: verify a header during sync or import.
    fn verify_headers(&self, _header: &Header) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Hook: post-process an applied header.
    fn process_headers(&self, _header: &Header) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Hook: a finalized block is inserted.
    fn insert_block(&self, _block: &Block) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Hook: the proposer is assembling a candidate header.
    fn candidate_vote(&self, _header: &mut Header) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Hook: accept state entered.
    fn accept_state_log(&self, _view: &View) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Hook: a proposal is verified before voting.
    fn verify_block(&self, _block: &Block) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Hook: packing finished, state about to commit.
    fn pre_state_commit(&self, _header: &Header) -> Result<(), MechanismError> {
        Ok(())
    }

    /// Whether blocks at `height` carry transactions under this mechanism.
    fn should_write_transactions(&self, _height: u64) -> bool {
        true
    }
}

/// Proof-of-authority: static validator set per epoch.
#[derive(Debug, Clone)]
pub struct PoAMechanism {
    params: MechanismParams,
}

impl PoAMechanism {
    /// New PoA mechanism over a height range.
    pub fn new(params: MechanismParams) -> Self {
        Self { params }
    }
}

impl ConsensusMechanism for PoAMechanism {
    fn mechanism_type(&self) -> MechanismType {
        MechanismType::PoA
    }

    fn params(&self) -> &MechanismParams {
        &self.params
    }
}

/// Proof-of-stake: validator set read from a deployed contract.
#[derive(Debug, Clone)]
pub struct PoSMechanism {
    params: MechanismParams,
    /// Height the staking contract is deployed at.
    pub deployment: u64,
    /// Blocks per validator-rotation epoch.
    pub epoch_size: u64,
}

impl PoSMechanism {
    /// New PoS mechanism over a height range.
    pub fn new(params: MechanismParams, deployment: u64, epoch_size: u64) -> Self {
        Self {
            params,
            deployment,
            epoch_size,
        }
    }
}

impl ConsensusMechanism for PoSMechanism {
    fn mechanism_type(&self) -> MechanismType {
        MechanismType::PoS
    }

    fn params(&self) -> &MechanismParams {
        &self.params
    }

    fn should_write_transactions(&self, height: u64) -> bool {
        // Epoch blocks carry only the validator rotation.
        self.epoch_size == 0 || height % self.epoch_size != 0
    }
}

/// The mechanism sum type the engine holds.
pub enum Mechanism {
    /// Proof-of-authority variant.
    PoA(PoAMechanism),
    /// Proof-of-stake variant.
    PoS(PoSMechanism),
    /// Caller-supplied mechanism (tests).
    Custom(Box<dyn ConsensusMechanism>),
}

impl Mechanism {
    /// Build a mechanism from a parsed fork entry.
    pub fn from_fork(fork: &IbftFork, epoch_size: u64) -> Self {
        let params = MechanismParams {
            from: fork.from,
            to: fork.to,
        };
        match fork.mechanism_type {
            MechanismType::PoA => Mechanism::PoA(PoAMechanism::new(params)),
            MechanismType::PoS => Mechanism::PoS(PoSMechanism::new(
                params,
                fork.deployment.unwrap_or(fork.from),
                epoch_size,
            )),
        }
    }

    fn inner(&self) -> &dyn ConsensusMechanism {
        match self {
            Mechanism::PoA(m) => m,
            Mechanism::PoS(m) => m,
            Mechanism::Custom(m) => m.as_ref(),
        }
    }
}

impl ConsensusMechanism for Mechanism {
    fn mechanism_type(&self) -> MechanismType {
        self.inner().mechanism_type()
    }

    fn params(&self) -> &MechanismParams {
        self.inner().params()
    }

    fn verify_headers(&self, header: &Header) -> Result<(), MechanismError> {
        self.inner().verify_headers(header)
    }

    fn process_headers(&self, header: &Header) -> Result<(), MechanismError> {
        self.inner().process_headers(header)
    }

    fn insert_block(&self, block: &Block) -> Result<(), MechanismError> {
        self.inner().insert_block(block)
    }

    fn candidate_vote(&self, header: &mut Header) -> Result<(), MechanismError> {
        match self {
            Mechanism::PoA(m) => m.candidate_vote(header),
            Mechanism::PoS(m) => m.candidate_vote(header),
            Mechanism::Custom(m) => m.candidate_vote(header),
        }
    }

    fn accept_state_log(&self, view: &View) -> Result<(), MechanismError> {
        self.inner().accept_state_log(view)
    }

    fn verify_block(&self, block: &Block) -> Result<(), MechanismError> {
        self.inner().verify_block(block)
    }

    fn pre_state_commit(&self, header: &Header) -> Result<(), MechanismError> {
        self.inner().pre_state_commit(header)
    }

    fn should_write_transactions(&self, height: u64) -> bool {
        self.inner().should_write_transactions(height)
    }
}

/// Run a hook across every in-range mechanism, aborting on the first error.
pub(crate) fn run_hook<F>(
    mechanisms: &[Mechanism],
    hook: HookType,
    height: u64,
    mut f: F,
) -> Result<(), MechanismError>
where
    F: FnMut(&Mechanism) -> Result<(), MechanismError>,
{
    for mechanism in mechanisms.iter().filter(|m| m.is_in_range(height)) {
        if let Err(e) = f(mechanism) {
            debug!(?hook, height, error = %e, "mechanism hook aborted");
            return Err(e);
        }
    }
    Ok(())
}

/// True iff any in-range mechanism permits writing transactions at `height`.
pub(crate) fn should_write_transactions(
    mechanisms: &[Mechanism],
    height: u64,
) -> bool {
    if mechanisms.is_empty() {
        return true;
    }
    mechanisms
        .iter()
        .filter(|m| m.is_in_range(height))
        .any(|m| m.should_write_transactions(height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn in_range_bounds_are_inclusive() {
        let open = MechanismParams { from: 0, to: None };
        assert!(open.is_in_range(0));
        assert!(open.is_in_range(10));

        let bounded = MechanismParams {
            from: 5,
            to: Some(10),
        };
        assert!(!bounded.is_in_range(0));
        assert!(bounded.is_in_range(5));
        assert!(bounded.is_in_range(10));
        assert!(!bounded.is_in_range(15));
    }

    #[test]
    fn single_type_config_parses() {
        let forks = get_ibft_forks(&json!({ "type": "PoA" })).unwrap();
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].mechanism_type, MechanismType::PoA);
        assert_eq!(forks[0].from, 0);
        assert_eq!(forks[0].to, None);
    }

    #[test]
    fn fork_sequence_parses() {
        let forks = get_ibft_forks(&json!({
            "types": [
                { "type": "PoA", "from": 0, "to": 100 },
                { "type": "PoS", "deployment": 50, "from": 101 },
            ]
        }))
        .unwrap();
        assert_eq!(forks.len(), 2);
        assert_eq!(forks[0].to, Some(100));
        assert_eq!(forks[1].mechanism_type, MechanismType::PoS);
        assert_eq!(forks[1].deployment, Some(50));
        assert_eq!(forks[1].from, 101);
    }

    #[test]
    fn missing_type_is_an_error() {
        assert_eq!(
            get_ibft_forks(&json!({ "foo": "PoA" })),
            Err(ForkError::TypeNotFound)
        );
    }

    struct Scripted {
        params: MechanismParams,
        permits_txs: bool,
    }

    impl ConsensusMechanism for Scripted {
        fn mechanism_type(&self) -> MechanismType {
            MechanismType::PoA
        }

        fn params(&self) -> &MechanismParams {
            &self.params
        }

        fn should_write_transactions(&self, _height: u64) -> bool {
            self.permits_txs
        }
    }

    fn scripted(permits_txs: bool) -> Mechanism {
        Mechanism::Custom(Box::new(Scripted {
            params: MechanismParams { from: 0, to: None },
            permits_txs,
        }))
    }

    #[test]
    fn any_mechanism_permitting_is_enough() {
        assert!(should_write_transactions(
            &[scripted(true), scripted(true)],
            0
        ));
        assert!(!should_write_transactions(
            &[scripted(false), scripted(false)],
            0
        ));
        assert!(should_write_transactions(
            &[scripted(true), scripted(false)],
            0
        ));
    }

    #[test]
    fn pos_epoch_blocks_carry_no_transactions() {
        let pos = PoSMechanism::new(MechanismParams { from: 0, to: None }, 0, 10);
        assert!(pos.should_write_transactions(5));
        assert!(!pos.should_write_transactions(10));
    }

    #[test]
    fn first_hook_error_aborts() {
        struct Failing(MechanismParams);
        impl ConsensusMechanism for Failing {
            fn mechanism_type(&self) -> MechanismType {
                MechanismType::PoA
            }
            fn params(&self) -> &MechanismParams {
                &self.0
            }
            fn verify_block(&self, _block: &Block) -> Result<(), MechanismError> {
                Err(MechanismError("scripted".into()))
            }
        }

        let mechanisms = vec![
            Mechanism::Custom(Box::new(Failing(MechanismParams { from: 0, to: None }))),
            scripted(true),
        ];
        let block = Block::default();
        let result = run_hook(&mechanisms, HookType::VerifyBlock, 0, |m| {
            m.verify_block(&block)
        });
        assert!(result.is_err());
    }
}
