//! Four validators over an in-process gossip hub.
//!
//! Each node owns an isolated chain and pool; only consensus messages are
//! shared. The cluster must finalize blocks whose committed seals carry a
//! quorum of distinct validator signatures.

use ember_ibft::{Ibft, IbftParams, Mechanism, MechanismParams, PoAMechanism};
use ember_node::{GossipHub, InMemoryChain, Node, SimpleExecutor};
use ember_txpool::{PoolConfig, TxPool};
use ember_types::{KeyPair, ValidatorExtra, ValidatorInfo, ValidatorSet};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn four_validators_finalize_sealed_blocks() {
    ember_node::init_tracing();

    let keys: Vec<KeyPair> = (0..4).map(|i| KeyPair::from_seed([i as u8 + 1; 32])).collect();
    let validators = ValidatorSet::new(
        keys.iter()
            .map(|k| ValidatorInfo {
                address: k.address(),
                public_key: k.public_key(),
            })
            .collect(),
    );

    let hub = GossipHub::new();
    let mut engines = Vec::new();
    let mut chains = Vec::new();
    let mut pools = Vec::new();

    for key in &keys {
        let chain = InMemoryChain::new(validators.clone(), &[], 8_000_000, 100_000);
        let pool = Arc::new(TxPool::new(
            PoolConfig::default(),
            Arc::clone(&chain) as _,
            chain.head_header(),
        ));
        let engine = Ibft::new(IbftParams {
            blockchain: Arc::clone(&chain) as _,
            txpool: Arc::clone(&pool) as _,
            executor: Arc::new(SimpleExecutor::new(Arc::clone(&chain))),
            transport: Arc::clone(&hub) as _,
            syncer: None,
            validator_key: key.clone(),
            epoch_size: 100_000,
            block_time: Duration::from_secs(1),
            sealing: true,
            mechanisms: vec![Mechanism::PoA(PoAMechanism::new(MechanismParams {
                from: 0,
                to: None,
            }))],
        });
        hub.join(engine.message_queue());
        chains.push(chain);
        pools.push(pool);
        engines.push(engine);
    }

    let nodes: Vec<Node> = engines
        .into_iter()
        .zip(pools.iter())
        .map(|(engine, pool)| Node::start(engine, Arc::clone(pool)).unwrap())
        .collect();

    // Wait for every chain to finalize at least two blocks.
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if chains.iter().all(|c| c.head_number() >= 2) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let reached = chains.iter().all(|c| c.head_number() >= 2);

    for node in nodes {
        assert!(
            node.shutdown(Duration::from_secs(5)),
            "consensus thread failed to stop in time"
        );
    }
    assert!(reached, "cluster failed to finalize two blocks in time");

    // Finalized headers carry a commit quorum of distinct validators, all
    // over the block's hash.
    let block = chains[0].get_block(1).unwrap();
    let extra = ValidatorExtra::decode(&block.header.extra_data).unwrap();
    assert!(
        extra.committed_seals.len() >= validators.quorum_size(),
        "finalized block is missing a seal quorum"
    );

    let mut signers = HashSet::new();
    for seal in &extra.committed_seals {
        assert!(signers.insert(seal.signer), "duplicate committed seal");
        let public_key = validators.public_key(&seal.signer).expect("unknown sealer");
        assert!(seal.verify(&block.header.hash, public_key));
    }

    // All nodes agree on block 1.
    for chain in &chains[1..] {
        assert_eq!(chain.get_block(1).unwrap().header.hash, block.header.hash);
    }
}
