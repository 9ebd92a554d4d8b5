use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use canopy_chain::ChainError;
use canopy_chain::ChainParams;
use canopy_chain::HeaderRecord;
use canopy_chain::HeadersRepository;
use canopy_chain::Network;
use canopy_common::assert_ok;
use tokio::sync::RwLock;

use super::utils::assert_linked;
use super::utils::connected_pool;
use super::utils::engine_with;
use super::utils::header_without_work;
use super::utils::mine_chain;
use super::utils::regtest_chain;
use super::utils::test_config;
use super::utils::MockNetwork;
use crate::address_man::PeerState;
use crate::address_man::Protocol;
use crate::headers_reactor::BatchOutcome;
use crate::headers_reactor::RoundOutcome;
use crate::headers_reactor::SyncState;
use crate::pool::ConnectionPool;
use crate::transport::DefaultVersionFilter;
use crate::WireError;

fn regtest() -> ChainParams {
    ChainParams::from(Network::Regtest)
}

#[tokio::test]
async fn test_catch_up_from_genesis() {
    let chain = regtest_chain(100);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let (engine, store) = engine_with(pool, regtest()).await;

    assert_eq!(engine.sync_state(), SyncState::Initial);
    let outcome = engine.sync_round().await.unwrap();

    assert_eq!(outcome, RoundOutcome::Synced(100));
    assert!(engine.is_synced());
    let tip = store.get_best_header().unwrap().unwrap();
    assert_eq!(tip.block_hash, chain[100].block_hash());
    assert_linked(store.as_ref());
}

#[tokio::test]
async fn test_catch_up_in_chunks() {
    let chain = regtest_chain(45);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let config = crate::SyncConfig {
        chunk_size: 10,
        ..test_config()
    };
    let pool = connected_pool(&network, config).await;
    let (engine, store) = engine_with(pool, regtest()).await;

    assert_eq!(engine.sync_round().await.unwrap(), RoundOutcome::Synced(45));
    assert_eq!(store.get_best_header().unwrap().unwrap().height, 45);
    assert_linked(store.as_ref());
}

#[tokio::test]
async fn test_happy_path_extension() {
    let mut chain = regtest_chain(100);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let connection = pool.established()[0].id();
    let (engine, store) = engine_with(pool, regtest()).await;
    engine.sync_round().await.unwrap();

    let mut best_headers = engine.subscribe_best_headers();
    let next = mine_chain(&chain[100], 100, 1, 0)[0];
    chain.push(next);

    let outcome = engine.on_headers(connection, &[next]).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Extended(1));

    let tip = store.get_best_header().unwrap().unwrap();
    assert_eq!(tip.height, 101);
    assert_eq!(tip.block_hash, next.block_hash());

    // Fires once, with the new header
    let announced = best_headers.try_recv().unwrap();
    assert_eq!(announced, HeaderRecord::from_header(&next, 101));
    assert!(best_headers.try_recv().is_none());
    assert_linked(store.as_ref());
}

#[tokio::test]
async fn test_new_tip_extends_chain() {
    let chain = regtest_chain(100);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let connection = pool.established()[0].id();
    let (engine, store) = engine_with(pool, regtest()).await;
    engine.sync_round().await.unwrap();

    let mut best_headers = engine.subscribe_best_headers();
    let next = mine_chain(&chain[100], 100, 1, 0)[0];
    assert_ok!(engine.on_new_header(connection, &next, 101).await);

    assert_eq!(store.get_best_header().unwrap().unwrap().height, 101);
    assert_eq!(best_headers.try_recv().unwrap().block_hash, next.block_hash());
    assert!(best_headers.try_recv().is_none());
    assert_eq!(engine.network_height().await, 101);
}

#[tokio::test]
async fn test_stale_duplicate_header() {
    let chain = regtest_chain(100);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let connection = pool.established()[0].id();
    let (engine, store) = engine_with(pool, regtest()).await;
    engine.sync_round().await.unwrap();

    let mut best_headers = engine.subscribe_best_headers();

    let outcome = engine.on_headers(connection, &[chain[100]]).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Duplicate);
    assert_ok!(engine.on_new_header(connection, &chain[100], 100).await);

    assert!(best_headers.try_recv().is_none());
    assert_eq!(engine.sync_state(), SyncState::Synced);
    let tip = store.get_best_header().unwrap().unwrap();
    assert_eq!(tip.height, 100);
    assert_eq!(tip.block_hash, chain[100].block_hash());
}

#[tokio::test]
async fn test_unrelated_headers_are_ignored() {
    let chain = regtest_chain(20);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let connection = pool.established()[0].id();
    let (engine, store) = engine_with(pool.clone(), regtest()).await;
    engine.sync_round().await.unwrap();

    // Builds on a header far below our window
    let unrelated = mine_chain(&chain[3], 3, 2, 7);
    let outcome = engine.on_headers(connection, &unrelated).await.unwrap();

    assert_eq!(outcome, BatchOutcome::Ignored);
    assert_eq!(store.get_best_header().unwrap().unwrap().height, 20);
    assert!(pool.get_connection(connection).is_some());
}

#[tokio::test]
async fn test_reorg_rolls_back_and_resyncs() {
    let chain = regtest_chain(2020);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let connection = pool.established()[0].id();
    let (engine, store) = engine_with(pool, regtest()).await;

    assert_eq!(engine.sync_round().await.unwrap(), RoundOutcome::Synced(2020));
    let stale = chain[2020].block_hash();

    // The network moves to another header at 2020
    let mut fork = chain[..2020].to_vec();
    fork.extend(mine_chain(&chain[2019], 2019, 1, 1));
    assert_ne!(fork[2020].block_hash(), stale);
    network.set_chain(fork.clone());

    assert_ok!(engine.on_new_header(connection, &fork[2020], 2020).await);
    assert_eq!(engine.sync_state(), SyncState::Recovering);
    // Rolled back by the safety margin
    assert_eq!(store.get_best_header().unwrap().unwrap().height, 2010);

    assert_eq!(engine.sync_round().await.unwrap(), RoundOutcome::Synced(2020));
    assert!(engine.is_synced());
    let tip = store.get_best_header().unwrap().unwrap();
    assert_eq!(tip.block_hash, fork[2020].block_hash());
    assert_linked(store.as_ref());
}

#[tokio::test]
async fn test_sync_round_detects_stale_branch() {
    let chain = regtest_chain(30);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let (engine, store) = engine_with(pool, regtest()).await;
    engine.sync_round().await.unwrap();

    // A longer branch forking off at 27, inside our window
    let mut fork = chain[..=27].to_vec();
    fork.extend(mine_chain(&chain[27], 27, 5, 3));
    network.set_chain(fork.clone());

    assert_eq!(engine.sync_round().await.unwrap(), RoundOutcome::Synced(32));
    let tip = store.get_best_header().unwrap().unwrap();
    assert_eq!(tip.block_hash, fork[32].block_hash());
    assert_eq!(
        store.get_header_at_height(28).unwrap().unwrap().block_hash,
        fork[28].block_hash()
    );
    assert_linked(store.as_ref());
}

#[tokio::test]
async fn test_recovery_is_bounded() {
    let chain = regtest_chain(20);
    let network = Arc::new(MockNetwork::with_chain(2, chain));
    let config = crate::SyncConfig {
        max_recovery_attempts: 2,
        ..test_config()
    };
    let pool = connected_pool(&network, config).await;
    let (engine, _store) = engine_with(pool, regtest()).await;

    assert_ok!(engine.recover().await);
    assert_ok!(engine.recover().await);
    assert!(matches!(
        engine.recover().await,
        Err(WireError::RetryExhausted { attempts: 2 })
    ));
    // The counter starts over after giving up
    assert_ok!(engine.recover().await);
}

#[tokio::test]
async fn test_checkpoint_mismatch_is_rejected() {
    let chain = regtest_chain(100);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;

    let mut params = regtest();
    let expected = BlockHash::all_zeros();
    params.checkpoints.insert(50, expected);
    let (engine, store) = engine_with(pool.clone(), params).await;

    let result = engine.sync_round().await;
    match result {
        Err(WireError::Chain(ChainError::NetworkHeadersInconsistency {
            height,
            expected: checkpoint,
            found,
        })) => {
            assert_eq!(height, 50);
            assert_eq!(checkpoint, expected);
            assert_eq!(found, chain[50].block_hash());
        }
        other => panic!("expected a checkpoint mismatch, got {other:?}"),
    }

    // Nothing from that batch was saved, and the peer that sent it is banned
    assert_eq!(store.get_best_header().unwrap().unwrap().height, 0);
    assert_eq!(pool.established_count(), 1);
    let banned = network
        .descriptors()
        .iter()
        .filter(|peer| matches!(pool.peer_state(peer), Some(PeerState::Banned(_))))
        .count();
    assert_eq!(banned, 1);
}

#[tokio::test]
async fn test_invalid_pow_bans_peer() {
    let chain = regtest_chain(10);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let connection = pool.established()[0].id();
    let (engine, store) = engine_with(pool.clone(), regtest()).await;
    engine.sync_round().await.unwrap();

    let bad = header_without_work(&chain[10]);
    let result = engine.on_headers(connection, &[bad]).await;

    assert!(matches!(
        result,
        Err(WireError::Chain(ChainError::InvalidPow(_)))
    ));
    assert_eq!(store.get_best_header().unwrap().unwrap().height, 10);
    assert!(pool.get_connection(connection).is_none());
}

#[tokio::test]
async fn test_broken_link_in_batch() {
    let chain = regtest_chain(10);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let connection = pool.established()[0].id();
    let (engine, store) = engine_with(pool.clone(), regtest()).await;
    engine.sync_round().await.unwrap();

    let first = mine_chain(&chain[10], 10, 1, 0)[0];
    let unrelated = mine_chain(&chain[5], 5, 1, 9)[0];
    let result = engine.on_headers(connection, &[first, unrelated]).await;

    assert!(matches!(
        result,
        Err(WireError::Chain(ChainError::ChainBroken { height: 12 }))
    ));
    assert_eq!(store.get_best_header().unwrap().unwrap().height, 10);
}

#[tokio::test]
async fn test_linkage_after_many_extensions() {
    let mut chain = regtest_chain(10);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let connection = pool.established()[0].id();
    let (engine, store) = engine_with(pool, regtest()).await;
    engine.sync_round().await.unwrap();

    for round in 0..5_u32 {
        let height = chain.len() as u32 - 1;
        let batch = mine_chain(&chain[height as usize], height, round + 1, 0);
        chain.extend(batch.iter().copied());

        let outcome = engine.on_headers(connection, &batch).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Extended(round + 1));
    }

    assert_eq!(
        store.get_best_header().unwrap().unwrap().height,
        chain.len() as u32 - 1
    );
    assert_linked(store.as_ref());
}

#[tokio::test]
async fn test_peer_starvation() {
    let network = Arc::new(MockNetwork::new(0));
    let config = test_config();
    let pool = Arc::new(ConnectionPool::new(
        config,
        network,
        Arc::new(DefaultVersionFilter),
    ));
    let (engine, _store) = engine_with(pool, regtest()).await;

    assert_eq!(
        engine.sync_round().await.unwrap(),
        RoundOutcome::PeersNotReady
    );

    // The main loop keeps waiting for peers, and stops when asked to
    let kill_signal = Arc::new(RwLock::new(false));
    let handle = tokio::spawn(engine.clone().run(kill_signal.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    *kill_signal.write().await = true;
    let stopped = tokio::time::timeout(Duration::from_secs(1), handle).await;
    assert!(stopped.is_ok());
    assert_eq!(engine.sync_state(), SyncState::Initial);
}

#[tokio::test]
async fn test_events_reach_the_engine() {
    let chain = regtest_chain(10);
    let network = Arc::new(MockNetwork::with_chain(2, chain.clone()));
    let pool = connected_pool(&network, test_config()).await;
    let (engine, store) = engine_with(pool.clone(), regtest()).await;
    engine.sync_round().await.unwrap();

    pool.spawn_signal_handler().unwrap();
    let kill_signal = Arc::new(RwLock::new(false));
    let handle = tokio::spawn(engine.clone().run(kill_signal.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A server pushes a new tip
    let next = mine_chain(&chain[10], 10, 1, 0)[0];
    network.peer(0).push_event(crate::transport::TransportEvent::NewTip {
        header: next,
        height: 11,
    });

    let mut height = 0;
    for _ in 0..100 {
        height = store.get_best_header().unwrap().unwrap().height;
        if height == 11 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(height, 11);

    *kill_signal.write().await = true;
    let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
}

/// Two peers on `chain`, speaking `protocol`, and an engine synced with them
async fn synced_engine(
    chain: &[bitcoin::block::Header],
    protocol: Protocol,
    config: crate::SyncConfig,
) -> (
    Arc<MockNetwork>,
    Arc<ConnectionPool>,
    Arc<crate::headers_reactor::ChainSyncEngine>,
    Arc<canopy_chain::MemoryHeadersStore>,
) {
    let network = Arc::new(MockNetwork::with_chain(2, chain.to_vec()));
    network.peer(0).set_protocol(protocol);
    network.peer(1).set_protocol(protocol);
    let pool = connected_pool(&network, config).await;
    let (engine, store) = engine_with(pool.clone(), regtest()).await;

    let tip = chain.len() as u32 - 1;
    assert_eq!(engine.sync_round().await.unwrap(), RoundOutcome::Synced(tip));
    (network, pool, engine, store)
}

fn banned_peers(network: &MockNetwork, pool: &ConnectionPool) -> usize {
    network
        .descriptors()
        .iter()
        .filter(|peer| matches!(pool.peer_state(peer), Some(PeerState::Banned(_))))
        .count()
}

#[tokio::test]
async fn test_lagging_peers_keep_our_tip() {
    for protocol in [Protocol::P2p, Protocol::Electrum] {
        let chain = regtest_chain(30);
        let (network, pool, engine, store) =
            synced_engine(&chain, protocol, test_config()).await;

        // Both peers fall behind us, as a node still syncing would
        network.set_chain(chain[..=24].to_vec());

        assert_eq!(engine.sync_round().await.unwrap(), RoundOutcome::Synced(30));
        let tip = store.get_best_header().unwrap().unwrap();
        assert_eq!(tip.height, 30, "{protocol:?}");
        assert_eq!(tip.block_hash, chain[30].block_hash());
        assert_eq!(engine.sync_state(), SyncState::Synced);
        assert_eq!(pool.established_count(), 2);
        assert_eq!(banned_peers(&network, &pool), 0);
        assert_linked(store.as_ref());
    }
}

#[tokio::test]
async fn test_branch_without_more_work_is_ignored() {
    for protocol in [Protocol::P2p, Protocol::Electrum] {
        let chain = regtest_chain(30);
        let (network, pool, engine, store) =
            synced_engine(&chain, protocol, test_config()).await;

        // Same height as ours, forking at 27
        let mut fork = chain[..=27].to_vec();
        fork.extend(mine_chain(&chain[27], 27, 3, 5));
        network.set_chain(fork.clone());

        assert_eq!(engine.sync_round().await.unwrap(), RoundOutcome::Synced(30));
        assert_eq!(
            store.get_best_header().unwrap().unwrap().block_hash,
            chain[30].block_hash()
        );

        // Pushed to us, it changes nothing either
        let connection = pool.established()[0].id();
        let outcome = engine.on_headers(connection, &fork[28..]).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Ignored);

        let shorter = mine_chain(&chain[27], 27, 1, 6);
        let outcome = engine.on_headers(connection, &shorter).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Ignored);

        let tip = store.get_best_header().unwrap().unwrap();
        assert_eq!(tip.height, 30);
        assert_eq!(tip.block_hash, chain[30].block_hash());
        assert_eq!(pool.established_count(), 2);
        assert_linked(store.as_ref());
    }
}

#[tokio::test]
async fn test_pushed_branch_with_more_work_replaces_ours() {
    let chain = regtest_chain(30);
    let (_network, pool, engine, store) =
        synced_engine(&chain, Protocol::Electrum, test_config()).await;
    let mut best_headers = engine.subscribe_best_headers();

    let branch = mine_chain(&chain[27], 27, 5, 3);
    let connection = pool.established()[0].id();
    let outcome = engine.on_headers(connection, &branch).await.unwrap();

    assert_eq!(outcome, BatchOutcome::Reorganized(5));
    let tip = store.get_best_header().unwrap().unwrap();
    assert_eq!(tip.height, 32);
    assert_eq!(tip.block_hash, branch[4].block_hash());
    assert_eq!(best_headers.try_recv().unwrap(), tip);
    assert_linked(store.as_ref());
}

#[tokio::test]
async fn test_follows_fork_below_the_window() {
    for protocol in [Protocol::P2p, Protocol::Electrum] {
        let chain = regtest_chain(30);
        let (network, _pool, engine, store) =
            synced_engine(&chain, protocol, test_config()).await;

        // Forks at 20, ten headers below our tip and under our window
        let mut fork = chain[..=20].to_vec();
        fork.extend(mine_chain(&chain[20], 20, 15, 4));
        network.set_chain(fork.clone());

        assert_eq!(engine.sync_round().await.unwrap(), RoundOutcome::Synced(35));
        let tip = store.get_best_header().unwrap().unwrap();
        assert_eq!(tip.block_hash, fork[35].block_hash(), "{protocol:?}");
        assert_eq!(
            store.get_header_at_height(21).unwrap().unwrap().block_hash,
            fork[21].block_hash()
        );
        assert_linked(store.as_ref());
    }
}

#[tokio::test]
async fn test_fork_deeper_than_safety_margin_is_not_followed() {
    let chain = regtest_chain(30);
    let (network, pool, engine, store) =
        synced_engine(&chain, Protocol::P2p, test_config()).await;

    let mut fork = chain[..=15].to_vec();
    fork.extend(mine_chain(&chain[15], 15, 25, 8));
    network.set_chain(fork);

    assert_eq!(engine.sync_round().await.unwrap(), RoundOutcome::Synced(30));
    assert_eq!(
        store.get_best_header().unwrap().unwrap().block_hash,
        chain[30].block_hash()
    );
    assert_eq!(banned_peers(&network, &pool), 0);
}

#[tokio::test]
async fn test_state_is_free_while_peers_stall() {
    let chain = regtest_chain(10);
    let (network, pool, engine, store) =
        synced_engine(&chain, Protocol::Electrum, test_config()).await;
    let connection = pool.established()[0].id();

    network.peer(0).set_stalled(true);
    network.peer(1).set_stalled(true);
    let round = tokio::spawn({
        let engine = engine.clone();
        async move { engine.sync_round().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A new tip goes through while the round waits on the network
    let next = mine_chain(&chain[10], 10, 1, 0)[0];
    let applied = tokio::time::timeout(
        Duration::from_millis(200),
        engine.on_new_header(connection, &next, 11),
    )
    .await;
    assert!(matches!(applied, Ok(Ok(()))));
    assert_eq!(store.get_best_header().unwrap().unwrap().height, 11);

    let round = tokio::time::timeout(Duration::from_secs(3), round)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        round,
        Err(WireError::RetryExhausted { attempts: 2 })
    ));
    assert_eq!(store.get_best_header().unwrap().unwrap().height, 11);
}

#[tokio::test]
async fn test_kill_signal_stops_a_stalled_round() {
    let chain = regtest_chain(10);
    let network = Arc::new(MockNetwork::with_chain(2, chain));
    network.peer(0).set_stalled(true);
    network.peer(1).set_stalled(true);
    let pool = connected_pool(&network, test_config()).await;
    let (engine, _store) = engine_with(pool, regtest()).await;

    let kill_signal = Arc::new(RwLock::new(false));
    let handle = tokio::spawn(engine.clone().run(kill_signal.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    *kill_signal.write().await = true;
    let stopped = tokio::time::timeout(Duration::from_millis(400), handle).await;
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_pushed_headers_wake_the_sync_loop() {
    let mut chain = regtest_chain(10);
    let config = crate::SyncConfig {
        fetch_interval: Duration::from_secs(60),
        ..test_config()
    };
    let (network, pool, engine, store) =
        synced_engine(&chain, Protocol::Electrum, config).await;

    let kill_signal = Arc::new(RwLock::new(false));
    let handle = tokio::spawn(engine.clone().run(kill_signal.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The peers have three new headers, but only push us the first one
    chain.extend(mine_chain(&chain[10], 10, 3, 0));
    network.set_chain(chain.clone());
    let connection = pool.established()[0].id();
    let outcome = engine.on_headers(connection, &chain[11..12]).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Extended(1));

    // Without waiting for the next fetch, the loop asks for the rest
    let mut height = 0;
    for _ in 0..50 {
        height = store.get_best_header().unwrap().unwrap().height;
        if height == 13 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(height, 13);
    assert_eq!(
        store.get_best_header().unwrap().unwrap().block_hash,
        chain[13].block_hash()
    );

    *kill_signal.write().await = true;
    let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
}
