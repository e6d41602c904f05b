//! End-to-end scenarios driven through the worker's message interface:
//! announcement, brief/detail fetch, application, reorganization, mempool
//! dependency tracking, and the anti-abuse layer.

mod common;

use common::*;

use lib_blockchain::state::{BLOCK_SUBSIDY, GENESIS_ROOT_BALANCE, TOTAL_SUPPLY};
use lib_blockchain::store::BlockStore;
use lib_blockchain::chain::{Blockchain, GenesisConfig};
use lib_blockchain::{RESERVE_FUND_ACCOUNT_ID, ROOT_ACCOUNT_ID};
use lib_network::{NodeHandle, PeerHandle};
use serde_json::Value;

/// Push one block through announcement and detail fetch from `peer`.
fn sync_block(
    chain: &mut Blockchain,
    peer: &PeerHandle,
    block_doc: &Value,
    height: u64,
    now: u64,
) {
    chain
        .handle_message(peer.clone(), broadcast_doc(block_doc, accum_after(height)), now)
        .unwrap();
    assert!(chain.is_switching(), "announcement should start a switch");
    chain
        .handle_message(peer.clone(), detail_rsp_doc(block_doc), now)
        .unwrap();
    assert!(!chain.is_switching(), "single-block switch should finish");
}

#[test]
fn genesis_plus_register() {
    let (mut chain, _net, root) = test_chain();
    let (peer, _out, _ctrl) = PeerHandle::loopback("10.0.0.1:18050");

    let alice = keys();
    let g = genesis_hash(&root);
    let b1 = mine_block(
        1,
        BASE_UTC + 20,
        &g,
        &root,
        &[register_tx(&alice, "alice", &root, 1)],
    );

    sync_block(&mut chain, &peer, &b1, 1, BASE_UTC + 20);

    let state = chain.state();
    let alice_account = state.account_by_pubkey(&alice.pubkey).expect("registered");
    assert_eq!(alice_account.id, 2);
    assert_eq!(alice_account.balance, 0);
    assert_eq!(alice_account.referrer, Some(ROOT_ACCOUNT_ID));

    // root pays the 2-unit fee, earns 1 back as the miner plus the block
    // subsidy; the orphan unit lands in the reserve fund
    let root_account = state.account(ROOT_ACCOUNT_ID).unwrap();
    assert_eq!(
        root_account.balance,
        GENESIS_ROOT_BALANCE - 2 + 1 + BLOCK_SUBSIDY
    );
    let reserve = state.account(RESERVE_FUND_ACCOUNT_ID).unwrap();
    assert_eq!(
        reserve.balance,
        TOTAL_SUPPLY - GENESIS_ROOT_BALANCE + 1 - BLOCK_SUBSIDY
    );

    // conservation: nothing minted, nothing destroyed
    assert_eq!(state.coin_total(), TOTAL_SUPPLY);
    assert_eq!(chain.tip_block().id, 1);
    assert!(state.knows_tx(&tx_id_of(&b1["tx"][0])));
}

#[test]
fn send_moves_funds_between_accounts() {
    let (mut chain, _net, root) = test_chain();
    let (peer, _out, _ctrl) = PeerHandle::loopback("10.0.0.1:18050");

    let alice = keys();
    let bob = keys();
    let g = genesis_hash(&root);

    let b1 = mine_block(
        1,
        BASE_UTC + 20,
        &g,
        &root,
        &[
            register_tx(&alice, "alice", &root, 1),
            register_tx(&bob, "bobby", &root, 1),
        ],
    );
    sync_block(&mut chain, &peer, &b1, 1, BASE_UTC + 20);

    let b2 = mine_block(
        2,
        BASE_UTC + 40,
        &block_hash(&b1),
        &root,
        &[send_tx(&root, &alice.pubkey, 102, 2)],
    );
    sync_block(&mut chain, &peer, &b2, 2, BASE_UTC + 40);
    assert_eq!(
        chain.state().account_by_pubkey(&alice.pubkey).unwrap().balance,
        102
    );

    let b3 = mine_block(
        3,
        BASE_UTC + 60,
        &block_hash(&b2),
        &root,
        &[send_tx(&alice, &bob.pubkey, 100, 3)],
    );
    let root_before = chain.state().account(ROOT_ACCOUNT_ID).unwrap().balance;
    sync_block(&mut chain, &peer, &b3, 3, BASE_UTC + 60);

    let state = chain.state();
    assert_eq!(state.account_by_pubkey(&alice.pubkey).unwrap().balance, 0);
    assert_eq!(state.account_by_pubkey(&bob.pubkey).unwrap().balance, 100);
    // root is miner (+1 +subsidy) and alice's referrer (+1)
    assert_eq!(
        state.account(ROOT_ACCOUNT_ID).unwrap().balance,
        root_before + 1 + 1 + BLOCK_SUBSIDY
    );
    assert_eq!(state.coin_total(), TOTAL_SUPPLY);
}

#[test]
fn fork_reorganization_adopts_heavier_chain() {
    let (mut chain, _net, root) = test_chain();
    let (p1, _out1, _ctrl1) = PeerHandle::loopback("10.0.0.1:18050");
    let (p2, mut p2_out, _ctrl2) = PeerHandle::loopback("10.0.0.2:18050");

    let alice = keys();
    let g = genesis_hash(&root);

    // main chain: G -> A -> B, where B funds alice with 10
    let block_a = mine_block(
        1,
        BASE_UTC + 20,
        &g,
        &root,
        &[register_tx(&alice, "alice", &root, 1)],
    );
    sync_block(&mut chain, &p1, &block_a, 1, BASE_UTC + 20);

    let block_b = mine_block(
        2,
        BASE_UTC + 40,
        &block_hash(&block_a),
        &root,
        &[send_tx(&root, &alice.pubkey, 10, 2)],
    );
    sync_block(&mut chain, &p1, &block_b, 2, BASE_UTC + 40);
    assert_eq!(
        chain.state().account_by_pubkey(&alice.pubkey).unwrap().balance,
        10
    );

    // competing fork: G -> A -> C -> D carrying different transfers
    let block_c = mine_block(
        2,
        BASE_UTC + 41,
        &block_hash(&block_a),
        &root,
        &[send_tx(&root, &alice.pubkey, 20, 2)],
    );
    let block_d = mine_block(
        3,
        BASE_UTC + 61,
        &block_hash(&block_c),
        &root,
        &[send_tx(&root, &alice.pubkey, 30, 3)],
    );

    let now = BASE_UTC + 61;
    chain
        .handle_message(p2.clone(), broadcast_doc(&block_d, accum_after(3)), now)
        .unwrap();

    // the node must walk backward: it needs C before it can anchor
    let brief_req = p2_out.try_recv().expect("brief request for C");
    assert_eq!(brief_req["msg_cmd"], 1);
    assert_eq!(brief_req["hash"], block_d["data"]["pre_hash"]);

    chain
        .handle_message(p2.clone(), brief_rsp_doc(&block_c), now)
        .unwrap();
    assert!(chain.is_switching(), "anchored fork should trigger a switch");

    // detail fetch: C, then D
    chain
        .handle_message(p2.clone(), detail_rsp_doc(&block_c), now)
        .unwrap();
    assert!(chain.is_switching());
    chain
        .handle_message(p2.clone(), detail_rsp_doc(&block_d), now)
        .unwrap();
    assert!(!chain.is_switching());

    let state = chain.state();
    assert_eq!(chain.tip_block().id, 3);
    assert_eq!(chain.tip_block().hash, block_hash(&block_d));

    // B's transfer is gone; C's and D's are in
    assert_eq!(
        state.account_by_pubkey(&alice.pubkey).unwrap().balance,
        20 + 30
    );
    assert_eq!(state.coin_total(), TOTAL_SUPPLY);

    // B's rolled-back transfer re-entered the admitted pool
    assert_eq!(chain.mempool().admitted_len(), 1);

    // the tip always carries the greatest accumulated pow in memory
    assert_eq!(
        chain.most_difficult_block().hash,
        chain.tip_block().hash
    );
}

#[test]
fn reward_overpayment_rejects_block_and_punishes_peer() {
    let (mut chain, net, root) = test_chain();
    let (good, _gout, _gctrl) = PeerHandle::loopback("10.0.0.1:18050");
    let (bad, _bout, _bctrl) = PeerHandle::loopback("10.0.0.66:18050");
    net.add_known_peer("10.0.0.66", 18050);

    let carol = keys();
    let bobby = keys();
    let g = genesis_hash(&root);

    let b1 = mine_block(
        1,
        BASE_UTC + 20,
        &g,
        &root,
        &[
            register_tx(&carol, "carol", &root, 1),
            register_tx(&bobby, "bobby", &root, 1),
        ],
    );
    sync_block(&mut chain, &good, &b1, 1, BASE_UTC + 20);

    let b2 = mine_block(
        2,
        BASE_UTC + 40,
        &block_hash(&b1),
        &root,
        &[
            send_tx(&root, &carol.pubkey, 200, 2),
            send_tx(&root, &bobby.pubkey, 10, 2),
        ],
    );
    sync_block(&mut chain, &good, &b2, 2, BASE_UTC + 40);

    let topic = topic_tx(&carol, b"an expensive question", 50, 3);
    let topic_key = tx_id_of(&topic);
    let b3 = mine_block(3, BASE_UTC + 60, &block_hash(&b2), &root, &[topic]);
    sync_block(&mut chain, &good, &b3, 3, BASE_UTC + 60);

    let reply = reply_tx(&bobby, &topic_key, b"a helpful answer", 4);
    let reply_key = tx_id_of(&reply);
    let b4 = mine_block(4, BASE_UTC + 80, &block_hash(&b3), &root, &[reply]);
    sync_block(&mut chain, &good, &b4, 4, BASE_UTC + 80);
    assert_eq!(chain.state().topic(&topic_key).unwrap().balance, 50);

    // a block rewarding 60 out of a 50-unit pool
    let overdraw = reward_tx(&carol, &topic_key, &reply_key, 60, 5);
    let b5 = mine_block(5, BASE_UTC + 100, &block_hash(&b4), &root, &[overdraw]);

    let carol_before = chain.state().account_by_pubkey(&carol.pubkey).unwrap().balance;
    let now = BASE_UTC + 100;
    chain
        .handle_message(bad.clone(), broadcast_doc(&b5, accum_after(5)), now)
        .unwrap();
    assert!(chain.is_switching());
    chain
        .handle_message(bad.clone(), detail_rsp_doc(&b5), now)
        .unwrap();

    // the block is refused, the supplier is punished, nothing changed
    assert!(!chain.is_switching());
    assert_eq!(chain.tip_block().hash, block_hash(&b4));
    assert_eq!(chain.state().topic(&topic_key).unwrap().balance, 50);
    assert_eq!(
        chain.state().account_by_pubkey(&carol.pubkey).unwrap().balance,
        carol_before
    );
    assert!(net.is_banned("10.0.0.66:18050"));
    assert_eq!(
        net.score_of("10.0.0.66:18050"),
        Some(lib_network::INITIAL_SCORE - 1000)
    );
    assert_eq!(chain.state().coin_total(), TOTAL_SUPPLY);
}

#[test]
fn mempool_dependency_chain() {
    let (mut chain, _net, root) = test_chain();
    let (peer, _out, _ctrl) = PeerHandle::loopback("10.0.0.1:18050");

    let alice = keys();
    let bob = keys();
    let dave = keys();
    let g = genesis_hash(&root);

    let b1 = mine_block(
        1,
        BASE_UTC + 20,
        &g,
        &root,
        &[
            register_tx(&alice, "alice", &root, 1),
            register_tx(&bob, "bobby", &root, 1),
        ],
    );
    sync_block(&mut chain, &peer, &b1, 1, BASE_UTC + 20);

    let b2 = mine_block(
        2,
        BASE_UTC + 40,
        &block_hash(&b1),
        &root,
        &[send_tx(&root, &alice.pubkey, 2, 2)],
    );
    sync_block(&mut chain, &peer, &b2, 2, BASE_UTC + 40);
    assert_eq!(
        chain.state().account_by_pubkey(&alice.pubkey).unwrap().balance,
        2
    );

    // register dave with alice as referrer: admitted, reserving her 2 units
    let register_dave = register_tx(&dave, "davey", &alice, 2);
    let now = BASE_UTC + 41;
    chain
        .handle_message(peer.clone(), tx_broadcast_doc(&register_dave), now)
        .unwrap();
    assert_eq!(chain.mempool().admitted_len(), 1);
    assert_eq!(
        chain.state().account_by_pubkey(&alice.pubkey).unwrap().uv_spend,
        2
    );

    // alice's send has no free balance left: it waits in uv_1
    let alice_send = send_tx(&alice, &bob.pubkey, 1, 2);
    chain
        .handle_message(peer.clone(), tx_broadcast_doc(&alice_send), now)
        .unwrap();
    assert_eq!(chain.mempool().admitted_len(), 1);
    assert_eq!(chain.mempool().waiting_len(), 1);

    // the registration commits; alice's balance is now truly 0, so the
    // send is re-evaluated and dropped
    let b3 = mine_block(3, BASE_UTC + 60, &block_hash(&b2), &root, &[register_dave]);
    sync_block(&mut chain, &peer, &b3, 3, BASE_UTC + 60);

    assert!(chain.state().account_by_pubkey(&dave.pubkey).is_some());
    assert_eq!(
        chain.state().account_by_pubkey(&alice.pubkey).unwrap().balance,
        0
    );
    assert_eq!(chain.mempool().admitted_len(), 0);
    assert_eq!(chain.mempool().waiting_len(), 0);
    assert_eq!(
        chain.state().account_by_pubkey(&alice.pubkey).unwrap().uv_spend,
        0
    );
}

#[test]
fn brief_request_timeout_punishes_every_attached_peer() {
    let (mut chain, net, root) = test_chain();
    let (p1, _o1, _c1) = PeerHandle::loopback("10.0.0.1:18050");
    let (p2, _o2, _c2) = PeerHandle::loopback("10.0.0.2:18050");
    net.add_known_peer("10.0.0.1", 18050);
    net.add_known_peer("10.0.0.2", 18050);

    // a block at height 5 whose ancestry nobody can supply
    let phantom_parent = lib_crypto::coin_hash_b64(b"never heard of it");
    let block_x = mine_block(5, BASE_UTC + 100, &phantom_parent, &root, &[]);

    let now = BASE_UTC + 100;
    chain
        .handle_message(p1.clone(), broadcast_doc(&block_x, accum_after(5)), now)
        .unwrap();
    chain
        .handle_message(p2.clone(), broadcast_doc(&block_x, accum_after(5)), now)
        .unwrap();

    // two attached chains: the request may retry 2 × 2 times
    for second in 1..=3u64 {
        chain.on_tick(now + second).unwrap();
        assert!(!net.is_banned("10.0.0.1:18050"));
        assert!(!net.is_banned("10.0.0.2:18050"));
    }

    chain.on_tick(now + 4).unwrap();
    assert!(net.is_banned("10.0.0.1:18050"));
    assert!(net.is_banned("10.0.0.2:18050"));
    assert_eq!(
        net.score_of("10.0.0.1:18050"),
        Some(lib_network::INITIAL_SCORE - 1000)
    );
    assert_eq!(
        net.score_of("10.0.0.2:18050"),
        Some(lib_network::INITIAL_SCORE - 1000)
    );
}

#[test]
fn chain_reloads_from_storage() {
    let dir = tempfile::tempdir().unwrap();
    let root = keys();
    let config = GenesisConfig::new(root.pubkey.clone(), BASE_UTC);
    let alice = keys();

    let (b1, b2) = {
        let store = BlockStore::open(dir.path()).unwrap();
        let mut chain = Blockchain::load(store, &config, NodeHandle::detached()).unwrap();
        let (peer, _out, _ctrl) = PeerHandle::loopback("10.0.0.1:18050");

        let g = chain.genesis_hash().to_string();
        let b1 = mine_block(
            1,
            BASE_UTC + 20,
            &g,
            &root,
            &[register_tx(&alice, "alice", &root, 1)],
        );
        sync_block(&mut chain, &peer, &b1, 1, BASE_UTC + 20);

        let b2 = mine_block(
            2,
            BASE_UTC + 40,
            &block_hash(&b1),
            &root,
            &[send_tx(&root, &alice.pubkey, 77, 2)],
        );
        sync_block(&mut chain, &peer, &b2, 2, BASE_UTC + 40);
        (block_hash(&b1), block_hash(&b2))
    };

    // reopen: the DAG is rebuilt and the heaviest branch replayed
    let store = BlockStore::open(dir.path()).unwrap();
    let chain = Blockchain::load(store, &config, NodeHandle::detached()).unwrap();

    assert_eq!(chain.tip_block().hash, b2);
    assert_eq!(chain.tip_block().id, 2);
    assert!(chain.block(&b1).is_some());
    assert_eq!(
        chain.state().account_by_pubkey(&alice.pubkey).unwrap().balance,
        77
    );
    assert_eq!(chain.state().coin_total(), TOTAL_SUPPLY);
}

#[test]
fn difficulty_rule_is_enforced_on_detail_blocks() {
    let (mut chain, net, root) = test_chain();
    let (peer, _out, _ctrl) = PeerHandle::loopback("10.0.0.7:18050");
    net.add_known_peer("10.0.0.7", 18050);

    // b1 arrives only 5 s after genesis, so b1.utc_diff < 15 and any child
    // of b1 must tighten to zero_bits = 2; a child still claiming 1 is
    // refused at the detail stage
    let g = genesis_hash(&root);
    let b1 = mine_block(1, BASE_UTC + 5, &g, &root, &[]);
    sync_block(&mut chain, &peer, &b1, 1, BASE_UTC + 5);

    let b2_fast = mine_block(2, BASE_UTC + 25, &block_hash(&b1), &root, &[]);
    let now = BASE_UTC + 25;
    chain
        .handle_message(peer.clone(), broadcast_doc(&b2_fast, accum_after(2)), now)
        .unwrap();
    assert!(chain.is_switching());
    chain
        .handle_message(peer.clone(), detail_rsp_doc(&b2_fast), now)
        .unwrap();

    // the fetch failed over and died; the tip is unchanged
    assert!(!chain.is_switching());
    assert_eq!(chain.tip_block().hash, block_hash(&b1));
    assert!(net.is_banned("10.0.0.7:18050"));
}
