mod common;

use common::*;
use htlc_swap_coordinator::error::SwapError;
use htlc_swap_coordinator::intents::{IntentStatus, IntentUpdate, MatchStatus, MatchUpdate};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_matches_have_one_winner() {
    let w = world().await;
    let intent = w.registry.create_intent(avax_for_eth(ALICE, 1.0)).await.unwrap();

    let matchers = [
        BOB,
        CAROL,
        "0x00000000000000000000000000000000000000d1",
        "0x00000000000000000000000000000000000000e1",
        "0x00000000000000000000000000000000000000f1",
        "0x0000000000000000000000000000000000000101",
        "0x0000000000000000000000000000000000000102",
        "0x0000000000000000000000000000000000000103",
    ];
    let handles: Vec<_> = matchers
        .iter()
        .map(|matcher| {
            let registry = w.registry.clone();
            let id = intent.id.clone();
            let matcher = matcher.to_string();
            tokio::spawn(async move { registry.match_intent(&id, &matcher).await })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok((record, _)) => winners.push(record),
            Err(e) => assert!(matches!(e, SwapError::StateConflict(_)), "unexpected error: {}", e),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = w.registry.require_intent(&intent.id).await.unwrap();
    assert_eq!(stored.status, IntentStatus::Matched);
    assert_eq!(stored.match_id.as_deref(), Some(winners[0].id.as_str()));
    assert_eq!(stored.matched_by.as_ref(), Some(&winners[0].matcher));
    assert_eq!(w.registry.stats().await.unwrap().total_matches, 1);
}

#[tokio::test]
async fn test_complementary_intents_found_both_ways() {
    let w = world().await;

    let sell_avax = w.registry.create_intent(avax_for_eth(ALICE, 1.0)).await.unwrap();
    let sell_eth = w.registry.create_intent(eth_for_avax(BOB, 0.0135)).await.unwrap();
    // Outside the tolerance
    w.registry.create_intent(eth_for_avax(CAROL, 0.02)).await.unwrap();

    let found = w.registry.find_complementary(&sell_avax).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, sell_eth.id);

    // 0.0135 ETH quotes to 0.999945 AVAX, within 0.001 of Alice's 1.0
    let found = w.registry.find_complementary(&sell_eth).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, sell_avax.id);
}

#[tokio::test]
async fn test_matched_intents_leave_the_book() {
    let w = world().await;

    let first = w.registry.create_intent(avax_for_eth(ALICE, 1.0)).await.unwrap();
    let second = w.registry.create_intent(avax_for_eth(ALICE, 2.0)).await.unwrap();
    let counter = w.registry.create_intent(eth_for_avax(BOB, 0.0135)).await.unwrap();

    w.registry.match_intent(&first.id, CAROL).await.unwrap();

    let active: Vec<String> = w
        .registry
        .list_active()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(active.len(), 2);
    assert!(active.contains(&second.id));
    assert!(!active.contains(&first.id));

    assert!(w.registry.find_complementary(&counter).await.unwrap().is_empty());

    let stats = w.registry.stats().await.unwrap();
    assert_eq!(stats.active_intents, 2);
    assert_eq!(stats.total_matches, 1);
}

#[tokio::test]
async fn test_match_rejects_self_and_repeat() {
    let w = world().await;
    let intent = w.registry.create_intent(avax_for_eth(ALICE, 1.0)).await.unwrap();

    // Addresses compare case-insensitively
    let err = w
        .registry
        .match_intent(&intent.id, &ALICE.to_uppercase())
        .await
        .unwrap_err();
    assert!(matches!(err, SwapError::Validation(_)));

    w.registry.match_intent(&intent.id, BOB).await.unwrap();
    let err = w.registry.match_intent(&intent.id, CAROL).await.unwrap_err();
    assert!(matches!(err, SwapError::StateConflict(_)));

    let err = w.registry.match_intent("missing", CAROL).await.unwrap_err();
    assert!(matches!(err, SwapError::NotFound { .. }));
}

#[tokio::test]
async fn test_stale_records_swept() {
    let w = world().await;

    let stale = w.registry.create_intent(avax_for_eth(ALICE, 1.0)).await.unwrap();
    let unfunded = w.registry.create_intent(avax_for_eth(ALICE, 2.0)).await.unwrap();
    let (record, _) = w.registry.match_intent(&unfunded.id, BOB).await.unwrap();

    w.clock.advance(86400);
    let fresh = w.registry.create_intent(eth_for_avax(BOB, 0.5)).await.unwrap();

    let err = w.registry.match_intent(&stale.id, CAROL).await.unwrap_err();
    assert!(matches!(err, SwapError::StateConflict(_)));

    let report = w.registry.sweep_expired().await.unwrap();
    assert_eq!(report.expired_intents, 1);
    assert_eq!(report.expired_matches, 1);

    let stale = w.registry.require_intent(&stale.id).await.unwrap();
    assert_eq!(stale.status, IntentStatus::Expired);
    let record = w.registry.require_match(&record.id).await.unwrap();
    assert_eq!(record.status, MatchStatus::Expired);
    let unfunded = w.registry.require_intent(&unfunded.id).await.unwrap();
    assert_eq!(unfunded.status, IntentStatus::Expired);

    let fresh = w.registry.require_intent(&fresh.id).await.unwrap();
    assert_eq!(fresh.status, IntentStatus::Pending);

    // A second sweep has nothing left to do
    let report = w.registry.sweep_expired().await.unwrap();
    assert_eq!(report.expired_intents + report.expired_matches, 0);
}

#[tokio::test]
async fn test_user_views_cover_both_sides() {
    let w = world().await;

    let intent = w.registry.create_intent(avax_for_eth(ALICE, 1.0)).await.unwrap();
    w.registry.create_intent(eth_for_avax(CAROL, 1.0)).await.unwrap();
    let (record, _) = w.registry.match_intent(&intent.id, BOB).await.unwrap();

    let alice_intents = w.registry.intents_for(ALICE).await.unwrap();
    assert_eq!(alice_intents.len(), 1);
    assert_eq!(alice_intents[0].id, intent.id);

    for who in [ALICE, BOB] {
        let matches = w.registry.matches_for(who).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, record.id);
    }
    assert!(w.registry.matches_for(CAROL).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_clear_empties_the_book() {
    let w = world().await;

    let intent = w.registry.create_intent(avax_for_eth(ALICE, 1.0)).await.unwrap();
    w.registry.match_intent(&intent.id, BOB).await.unwrap();

    let (intents, matches) = w.registry.clear().await.unwrap();
    assert_eq!((intents, matches), (1, 1));

    let stats = w.registry.stats().await.unwrap();
    assert_eq!(stats.active_intents, 0);
    assert_eq!(stats.total_matches, 0);
}

#[tokio::test]
async fn test_matched_intent_cannot_be_reopened() {
    let w = world().await;
    let intent = w.registry.create_intent(avax_for_eth(ALICE, 1.0)).await.unwrap();
    let pending = w.registry.create_intent(avax_for_eth(ALICE, 2.0)).await.unwrap();
    let (record, _) = w.registry.match_intent(&intent.id, BOB).await.unwrap();

    let reopen = IntentUpdate {
        status: Some(IntentStatus::Pending),
        ..Default::default()
    };
    let err = w.registry.update_intent(&intent.id, reopen).await.unwrap_err();
    assert!(matches!(err, SwapError::StateConflict(_)));

    // The book still holds Bob's match, so a second matcher is refused
    let err = w.registry.match_intent(&intent.id, CAROL).await.unwrap_err();
    assert!(matches!(err, SwapError::StateConflict(_)));
    assert_eq!(w.registry.stats().await.unwrap().total_matches, 1);

    // Matched is only reachable through matching
    let shortcut = IntentUpdate {
        status: Some(IntentStatus::Matched),
        ..Default::default()
    };
    let err = w.registry.update_intent(&pending.id, shortcut).await.unwrap_err();
    assert!(matches!(err, SwapError::StateConflict(_)));

    let rewind = MatchUpdate {
        status: Some(MatchStatus::Matched),
        ..Default::default()
    };
    w.registry
        .update_match(
            &record.id,
            MatchUpdate {
                status: Some(MatchStatus::InitiatorLocked),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = w.registry.update_match(&record.id, rewind).await.unwrap_err();
    assert!(matches!(err, SwapError::StateConflict(_)));
}
