#![allow(non_snake_case)]

mod common;

use common::TestContext;
use ledger_abi::TypeCharacter;
use nftg_client::{
    Action,
    ActionKind,
    ClientError,
    SessionSettings,
    devnet::LocalLedger,
};
use std::time::Duration;

#[tokio::test]
async fn create__berserker_with_fee__appears_in_mine() {
    // given
    let mut ctx = TestContext::new().await;
    ctx.settled(1).await;
    let dispatcher = ctx.session.dispatcher().unwrap();

    // when
    let outcome = dispatcher.create(TypeCharacter::Berserker).await.unwrap();
    let snapshot = ctx
        .wait_for(|s| s.cache.mine.iter().any(|e| e.type_character == 0))
        .await;

    // then
    assert_eq!(outcome.action, Action::Create(TypeCharacter::Berserker));
    assert!(outcome.advisory.is_none());
    assert_eq!(snapshot.cache.mine.len(), 1);
    assert!(!ctx.session.action_state().is_in_flight());
    ctx.session.shutdown();
}

#[tokio::test]
async fn heal__entity_above_threshold__still_dispatches() {
    // given
    let ledger = LocalLedger::new();
    let me = ledger.accounts()[0].clone();
    let id = ledger.seed_entity(&me, 0);
    ledger.set_xp(id, 150);
    let mut ctx = TestContext::with_ledger(ledger, SessionSettings::default()).await;
    ctx.settled(1).await;

    // when
    let outcome = ctx.session.dispatcher().unwrap().heal(id).await.unwrap();

    // then
    assert!(outcome.advisory.is_some());
    assert_eq!(ctx.ledger.write_calls(), 1);
    ctx.session.shutdown();
}

#[tokio::test]
async fn dispatch__while_another_action_in_flight__is_rejected_until_it_settles() {
    // given
    let mut ctx = TestContext::new().await;
    ctx.settled(1).await;
    let dispatcher = ctx.session.dispatcher().unwrap();
    ctx.ledger.hold_writes();
    let pending = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.create(TypeCharacter::Spiritual).await })
    };
    ctx.ledger.wait_for_held_writes(1).await;

    // when
    let second = dispatcher.withdraw().await;

    // then
    assert_eq!(
        second,
        Err(ClientError::ActionAlreadyInProgress {
            in_flight: ActionKind::Create
        })
    );
    ctx.ledger.release_writes();
    assert!(pending.await.unwrap().is_ok());
    assert!(!ctx.session.action_state().is_in_flight());
    assert!(dispatcher.withdraw().await.is_ok());
    ctx.session.shutdown();
}

#[tokio::test]
async fn dispatch__program_rejects__resets_in_flight_and_session_stays_usable() {
    // given
    let mut ctx = TestContext::new().await;
    ctx.settled(1).await;
    let dispatcher = ctx.session.dispatcher().unwrap();
    ctx.ledger.reject_writes(Some("insufficient funds"));

    // when
    let rejected = dispatcher.create(TypeCharacter::Elementary).await;

    // then
    assert!(matches!(
        rejected,
        Err(ClientError::ActionRejected {
            action: ActionKind::Create,
            ..
        })
    ));
    assert!(!ctx.session.action_state().is_in_flight());
    ctx.ledger.reject_writes(None);
    assert!(dispatcher.create(TypeCharacter::Elementary).await.is_ok());
    ctx.session.shutdown();
}

#[tokio::test]
async fn dispatch__write_never_settles__times_out_and_clears_in_flight() {
    // given
    let settings = SessionSettings {
        call_timeout: Duration::from_millis(50),
        ..SessionSettings::default()
    };
    let mut ctx = TestContext::with_ledger(LocalLedger::new(), settings).await;
    ctx.settled(1).await;
    ctx.ledger.hold_writes();

    // when
    let result = ctx
        .session
        .dispatcher()
        .unwrap()
        .create(TypeCharacter::Berserker)
        .await;

    // then
    assert!(matches!(result, Err(ClientError::Timeout { .. })));
    assert!(!ctx.session.action_state().is_in_flight());
    ctx.session.shutdown();
}

#[tokio::test]
async fn withdraw__caller_not_owner__is_refused_before_submitting() {
    // given
    let mut ctx = TestContext::new().await;
    ctx.ledger.switch_account(1);
    ctx.deliver_wallet_event().await;
    ctx.settled(1).await;

    // when
    let result = ctx.session.dispatcher().unwrap().withdraw().await;

    // then
    assert!(matches!(result, Err(ClientError::InvalidRequest(_))));
    assert_eq!(ctx.ledger.write_calls(), 0);
    ctx.session.shutdown();
}

#[tokio::test]
async fn fight__against_known_rival__settles_and_refreshes_both_lists() {
    // given
    let ledger = LocalLedger::new();
    let accounts = ledger.accounts();
    let mine = ledger.seed_entity(&accounts[0], 0);
    let rival = ledger.seed_entity(&accounts[1], 1);
    let mut ctx = TestContext::with_ledger(ledger, SessionSettings::default()).await;
    ctx.settled(1).await;

    // when
    ctx.session
        .dispatcher()
        .unwrap()
        .fight(mine, rival)
        .await
        .unwrap();
    let snapshot = ctx
        .wait_for(|s| s.cache.others.iter().any(|e| e.id == rival && e.hp == 90))
        .await;

    // then
    assert_eq!(snapshot.cache.mine[0].xp, 6);
    ctx.session.shutdown();
}

#[tokio::test]
async fn fight__unknown_rival__is_refused_before_submitting() {
    // given
    let ledger = LocalLedger::new();
    let me = ledger.accounts()[0].clone();
    let mine = ledger.seed_entity(&me, 0);
    let mut ctx = TestContext::with_ledger(ledger, SessionSettings::default()).await;
    ctx.settled(1).await;

    // when
    let result = ctx.session.dispatcher().unwrap().fight(mine, 99).await;

    // then
    assert!(matches!(result, Err(ClientError::InvalidRequest(_))));
    assert!(!ctx.session.action_state().is_in_flight());
    assert_eq!(ctx.ledger.write_calls(), 0);
    ctx.session.shutdown();
}
