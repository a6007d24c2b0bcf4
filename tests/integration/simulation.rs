//! Synthetic collusion-ring simulation.
//!
//! Generates a chain of colluding accounts hidden among honest players
//! and checks that a run seeded with a single ring member walks the whole
//! chain, leaves the honest players alone and keeps its accounting exact.

use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use oppwatch::backend::Row;
use oppwatch::config::{DetectionSettings, SchemaConfig};
use oppwatch::engine::{CancelFlag, TraversalController};
use oppwatch::engine::normalizer::parse_wager;
use oppwatch::types::{SeedRequest, TimeWindow};

use crate::mock_backend::{bet, MockBackend, BACKEND};

const RING: [&str; 4] = ["C1", "C2", "C3", "C4"];
const HONEST: [&str; 5] = ["H1", "H2", "H3", "H4", "H5"];

/// Rounds `S0..S{n}`: each pairs two neighbouring ring members on
/// opposite sides with stakes ~3% apart. An honest player joins every
/// round with a token stake, listed after the ring members so it never
/// completes a split-stake group. Honest players also play alone.
fn ring_rows(rounds: usize) -> Vec<Row> {
    let mut rows = Vec::new();
    for i in 0..rounds {
        let round = format!("S{i}");
        let link = i % (RING.len() - 1);
        let (a, b) = (RING[link], RING[link + 1]);
        let (pos_a, pos_b) = if i % 2 == 0 { ("BANKER", "PLAYER") } else { ("PLAYER", "BANKER") };
        let stake = 100 + i as i64;

        rows.push(bet(&round, a, pos_a, stake));
        rows.push(bet(&round, b, pos_b, stake - 3));
        rows.push(bet(&round, HONEST[i % HONEST.len()], pos_a, 1));
    }
    for (i, honest) in HONEST.iter().enumerate() {
        rows.push(bet(&format!("H-solo-{i}"), honest, "PLAYER", 40));
    }
    rows
}

fn controller(backend: Arc<MockBackend>, settings: DetectionSettings) -> TraversalController {
    TraversalController::new(backend, BACKEND, &SchemaConfig::default(), settings, None).unwrap()
}

fn seed() -> SeedRequest {
    SeedRequest::new(vec!["C1".into()], TimeWindow::unbounded())
}

#[tokio::test]
async fn test_ring_fully_discovered() {
    let backend = Arc::new(MockBackend::new(ring_rows(30)));
    let report = controller(backend.clone(), DetectionSettings::default())
        .run(&seed(), Uuid::new_v4(), CancelFlag::new())
        .await
        .unwrap();

    let suspicious: BTreeSet<&str> = report.suspicious_accounts().iter().map(|s| s.as_str()).collect();
    assert_eq!(suspicious, RING.into_iter().collect());
    assert_eq!(report.promoted_accounts, vec!["C2", "C3", "C4"]);
    assert_eq!(report.rounds_processed, 30);
    assert_eq!(report.matched_bets.len(), 60);

    for honest in HONEST {
        let stats = &report.account_stats[honest].stats;
        assert_eq!(stats.common_rounds, 0, "{honest} should never be matched");
    }

    // each round fetched once, honest solo rounds never reached
    let fetches = backend.round_fetches();
    assert_eq!(fetches.len(), 30);
    assert!(fetches.values().all(|n| *n == 1));
    assert!(!fetches.keys().any(|k| k.starts_with("H-solo")));
}

#[tokio::test]
async fn test_stats_match_processed_rounds() {
    let rows = ring_rows(45);
    let backend = Arc::new(MockBackend::new(rows.clone()));
    let report = controller(backend.clone(), DetectionSettings::default())
        .run(&seed(), Uuid::new_v4(), CancelFlag::new())
        .await
        .unwrap();

    let fetched = backend.round_fetches();
    let mut expected: HashMap<String, Decimal> = HashMap::new();
    for row in &rows {
        let round = row.get("Game Id").and_then(|v| v.as_str()).unwrap();
        if !fetched.contains_key(round) {
            continue;
        }
        let account = row.get("User Id").and_then(|v| v.as_str()).unwrap();
        let wager = parse_wager(row.get("BET EUR").unwrap()).unwrap();
        *expected.entry(account.to_string()).or_default() += wager;
    }

    assert_eq!(report.account_stats.len(), expected.len());
    for (account, total) in expected {
        assert_eq!(report.account_stats[&account].stats.total_wager(), total, "{account}");
    }
}

#[tokio::test]
async fn test_round_cap_truncates_large_ring() {
    let backend = Arc::new(MockBackend::new(ring_rows(60)));
    let settings = DetectionSettings { max_rounds: Some(12), ..DetectionSettings::default() };
    let report = controller(backend.clone(), settings)
        .run(&seed(), Uuid::new_v4(), CancelFlag::new())
        .await
        .unwrap();

    assert!(report.truncated);
    assert_eq!(report.rounds_processed, 12);
    assert_eq!(backend.round_fetches().len(), 12);
}

#[tokio::test]
async fn test_cancel_mid_ring_keeps_partial_results() {
    let cancel = CancelFlag::new();
    // S6 is the third C1/C2 round
    let backend = Arc::new(MockBackend::new(ring_rows(30)).cancel_after_round("S6", cancel.clone()));
    let report = controller(backend.clone(), DetectionSettings::default())
        .run(&seed(), Uuid::new_v4(), cancel)
        .await
        .unwrap();

    assert!(report.is_cancelled());
    assert_eq!(report.rounds_processed, 3);
    assert!(report.promoted_accounts.is_empty());
    assert_eq!(report.account_stats["C2"].stats.common_rounds, 3);
}
