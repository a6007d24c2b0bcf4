//! End-to-end detection runs against the mock, fixture and SQLite backends.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use oppwatch::backend::memory::MemoryExecutor;
use oppwatch::backend::sqlite::SqliteExecutor;
use oppwatch::config::{AppConfig, DetectionSettings, SchemaConfig};
use oppwatch::engine::{CancelFlag, DetectionService, TraversalController};
use oppwatch::storage::{self, ConfigStore, JsonFileStore};
use oppwatch::types::{DetectionError, FetchTarget, RunOutcome, SeedRequest, TimeWindow};

use crate::mock_backend::{bet, MockBackend, BACKEND};

fn controller(backend: Arc<MockBackend>) -> TraversalController {
    TraversalController::new(
        backend,
        BACKEND,
        &SchemaConfig::default(),
        DetectionSettings::default(),
        None,
    )
    .unwrap()
}

fn seed(accounts: &str) -> SeedRequest {
    SeedRequest::from_csv(accounts, TimeWindow::unbounded())
}

#[tokio::test]
async fn test_opposite_pair_within_tolerance() {
    let backend = Arc::new(MockBackend::new(vec![
        bet("R1", "X", "BANKER", 100),
        bet("R1", "Y", "PLAYER", 95),
    ]));
    let report = controller(backend.clone())
        .run(&seed("X"), Uuid::new_v4(), CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.account_stats["Y"].stats.common_wager, dec!(95));
    assert_eq!(report.account_stats["X"].stats.common_rounds, 1);
    assert_eq!(report.matched_bets.len(), 2);
    assert_eq!(backend.round_fetches()["R1"], 1);
}

#[tokio::test]
async fn test_one_sided_round_has_no_common_bets() {
    let backend = Arc::new(MockBackend::new(vec![
        bet("R2", "X", "BANKER", 100),
        bet("R2", "Y", "BANKER", 100),
    ]));
    let report = controller(backend)
        .run(&seed("X"), Uuid::new_v4(), CancelFlag::new())
        .await
        .unwrap();

    assert!(report.matched_bets.is_empty());
    assert_eq!(report.account_stats["X"].stats.non_common_rounds, 1);
    assert_eq!(report.account_stats["Y"].stats.non_common_rounds, 1);
    assert!(report.suspicious_accounts().is_empty());
}

#[tokio::test]
async fn test_suspicious_partner_promoted_exactly_once() {
    let backend = Arc::new(MockBackend::new(vec![
        bet("R1", "X", "BANKER", 20),
        bet("R1", "Y", "PLAYER", 20),
        bet("R2", "X", "PLAYER", 20),
        bet("R2", "Y", "BANKER", 19),
        bet("R3", "X", "BANKER", 16),
        bet("R3", "Y", "PLAYER", 16),
        bet("R4", "Y", "BANKER", 25),
        bet("R5", "Y", "PLAYER", 20),
    ]));
    let report = controller(backend.clone())
        .run(&seed("X"), Uuid::new_v4(), CancelFlag::new())
        .await
        .unwrap();

    let y = &report.account_stats["Y"];
    assert_eq!(y.stats.common_rounds, 3);
    assert_eq!(y.stats.non_common_rounds, 2);
    assert_eq!(y.stats.common_wager, dec!(55));
    assert_eq!(y.stats.total_wager(), dec!(100));
    assert!(y.suspicious);

    assert_eq!(report.promoted_accounts, vec!["Y".to_string()]);
    assert_eq!(
        backend.account_queries(),
        vec![vec!["X".to_string()], vec!["Y".to_string()]]
    );
}

#[tokio::test]
async fn test_cancel_after_first_round() {
    let cancel = CancelFlag::new();
    let backend = Arc::new(
        MockBackend::new(vec![
            bet("R1", "X", "BANKER", 100),
            bet("R1", "Y", "PLAYER", 100),
            bet("R2", "X", "BANKER", 100),
            bet("R2", "Z", "PLAYER", 100),
        ])
        .cancel_after_round("R1", cancel.clone()),
    );
    let report = controller(backend.clone())
        .run(&seed("X"), Uuid::new_v4(), cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(report.is_partial());
    assert_eq!(report.rounds_processed, 1);
    assert!(report.account_stats.contains_key("Y"));
    assert!(!report.account_stats.contains_key("Z"));
    assert!(!backend.round_fetches().contains_key("R2"));
}

#[tokio::test]
async fn test_cancel_before_promotion_promotes_nobody() {
    let cancel = CancelFlag::new();
    let backend = Arc::new(
        MockBackend::new(vec![bet("R1", "X", "BANKER", 100), bet("R1", "Y", "PLAYER", 100)])
            .cancel_after_round("R1", cancel.clone()),
    );
    let report = controller(backend.clone())
        .run(&seed("X"), Uuid::new_v4(), cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(report.account_stats["Y"].suspicious);
    assert!(report.promoted_accounts.is_empty());
    assert_eq!(backend.account_queries(), vec![vec!["X".to_string()]]);
}

#[tokio::test]
async fn test_overflowing_round_counts_as_malformed() {
    let max = Decimal::MAX.to_string();
    let backend = Arc::new(MockBackend::new(vec![
        bet("R1", "X", "BANKER", max.as_str()),
        bet("R1", "Y", "PLAYER", max.as_str()),
        bet("R2", "X", "BANKER", 1),
        bet("R2", "Z", "PLAYER", 1),
    ]));
    let report = controller(backend)
        .run(&seed("X"), Uuid::new_v4(), CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.rounds_processed, 2);
    assert_eq!(report.malformed_records, 2);
    assert_eq!(report.account_stats["X"].stats.total_rounds(), 1);
    assert!(!report.account_stats.contains_key("Z"));
    assert_eq!(report.side_totals.side_a, Decimal::MAX);
}

#[tokio::test]
async fn test_backend_down_during_seeding_fails_run() {
    let backend = Arc::new(MockBackend::new(vec![bet("R1", "X", "BANKER", 100)]));
    backend.set_error("connection refused");
    let result = controller(backend)
        .run(&seed("X"), Uuid::new_v4(), CancelFlag::new())
        .await;
    let err = assert_err!(result);
    assert!(matches!(err, DetectionError::Backend { .. }));
}

#[tokio::test]
async fn test_promotion_failure_is_recorded() {
    // Y is promoted but the backend refuses Y's account query
    let rows = vec![bet("R1", "X", "BANKER", 100), bet("R1", "Y", "PLAYER", 100)];
    let inner = MemoryExecutor::new(BACKEND, rows).with_failing_value("Y");
    let controller = TraversalController::new(
        Arc::new(inner),
        BACKEND,
        &SchemaConfig::default(),
        DetectionSettings::default(),
        None,
    )
    .unwrap();

    let report = assert_ok!(
        controller
            .run(&seed("X"), Uuid::new_v4(), CancelFlag::new())
            .await
    );
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.promoted_accounts, vec!["Y".to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, FetchTarget::Accounts(vec!["Y".into()]));
}

#[tokio::test]
async fn test_wager_totals_are_not_double_counted() {
    let backend = Arc::new(MockBackend::new(vec![
        bet("R1", "X", "BANKER", 100),
        bet("R1", "X", "BANKER", 10),
        bet("R1", "Y", "PLAYER", 105),
        bet("R2", "Y", "BANKER", 50),
        bet("R2", "X", "PLAYER", 52),
        bet("R3", "Y", "PLAYER", 7),
    ]));
    let report = controller(backend.clone())
        .run(&seed("X"), Uuid::new_v4(), CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.account_stats["X"].stats.total_wager(), dec!(162));
    assert_eq!(report.account_stats["Y"].stats.total_wager(), dec!(162));
    assert_eq!(report.account_stats["X"].stats.total_rounds(), 2);
    assert!(backend.round_fetches().values().all(|n| *n == 1));
}

#[tokio::test]
async fn test_fixture_run() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/bets.json");
    let exec = MemoryExecutor::from_json_file(BACKEND, path).unwrap();
    let controller = TraversalController::new(
        Arc::new(exec),
        BACKEND,
        &SchemaConfig::default(),
        DetectionSettings::default(),
        None,
    )
    .unwrap();

    let report = controller
        .run(&seed("X"), Uuid::new_v4(), CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.rounds_processed, 4);
    assert_eq!(
        report.promoted_accounts,
        vec!["Y", "V", "W", "Z"].into_iter().map(String::from).collect::<Vec<_>>()
    );
    let suspicious: Vec<&str> = report.suspicious_accounts().iter().map(|s| s.as_str()).collect();
    assert_eq!(suspicious, vec!["V", "W", "X", "Y", "Z"]);
    assert!(!report.account_stats["U"].suspicious);
    assert!(!report.account_stats.contains_key("Q"));
    assert_eq!(report.side_totals.side_a, dec!(1600));
    assert_eq!(report.side_totals.side_b, dec!(1714.5));
}

#[tokio::test]
async fn test_sqlite_end_to_end() {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE round_history (\"Game Id\" TEXT, \"User Id\" TEXT, \
         \"Bet Position\" TEXT, \"BET EUR\" TEXT, \"Bet Time\" TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();

    for (round, user, pos, amount, time) in [
        ("R1", "X", "BANKER", "100.00", "2024-03-01 10:00:00"),
        ("R1", "Y", "PLAYER", "95.00", "2024-03-01 10:00:01"),
        ("R2", "X", "BANKER", "50.00", "2023-12-01 10:00:00"),
        ("R2", "K", "PLAYER", "50.00", "2023-12-01 10:00:01"),
    ] {
        sqlx::query("INSERT INTO round_history VALUES (?, ?, ?, ?, ?)")
            .bind(round)
            .bind(user)
            .bind(pos)
            .bind(amount)
            .bind(time)
            .execute(&pool)
            .await
            .unwrap();
    }

    let schema = SchemaConfig { table: "round_history".into(), ..SchemaConfig::default() };
    let executor = SqliteExecutor::from_pool("sqlite", pool, None);
    let controller = TraversalController::new(
        Arc::new(executor),
        "sqlite",
        &schema,
        DetectionSettings::default(),
        None,
    )
    .unwrap();

    let start = chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let request = SeedRequest::new(vec!["X".into()], TimeWindow::new(Some(start), None));
    let report = controller.run(&request, Uuid::new_v4(), CancelFlag::new()).await.unwrap();

    // R2 is outside the seed window
    assert_eq!(report.rounds_processed, 1);
    assert_eq!(report.account_stats["Y"].stats.common_wager, dec!(95));
    assert!(!report.account_stats.contains_key("K"));
}

async fn game_type_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE bets (\"Game Id\" TEXT, \"User Id\" TEXT, \"Bet Position\" TEXT, \
         \"BET EUR\" TEXT, \"Bet Time\" TEXT, \"Game Type\" TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();

    for (round, user, pos, game) in [
        ("R1", "X", "BANKER", "baccarat"),
        ("R1", "Y", "PLAYER", "baccarat"),
        ("R9", "Q", "BANKER", "baccarat"),
        ("R8", "Q", "PLAYER", "dragon"),
    ] {
        sqlx::query("INSERT INTO bets VALUES (?, ?, ?, '100.00', '2024-03-01 10:00:00', ?)")
            .bind(round)
            .bind(user)
            .bind(pos)
            .bind(game)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool
}

#[tokio::test]
async fn test_sqlite_seed_templates_keep_account_filter() {
    let schema = SchemaConfig { table: "bets".into(), ..SchemaConfig::default() };
    let templates = [
        "SELECT * FROM bets WHERE \"Game Type\" = 'baccarat' OR \"Game Type\" = 'dragon'",
        "SELECT * FROM bets ORDER BY \"Bet Time\"",
        "SELECT * FROM bets WHERE \"Game Id\" IN (SELECT \"Game Id\" FROM bets WHERE \"Game Type\" = 'baccarat');",
    ];

    for template in templates {
        let executor = SqliteExecutor::from_pool("sqlite", game_type_pool().await, None);
        let controller = TraversalController::new(
            Arc::new(executor),
            "sqlite",
            &schema,
            DetectionSettings::default(),
            Some(template),
        )
        .unwrap();

        let report = assert_ok!(
            controller
                .run(&seed("X"), Uuid::new_v4(), CancelFlag::new())
                .await
        );
        assert_eq!(report.rounds_processed, 1, "{template}");
        assert!(!report.account_stats.contains_key("Q"), "{template}");
        assert_eq!(report.account_stats["Y"].stats.common_rounds, 1, "{template}");
    }
}

#[tokio::test]
async fn test_service_uses_store_overrides() {
    let config = AppConfig::parse(
        r#"
        [backend]
        id = "mock"
        url_env = "OPPWATCH_DATABASE_URL"
        "#,
    )
    .unwrap();

    let path = std::env::temp_dir().join(format!("oppwatch_it_store_{}.json", Uuid::new_v4()));
    let mut store = JsonFileStore::open(&path).unwrap();
    store.set(storage::KEY_TOLERANCE, json!(0.01)).unwrap();

    let backend = Arc::new(MockBackend::new(vec![
        bet("R1", "X", "BANKER", 100),
        bet("R1", "Y", "PLAYER", 95),
    ]));
    let service = DetectionService::from_config(backend, &config, &store).unwrap();
    assert_eq!(service.settings().tolerance, dec!(0.01));

    let report = service.start(seed("X"), None).unwrap().wait().await.unwrap();
    assert!(report.matched_bets.is_empty());
    assert_eq!(report.account_stats["Y"].stats.common_wager, Decimal::ZERO);

    std::fs::remove_file(&path).unwrap();
}
