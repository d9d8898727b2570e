//! Integration tests for live queries.

mod common;

use common::{slow_tick_options, wait_for, Recorder, TestFixture};
use eddy::Connections;
use eddy::Error;
use serde_json::json;
use std::time::Duration;
use tokio_test::assert_ok;

const INSERT_ANA: &str = "INSERT INTO patients (first_name, last_name, date_of_birth, gender) \
                          VALUES ('Ana', 'Lee', '1990-01-01', 'Female')";

async fn insert_patient(conn: &eddy::Connection, first_name: &str) {
    conn.query(
        "INSERT INTO patients (first_name, last_name, date_of_birth, gender) VALUES ($1, 'Test', '2000-01-01', 'Other')",
        &[json!(first_name)],
    )
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_to_end_patient_list() {
    let fixture = TestFixture::new();
    let conn = fixture.connect().await;

    assert_ok!(
        conn.exec(
            "CREATE TABLE IF NOT EXISTS patients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                date_of_birth TEXT NOT NULL,
                gender TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )"
        )
        .await
    );

    let recorder = Recorder::default();
    let live = conn
        .subscribe(
            "SELECT * FROM patients ORDER BY created_at DESC",
            &[],
            recorder.callback(),
        )
        .await
        .unwrap();
    assert!(live.initial.is_empty());

    assert_ok!(conn.query(INSERT_ANA, &[]).await);

    assert!(wait_for(Duration::from_secs(2), || recorder.len() >= 1).await);
    let update = recorder.all().remove(0).unwrap();
    assert_eq!(update.len(), 1);
    assert_eq!(update.rows[0]["first_name"], json!("Ana"));

    live.subscription.cancel().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_from_other_connection_refreshes() {
    let fixture = TestFixture::new();
    let watcher = fixture.connect().await;
    let writer = fixture.connect().await;

    let recorder = Recorder::default();
    let live = watcher
        .subscribe(
            "SELECT first_name FROM patients WHERE first_name LIKE $1 ORDER BY id",
            &[json!("A%")],
            recorder.callback(),
        )
        .await
        .unwrap();
    assert!(live.initial.is_empty());

    insert_patient(&writer, "Bo").await;
    insert_patient(&writer, "Ann").await;

    assert!(wait_for(Duration::from_secs(2), || recorder.last_len() == Some(1)).await);
    let last = recorder.last().unwrap().unwrap();
    assert_eq!(last.rows[0]["first_name"], json!("Ann"));
    // "Bo" changed the table but not this result.
    assert!(recorder.all().iter().all(|r| r.as_ref().map(|rs| rs.len()) == Ok(1)));

    live.subscription.cancel().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_update_after_cancel() {
    let fixture = TestFixture::new();
    let conn = fixture.connect().await;
    let other = fixture.connect().await;

    let recorder = Recorder::default();
    let live = conn
        .subscribe("SELECT * FROM patients", &[], recorder.callback())
        .await
        .unwrap();

    // Keep writes in flight while cancelling.
    let writer = {
        let other = other.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                insert_patient(&other, &format!("p{i}")).await;
            }
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    live.subscription.cancel().await;
    let frozen = recorder.len();

    writer.await.unwrap();
    for i in 0..5 {
        insert_patient(&conn, &format!("late{i}")).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(recorder.len(), frozen);

    // Idempotent.
    live.subscription.cancel().await;
    live.subscription.cancel().await;
    assert!(!live.subscription.is_active().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_updates_are_never_older_than_delivered() {
    let fixture = TestFixture::new();
    let conn = fixture.connect().await;
    let other = fixture.connect().await;

    let recorder = Recorder::default();
    let live = conn
        .subscribe("SELECT count(*) AS n FROM patients", &[], recorder.callback())
        .await
        .unwrap();

    let a = {
        let conn = conn.clone();
        tokio::spawn(async move {
            for i in 0..15 {
                insert_patient(&conn, &format!("a{i}")).await;
            }
        })
    };
    let b = tokio::spawn(async move {
        for i in 0..15 {
            insert_patient(&other, &format!("b{i}")).await;
        }
    });
    a.await.unwrap();
    b.await.unwrap();

    let final_count = |r: &Recorder| {
        r.last()
            .and_then(|res| res.ok())
            .and_then(|rs| rs.first_value("n").and_then(|v| v.as_i64()))
    };
    assert!(wait_for(Duration::from_secs(2), || final_count(&recorder) == Some(30)).await);

    let counts: Vec<i64> = recorder
        .all()
        .into_iter()
        .map(|r| r.unwrap().first_value("n").and_then(|v| v.as_i64()).unwrap())
        .collect();
    assert!(counts.windows(2).all(|w| w[0] < w[1]), "out of order: {counts:?}");

    live.subscription.cancel().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrelated_table_does_not_refresh() {
    let fixture = TestFixture::new();
    let conn = fixture.connect().await;
    conn.exec("CREATE TABLE audit (entry TEXT)").await.unwrap();

    let recorder = Recorder::default();
    let live = conn
        .subscribe("SELECT * FROM patients", &[], recorder.callback())
        .await
        .unwrap();

    conn.query("INSERT INTO audit (entry) VALUES ('x')", &[])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.len(), 0);

    insert_patient(&conn, "Cy").await;
    assert!(wait_for(Duration::from_secs(2), || recorder.len() == 1).await);

    live.subscription.cancel().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscription_error_after_delegate_terminates() {
    let fixture = TestFixture::new();
    let conn = fixture.connect().await;

    let recorder = Recorder::default();
    let live = conn
        .subscribe("SELECT * FROM patients", &[], recorder.callback())
        .await
        .unwrap();

    conn.terminate().await;

    assert!(wait_for(Duration::from_secs(2), || recorder.len() == 1).await);
    assert!(matches!(recorder.last(), Some(Err(Error::Subscription(_)))));

    // Reported once, and nothing follows.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.len(), 1);
    assert!(!live.subscription.is_active().await);
    live.subscription.cancel().await;

    // New subscriptions on the dead connection fail.
    let err = conn
        .subscribe("SELECT * FROM patients", &[], |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Subscription(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_query_must_be_read_only() {
    let fixture = TestFixture::new();
    let conn = fixture.connect().await;

    let err = conn
        .subscribe("DELETE FROM patients", &[], |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Query(_)));

    let err = conn
        .subscribe("SELECT * FROM missing_table", &[], |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Query(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_subscription_unsubscribes() {
    let fixture = TestFixture::new();
    let conn = fixture.connect().await;

    let recorder = Recorder::default();
    let live = conn
        .subscribe("SELECT * FROM patients", &[], recorder.callback())
        .await
        .unwrap();
    drop(live);

    insert_patient(&conn, "Di").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_external_writer_refreshes_live_query() {
    let fixture = TestFixture::new();
    let conn = fixture.connect().await;

    let recorder = Recorder::default();
    let live = conn
        .subscribe("SELECT first_name FROM patients", &[], recorder.callback())
        .await
        .unwrap();

    // A connection outside eddy, as another process would have.
    let path = fixture.store.path().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let outside = rusqlite::Connection::open(path).unwrap();
        outside
            .execute(
                "INSERT INTO patients (first_name, last_name, date_of_birth, gender) \
                 VALUES ('Eve', 'Out', '1980-05-05', 'Female')",
                [],
            )
            .unwrap();
    })
    .await
    .unwrap();

    assert!(wait_for(Duration::from_secs(2), || recorder.last_len() == Some(1)).await);
    live.subscription.cancel().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_external_write_survives_scoped_invalidation() {
    let fixture = TestFixture::new();
    let leader = Connections::new(slow_tick_options())
        .get(&fixture.store)
        .await
        .unwrap();
    let follower = Connections::new(slow_tick_options())
        .get(&fixture.store)
        .await
        .unwrap();
    leader.exec("CREATE TABLE audit (entry TEXT)").await.unwrap();

    let recorder = Recorder::default();
    let live = follower
        .subscribe("SELECT entry FROM audit", &[], recorder.callback())
        .await
        .unwrap();
    assert!(live.initial.is_empty());

    // An outside commit to `audit`, then an in-process write to `patients`
    // before the follower's next poll.
    let path = fixture.store.path().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let outside = rusqlite::Connection::open(path).unwrap();
        outside
            .execute("INSERT INTO audit (entry) VALUES ('outside')", [])
            .unwrap();
    })
    .await
    .unwrap();
    insert_patient(&leader, "Fay").await;

    let direct = follower.query("SELECT entry FROM audit", &[]).await.unwrap();
    assert_eq!(direct.len(), 1);
    assert!(
        wait_for(Duration::from_secs(4), || recorder.last_len() == Some(1)).await,
        "live query never saw the external write"
    );

    live.subscription.cancel().await;
}
