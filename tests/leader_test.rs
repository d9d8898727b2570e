//! Integration tests for leader election, write forwarding and failover.

mod common;

use common::{wait_for, TestFixture};
use eddy::leader::lease;
use eddy::{Connection, Error, LeaderStatus};
use futures::StreamExt;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;

fn leaders(conns: &[Connection]) -> usize {
    conns
        .iter()
        .filter(|c| c.leader_status() == LeaderStatus::Leader)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exactly_one_leader() {
    let fixture = TestFixture::new();
    let mut conns = Vec::new();
    for _ in 0..3 {
        conns.push(fixture.connect().await);
    }

    assert_eq!(conns[0].leader_status(), LeaderStatus::Leader);
    // Several renewal periods later, still a single leader.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(leaders(&conns), 1);
    assert_eq!(conns[0].leader_status(), LeaderStatus::Leader);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_follower_writes_are_forwarded() {
    let fixture = TestFixture::new();
    let leader = fixture.connect().await;
    let follower = fixture.connect().await;
    assert_eq!(follower.leader_status(), LeaderStatus::Follower);

    let inserted = follower
        .query(
            "INSERT INTO patients (first_name, last_name, date_of_birth, gender) \
             VALUES ($1, 'Lee', '1990-01-01', 'Female') RETURNING id",
            &[json!("Ana")],
        )
        .await
        .unwrap();
    assert_eq!(inserted.first_value("id"), Some(&json!(1)));

    let seen = leader
        .query("SELECT first_name FROM patients", &[])
        .await
        .unwrap();
    assert_eq!(seen.first_value("first_name"), Some(&json!("Ana")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failover_after_leader_terminates() {
    let fixture = TestFixture::new();
    let leader = fixture.connect().await;
    let a = fixture.connect().await;
    let b = fixture.connect().await;
    assert_eq!(leader.leader_status(), LeaderStatus::Leader);

    leader.terminate().await;

    let survivors = [a.clone(), b.clone()];
    assert!(
        wait_for(Duration::from_secs(2), || leaders(&survivors) == 1).await,
        "no new leader elected"
    );

    // A write retried after failover succeeds from either survivor.
    for conn in &survivors {
        assert_ok!(
            conn.query(
                "INSERT INTO patients (first_name, last_name, date_of_birth, gender) \
                 VALUES ('Bo', 'Kim', '1985-02-02', 'Male')",
                &[],
            )
            .await
        );
    }
    let count = a.query("SELECT count(*) AS n FROM patients", &[]).await.unwrap();
    assert_eq!(count.first_value("n"), Some(&json!(2)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failover_after_lease_expiry() {
    let fixture = TestFixture::new();
    let leader = fixture.connect().await;
    let follower = fixture.connect().await;

    // Seize the lease from outside until it lapses, as a stalled holder would.
    let lease_path = fixture.store.lease_path().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let conn = rusqlite::Connection::open(lease_path).unwrap();
        conn.busy_timeout(Duration::from_secs(2)).unwrap();
        conn.execute(
            "INSERT INTO leader_lease (id, holder, expires_at) VALUES (1, 'stalled', ?1)
             ON CONFLICT(id) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at",
            [eddy::now_millis() + 1_000],
        )
        .unwrap();
    })
    .await
    .unwrap();

    // The old leader notices it lost the lease and refuses to write.
    assert!(
        wait_for(Duration::from_secs(1), || leader.leader_status() == LeaderStatus::Follower).await
    );
    let err = leader
        .query("DELETE FROM patients", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeadershipLost(_)), "got {err:?}");
    assert!(err.is_retryable());

    // Once the stalled lease expires, someone takes over and writes work again.
    let conns = [leader.clone(), follower.clone()];
    assert!(wait_for(Duration::from_secs(3), || leaders(&conns) == 1).await);
    assert_ok!(follower.query("DELETE FROM patients", &[]).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_on_leader_change_callback() {
    let fixture = TestFixture::new();
    let leader = fixture.connect().await;
    let follower = fixture.connect().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _watch = follower.on_leader_change(move |event| sink.lock().unwrap().push(event));

    leader.terminate().await;

    assert!(wait_for(Duration::from_secs(2), || !events.lock().unwrap().is_empty()).await);
    let events = events.lock().unwrap();
    assert_eq!(events[0].status, LeaderStatus::Leader);
    assert_eq!(events[0].delegate_id, follower.delegate_id());
    assert_eq!(follower.leader_status(), LeaderStatus::Leader);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leadership_changes_stream() {
    let fixture = TestFixture::new();
    let leader = fixture.connect().await;
    let follower = fixture.connect().await;
    let mut changes = Box::pin(follower.leadership_changes());

    leader.terminate().await;

    let event = tokio::time::timeout(Duration::from_secs(2), changes.next())
        .await
        .expect("no leadership change")
        .expect("stream ended");
    assert_eq!(event.status, LeaderStatus::Leader);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminated_leader_releases_lease() {
    let fixture = TestFixture::new();
    let only = fixture.connect().await;
    let holder = only.delegate_id().to_string();

    only.terminate().await;

    let lease_path = fixture.store.lease_path().to_path_buf();
    let current = tokio::task::spawn_blocking(move || {
        let conn = rusqlite::Connection::open(lease_path).unwrap();
        lease::read_lease(&conn).unwrap()
    })
    .await
    .unwrap();
    assert!(!current.is_some_and(|l| l.holder == holder));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writes_in_flight_during_leader_termination() {
    let fixture = TestFixture::new();
    let leader = fixture.connect().await;
    let follower = fixture.connect().await;
    assert_eq!(follower.leader_status(), LeaderStatus::Follower);

    let writes = {
        let follower = follower.clone();
        tokio::spawn(async move {
            let mut outcomes = Vec::new();
            for i in 0..40 {
                let outcome = tokio::time::timeout(
                    Duration::from_secs(5),
                    follower.query(
                        "INSERT INTO patients (first_name, last_name, date_of_birth, gender) \
                         VALUES ($1, 'Lee', '1990-01-01', 'Female')",
                        &[json!(format!("p{i}"))],
                    ),
                )
                .await
                .expect("write hung during failover");
                outcomes.push(outcome);
            }
            outcomes
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    leader.terminate().await;

    let outcomes = writes.await.unwrap();
    for outcome in &outcomes {
        match outcome {
            Ok(_) | Err(Error::LeadershipLost(_)) => {}
            Err(other) => panic!("unexpected error during failover: {other:?}"),
        }
    }
    let committed = outcomes.iter().filter(|o| o.is_ok()).count();

    // Retried after failover, the write lands on the new leader.
    assert!(wait_for(Duration::from_secs(2), || follower.leader_status() == LeaderStatus::Leader).await);
    assert_ok!(
        follower
            .query(
                "INSERT INTO patients (first_name, last_name, date_of_birth, gender) \
                 VALUES ('retry', 'Lee', '1990-01-01', 'Female')",
                &[],
            )
            .await
    );
    let count = follower
        .query("SELECT count(*) AS n FROM patients", &[])
        .await
        .unwrap();
    let n = count.first_value("n").and_then(|v| v.as_i64()).unwrap();
    assert_eq!(n, i64::try_from(committed).unwrap() + 1);
}
