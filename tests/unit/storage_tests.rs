/// Database pool leasing
use game_rpcd::{DbPool, StorageError};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

fn pool(size: usize) -> (NamedTempFile, DbPool) {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let pool = DbPool::open(temp_file.path(), size).expect("Failed to open pool");
    (temp_file, pool)
}

#[tokio::test]
async fn test_leases_share_one_database() {
    let (_file, pool) = pool(2);
    let token = CancellationToken::new();

    {
        let conn = pool.lease(&token, Duration::from_secs(1)).await.unwrap();
        conn.execute_batch("CREATE TABLE receipts (id INTEGER PRIMARY KEY, game TEXT)")
            .unwrap();
        conn.execute("INSERT INTO receipts (game) VALUES (?1)", ["overland"])
            .unwrap();
    }

    let conn = pool.lease(&token, Duration::from_secs(1)).await.unwrap();
    let game: String = conn
        .query_row("SELECT game FROM receipts", [], |row| row.get(0))
        .unwrap();
    assert_eq!(game, "overland");
}

#[tokio::test]
async fn test_exhausted_pool_is_busy() {
    let (_file, pool) = pool(1);
    let token = CancellationToken::new();

    let held = pool.lease(&token, Duration::from_secs(1)).await.unwrap();
    assert_eq!(pool.available(), 0);

    let err = pool
        .lease(&token, Duration::from_millis(30))
        .await
        .err()
        .expect("second lease should time out");
    assert!(matches!(err, StorageError::Busy));

    drop(held);
    assert_eq!(pool.available(), 1);
    tokio_test::assert_ok!(pool.lease(&token, Duration::from_millis(30)).await);
}

#[tokio::test]
async fn test_cancelled_waiter_is_interrupted() {
    let (_file, pool) = pool(1);
    let holder = CancellationToken::new();
    let _held = pool.lease(&holder, Duration::from_secs(1)).await.unwrap();

    let waiter = CancellationToken::new();
    waiter.cancel();
    let err = pool
        .lease(&waiter, Duration::from_secs(5))
        .await
        .err()
        .expect("cancelled lease should fail");
    assert!(matches!(err, StorageError::Interrupted));
}
