use super::test_db;
use crate::types::NaturalKey;

/// Verify that querying the database after closing the pool returns an error
/// rather than hanging or panicking.
#[tokio::test]
async fn test_find_content_after_pool_close_returns_error() {
    let (db, _temp_file) = test_db().await;

    db.pool().close().await;

    let key = NaturalKey::new("file", [("path", "a")]);
    let result = db.find_content_by_key(&key).await;
    assert!(
        result.is_err(),
        "find_content_by_key after pool close should return an error, got: {:?}",
        result
    );
}

/// Verify that starting a transaction after closing the pool returns an error
#[tokio::test]
async fn test_begin_after_pool_close_returns_error() {
    let (db, _temp_file) = test_db().await;

    db.pool().close().await;

    assert!(db.begin().await.is_err());
    assert!(db.create_repository("late").await.is_err());
}
