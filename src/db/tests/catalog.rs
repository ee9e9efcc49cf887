use super::test_db;
use crate::db::*;
use crate::types::{ContentId, NaturalKey};
use crate::validation::{Algorithm, Digests};

async fn content(db: &Database, name: &str) -> ContentId {
    let mut conn = db.acquire().await.unwrap();
    Database::insert_content(
        &mut conn,
        &NaturalKey::new("file", [("path", name)]),
        &serde_json::json!({}),
    )
    .await
    .unwrap()
}

fn entry(remote: &str, content_id: ContentId, path: &str) -> NewCatalogEntry {
    let mut digests = Digests::new();
    digests.insert(Algorithm::Sha256, "ab".repeat(32));
    NewCatalogEntry {
        remote: remote.to_string(),
        content_id,
        relative_path: path.to_string(),
        url: format!("https://mirror.example/{path}"),
        size: Some(42),
        digests,
    }
}

#[tokio::test]
async fn test_record_catalog_entry_ignores_duplicates() {
    let (db, _temp_file) = test_db().await;
    let id = content(&db, "a").await;
    let mut conn = db.acquire().await.unwrap();

    assert!(
        Database::record_catalog_entry(&mut conn, &entry("upstream", id, "a.bin"))
            .await
            .unwrap()
    );
    assert!(
        !Database::record_catalog_entry(&mut conn, &entry("upstream", id, "a.bin"))
            .await
            .unwrap()
    );
    assert!(
        Database::record_catalog_entry(&mut conn, &entry("other", id, "a.bin"))
            .await
            .unwrap()
    );
    drop(conn);

    let entries = db.catalog_entries("upstream").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].url, "https://mirror.example/a.bin");
    assert_eq!(entries[0].size, Some(42));
    assert_eq!(
        entries[0].digests().unwrap().get(&Algorithm::Sha256),
        Some(&"ab".repeat(32))
    );
    assert_eq!(db.catalog_entries_for_content(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_delete_catalog_entries_for_content() {
    let (db, _temp_file) = test_db().await;
    let a = content(&db, "a").await;
    let b = content(&db, "b").await;
    let mut conn = db.acquire().await.unwrap();

    for (id, path) in [(a, "a1"), (a, "a2"), (b, "b1")] {
        Database::record_catalog_entry(&mut conn, &entry("upstream", id, path))
            .await
            .unwrap();
    }

    assert_eq!(
        Database::delete_catalog_entries(&mut conn, "upstream", &[]).await.unwrap(),
        0
    );
    assert_eq!(
        Database::delete_catalog_entries(&mut conn, "upstream", &[a]).await.unwrap(),
        2
    );
    drop(conn);

    let remaining = db.catalog_entries("upstream").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].content_id, b);
}

#[tokio::test]
async fn test_delete_catalog_entries_keeps_other_remotes() {
    let (db, _temp_file) = test_db().await;
    let a = content(&db, "a").await;
    let mut conn = db.acquire().await.unwrap();

    for remote in ["upstream", "mirror2"] {
        Database::record_catalog_entry(&mut conn, &entry(remote, a, "a.bin"))
            .await
            .unwrap();
    }

    assert_eq!(
        Database::delete_catalog_entries(&mut conn, "upstream", &[a]).await.unwrap(),
        1
    );
    drop(conn);

    assert!(db.catalog_entries("upstream").await.unwrap().is_empty());
    let kept = db.catalog_entries("mirror2").await.unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].content_id, a);
}
