use super::test_db;
use crate::db::*;
use crate::validation::{Algorithm, ArtifactHasher, Digests};

fn new_artifact(body: &[u8]) -> NewArtifact {
    let mut hasher = ArtifactHasher::new();
    hasher.update(body);
    let identity = hasher.finish();
    let file = format!("artifact/{}", identity.digest(Algorithm::Sha256).unwrap());
    NewArtifact { identity, file }
}

#[tokio::test]
async fn test_insert_artifact_stores_every_digest() {
    let (db, _temp_file) = test_db().await;
    let mut conn = db.acquire().await.unwrap();

    let artifact = new_artifact(b"abc");
    let id = Database::insert_artifact(&mut conn, &artifact).await.unwrap();
    drop(conn);

    let stored = db.get_artifact(id).await.unwrap().unwrap();
    assert_eq!(stored.size, 3);
    assert_eq!(stored.identity(), artifact.identity);
    assert_eq!(stored.file, artifact.file);
}

#[tokio::test]
async fn test_find_artifact_uses_reliable_digests_only() {
    let (db, _temp_file) = test_db().await;
    let mut conn = db.acquire().await.unwrap();

    let artifact = new_artifact(b"abc");
    let id = Database::insert_artifact(&mut conn, &artifact).await.unwrap();

    let mut by_sha256 = Digests::new();
    by_sha256.insert(
        Algorithm::Sha256,
        artifact.identity.digest(Algorithm::Sha256).unwrap().to_uppercase(),
    );
    let found = Database::find_artifact(&mut conn, &by_sha256).await.unwrap();
    assert_eq!(found.map(|a| a.id), Some(id));

    let mut by_md5 = Digests::new();
    by_md5.insert(
        Algorithm::Md5,
        artifact.identity.digest(Algorithm::Md5).unwrap().to_string(),
    );
    assert!(
        Database::find_artifact(&mut conn, &by_md5)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_ensure_artifact_adopts_existing_row() {
    let (db, _temp_file) = test_db().await;

    let mut tx = db.begin().await.unwrap();
    let first = Database::ensure_artifact(&mut tx, &new_artifact(b"abc"))
        .await
        .unwrap();
    let second = Database::ensure_artifact(&mut tx, &new_artifact(b"abc"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(first.was_created());
    assert_eq!(second, Saved::Existing(first.id()));
    assert_eq!(db.count_artifacts().await.unwrap(), 1);
}

#[tokio::test]
async fn test_artifacts_for_content_follow_links() {
    let (db, _temp_file) = test_db().await;
    let mut conn = db.acquire().await.unwrap();

    let content = Database::insert_content(
        &mut conn,
        &crate::types::NaturalKey::new("file", [("path", "a")]),
        &serde_json::json!({}),
    )
    .await
    .unwrap();
    let a = Database::insert_artifact(&mut conn, &new_artifact(b"a")).await.unwrap();
    let b = Database::insert_artifact(&mut conn, &new_artifact(b"b")).await.unwrap();
    Database::link_artifact(&mut conn, content, Some(b), "z.bin").await.unwrap();
    Database::link_artifact(&mut conn, content, Some(a), "a.bin").await.unwrap();
    Database::link_artifact(&mut conn, content, None, "deferred.bin").await.unwrap();
    drop(conn);

    let ids: Vec<_> = db
        .artifacts_for_content(content)
        .await
        .unwrap()
        .into_iter()
        .map(|artifact| artifact.id)
        .collect();
    assert_eq!(ids, vec![a, b]);
}
