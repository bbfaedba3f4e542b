#![cfg(feature = "integration")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Storage round trips: save/fetch cycles, instance lifecycle, bulk insert,
//! and the failure modes for missing or wrong keys.

mod common;

use common::{a_book, book, setup};
use rowcrypt::{CryptError, DeleteKeyExt, EncryptedModel, KeySlot, SelectKeyExt};

#[tokio::test]
async fn save_and_retrieve_cycles() {
    let db = setup().await;
    let conn = &db.conn;

    conn.insert::<book::Entity>(a_book("The Lord of the Rings", "rosenkohl"))
        .await
        .expect("insert");

    let mut fetched = book::Entity::find()
        .with_key("rosenkohl")
        .one(conn)
        .await
        .expect("fetch")
        .expect("row");
    assert_eq!(fetched.title, "The Lord of the Rings");

    // The hydrated instance remembers its key; re-save needs no explicit key.
    fetched.title = "Harry Potter".to_owned();
    let updated = conn.update::<book::Entity>(&fetched).await.expect("update");
    assert_eq!(updated, 1);

    let fetched = book::Entity::find()
        .with_key("rosenkohl")
        .one(conn)
        .await
        .expect("fetch")
        .expect("row");
    assert_eq!(fetched.title, "Harry Potter");
}

#[tokio::test]
async fn round_trip_preserves_hostile_plaintext_and_keys() {
    let db = setup().await;
    let conn = &db.conn;

    // One key at a time: a decrypting filter touches every row of the
    // table, so rows written under other keys would make it fail.
    let hostile_keys = ["it's", "`backtick`", "DROP TABLE books", "{key}%s"];
    for (i, key) in hostile_keys.iter().enumerate() {
        let title = format!("title'{{%s}}-{i}");
        conn.insert::<book::Entity>(a_book(&title, key))
            .await
            .expect("insert");

        let fetched = book::Entity::find()
            .with_key(*key)
            .filter_eq(book::Column::Title, title.as_str())
            .one(conn)
            .await
            .expect("fetch")
            .expect("row");
        assert_eq!(fetched.title, title);

        let deleted = book::Entity::delete_many()
            .with_key(*key)
            .filter_eq(book::Column::Id, fetched.id)
            .exec(conn)
            .await
            .expect("cleanup");
        assert_eq!(deleted, 1);
    }
}

#[tokio::test]
async fn reading_with_the_wrong_key_is_a_runtime_error() {
    let db = setup().await;
    let conn = &db.conn;

    conn.insert::<book::Entity>(a_book("The Lord of the Rings", "rosenkohl"))
        .await
        .expect("insert");

    let err = book::Entity::find()
        .with_key("other")
        .one(conn)
        .await
        .expect_err("wrong key must not decrypt");
    assert!(matches!(err, CryptError::Db(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn reading_without_a_key_is_a_runtime_error() {
    let db = setup().await;
    let conn = &db.conn;

    conn.insert::<book::Entity>(a_book("The Lord of the Rings", "rosenkohl"))
        .await
        .expect("insert");

    let err = book::Entity::find()
        .without_key()
        .one(conn)
        .await
        .expect_err("unkeyed read must fail loudly");
    assert!(matches!(err, CryptError::Db(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn saving_without_a_key_fails_before_any_write() {
    let db = setup().await;
    let conn = &db.conn;

    let unkeyed = book::Model {
        key: KeySlot::default(),
        ..a_book("The Lord of the Rings", "ignored")
    };
    let err = conn
        .insert::<book::Entity>(unkeyed)
        .await
        .expect_err("insert without key must fail");
    match err {
        CryptError::MissingKey { field } => assert_eq!(field, "title"),
        other => panic!("unexpected error: {other}"),
    }

    // Nothing was written.
    let count = book::Entity::find()
        .with_key("rosenkohl")
        .count(conn)
        .await
        .expect("count");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn explicit_key_override_at_save_time() {
    let db = setup().await;
    let conn = &db.conn;

    let unkeyed = book::Model {
        key: KeySlot::default(),
        ..a_book("The Lord of the Rings", "ignored")
    };
    let saved = conn
        .insert_with_key::<book::Entity>(unkeyed, "rosenkohl")
        .await
        .expect("insert with explicit key");
    assert!(saved.bound_key().is_some());

    let count = book::Entity::find()
        .with_key("rosenkohl")
        .filter_eq(book::Column::Title, "The Lord of the Rings")
        .count(conn)
        .await
        .expect("count");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn bulk_insert_round_trip_keeps_models_plaintext() {
    let db = setup().await;
    let conn = &db.conn;

    let titles = ["one", "two", "three", "four"];
    let models: Vec<book::Model> = titles
        .iter()
        .map(|t| a_book(t, "rosenkohl"))
        .collect();

    let inserted = conn
        .insert_many::<book::Entity>(&models)
        .await
        .expect("bulk insert");
    assert_eq!(inserted, titles.len() as u64);

    // The caller's instances still expose plaintext after the call.
    for (model, title) in models.iter().zip(titles) {
        assert_eq!(model.title, title);
    }

    // Each row reads back individually under the same key.
    for title in titles {
        let fetched = book::Entity::find()
            .with_key("rosenkohl")
            .filter_eq(book::Column::Title, title)
            .one(conn)
            .await
            .expect("fetch")
            .expect("row");
        assert_eq!(fetched.title, title);
    }
}

#[tokio::test]
async fn bulk_insert_with_an_unkeyed_model_writes_nothing() {
    let db = setup().await;
    let conn = &db.conn;

    let models = vec![
        a_book("one", "rosenkohl"),
        book::Model {
            key: KeySlot::default(),
            ..a_book("two", "ignored")
        },
    ];
    let err = conn
        .insert_many::<book::Entity>(&models)
        .await
        .expect_err("bulk insert with unkeyed model must fail");
    assert!(matches!(err, CryptError::MissingKey { .. }));

    let count = book::Entity::find()
        .with_key("rosenkohl")
        .count(conn)
        .await
        .expect("count");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn refresh_reloads_under_the_remembered_key() {
    let db = setup().await;
    let conn = &db.conn;

    let mut mine = conn
        .insert::<book::Entity>(a_book("The Lord of the Rings", "rosenkohl"))
        .await
        .expect("insert");

    // Someone else updates the row under the same key.
    let touched = conn
        .update_many::<book::Entity>("rosenkohl")
        .set(book::Column::Title, "Harry Potter")
        .exec(conn)
        .await
        .expect("bulk update");
    assert_eq!(touched, 1);
    assert_eq!(mine.title, "The Lord of the Rings");

    conn.refresh::<book::Entity>(&mut mine).await.expect("refresh");
    assert_eq!(mine.title, "Harry Potter");
}
