//! The cascade and rollback scenarios again, on SQLite.

#![cfg(feature = "sqlite")]

mod common;

use common::{Account, bank_registry, blog_registry, seed_user};
use relmap::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

fn temp_db_path() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir()
        .join(format!("relmap-parity-{}-{n}.db", std::process::id()))
        .to_string_lossy()
        .into_owned()
}

fn open(registry: &Arc<SchemaRegistry>) -> Session<SqliteStore> {
    let mut store = SqliteStore::open_memory().unwrap();
    store.create_all(registry).unwrap();
    Session::new(Arc::clone(registry), store)
}

fn count<S: Store>(session: &mut Session<S>, table: &str) -> usize {
    session.count(table, vec![]).unwrap()
}

#[test]
fn user_delete_cascades_to_posts() {
    let registry = blog_registry();
    let mut session = open(&registry);
    let user = seed_user(&mut session, "ann", &["first", "second"]);
    assert_eq!(count(&mut session, "posts"), 2);

    session.delete(user).unwrap();
    session.commit().unwrap();
    assert_eq!(count(&mut session, "users"), 0);
    assert_eq!(count(&mut session, "posts"), 0);
    assert_eq!(session.state(user).unwrap(), ObjectState::Detached);
}

#[test]
fn unlinking_one_post_deletes_it() {
    let registry = blog_registry();
    let mut session = open(&registry);
    let user = seed_user(&mut session, "ann", &["first", "second"]);

    let posts = session.related(user, "posts").unwrap();
    session.unlink(user, "posts", posts[0]).unwrap();
    session.commit().unwrap();

    let left = session.query("posts", vec![], &QueryOptions::new()).unwrap();
    assert_eq!(left, vec![posts[1]]);
    assert_eq!(session.value(posts[1], "user_id").unwrap(), Value::Int(1));
    assert_eq!(session.state(posts[0]).unwrap(), ObjectState::Detached);
}

#[test]
fn association_rows_follow_links() {
    let registry = blog_registry();
    let mut session = open(&registry);
    let user = seed_user(&mut session, "ann", &["first"]);
    let post = session.related(user, "posts").unwrap()[0];
    let tag = session.add("tags", [("label", Value::from("rust"))]).unwrap();
    session.link(post, "tags", tag).unwrap();
    session.commit().unwrap();
    assert_eq!(count(&mut session, "post_tags"), 1);

    session.delete(user).unwrap();
    session.commit().unwrap();
    assert_eq!(count(&mut session, "post_tags"), 0);
    assert_eq!(count(&mut session, "tags"), 1);
}

#[test]
fn unique_violation_rolls_back_the_whole_flush() {
    let registry = bank_registry();
    let mut session = open(&registry);
    for number in ["ACC-1", "ACC-2"] {
        session
            .add_model(&Account {
                id: None,
                number: number.to_string(),
                owner: "ann".to_string(),
                balance: 100.0,
                version: 1,
            })
            .unwrap();
    }
    session.commit().unwrap();

    let from = session.get("accounts", 1).unwrap().unwrap();
    session.set(from, "balance", 0.0).unwrap();
    let duplicate = session
        .add(
            "accounts",
            [("number", Value::from("ACC-1")), ("owner", Value::from("bob"))],
        )
        .unwrap();
    let err = session.commit().unwrap_err();
    assert!(err.is_constraint_violation(), "{err}");

    assert_eq!(session.state(duplicate).unwrap(), ObjectState::Detached);
    assert_eq!(session.value(from, "balance").unwrap(), Value::Double(100.0));
    assert_eq!(count(&mut session, "accounts"), 2);
}

#[test]
fn nowait_fails_while_another_connection_holds_the_lock() {
    let registry = bank_registry();
    let path = temp_db_path();
    let config = SqliteConfig::file(path.clone()).busy_timeout(2_000);

    let mut setup = SqliteStore::open(&config).unwrap();
    setup.create_all(&registry).unwrap();
    let mut seed = Session::new(Arc::clone(&registry), setup);
    seed.add("accounts", [("number", Value::from("ACC-1")), ("owner", Value::from("ann"))])
        .unwrap();
    seed.commit().unwrap();

    let mut holder = Session::new(Arc::clone(&registry), SqliteStore::open(&config).unwrap());
    let mut contender = Session::new(Arc::clone(&registry), SqliteStore::open(&config).unwrap());
    let lock = GetOptions::new().with_for_update(true);
    assert!(holder.get_with_options("accounts", 1, &lock).unwrap().is_some());

    let err = contender
        .get_with_options("accounts", 1, &lock.clone().nowait(true))
        .unwrap_err();
    assert!(err.is_lock_contention(), "{err}");

    holder.commit().unwrap();
    contender.rollback().unwrap();
    assert!(contender.get_with_options("accounts", 1, &lock.nowait(true)).unwrap().is_some());
    contender.commit().unwrap();

    drop((seed, holder, contender));
    let _ = std::fs::remove_file(&path);
}
