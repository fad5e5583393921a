//! Relationship loading and queued foreign keys.

mod common;

use common::{CountingStore, blog_registry, seed_user, text};
use relmap::prelude::*;
use std::sync::atomic::Ordering;

fn seeded() -> (MemoryDatabase, SessionFactory) {
    let registry = blog_registry();
    let db = MemoryDatabase::from_registry(&registry);
    let factory = SessionFactory::from_shared(registry);
    let mut setup = factory.session(db.connect());
    seed_user(&mut setup, "ann", &["a1", "a2"]);
    seed_user(&mut setup, "bob", &["b1", "b2"]);
    seed_user(&mut setup, "cid", &["c1", "c2"]);
    let posts = setup.query("posts", vec![], &QueryOptions::new()).unwrap();
    let rust = setup.add("tags", [("label", Value::from("rust"))]).unwrap();
    let sql = setup.add("tags", [("label", Value::from("sql"))]).unwrap();
    for post in &posts {
        setup.link(*post, "tags", rust).unwrap();
    }
    setup.link(posts[0], "tags", sql).unwrap();
    setup.commit().unwrap();
    (db, factory)
}

#[test]
fn batch_loading_fetches_all_children_in_one_query() {
    let (db, factory) = seeded();
    let (store, queries) = CountingStore::new(db.connect());
    let mut session = factory.session(store);

    let users = session
        .query("users", vec![], &QueryOptions::new().order_by(OrderBy::asc("name")))
        .unwrap();
    assert_eq!(users.len(), 3);
    assert_eq!(queries.load(Ordering::SeqCst), 1);

    let filled = session.load_relationship_batch(&users, "posts").unwrap();
    assert_eq!(filled, 3);
    assert_eq!(queries.load(Ordering::SeqCst), 2);

    for user in &users {
        let posts = session.related(*user, "posts").unwrap();
        assert_eq!(posts.len(), 2);
        for post in posts {
            assert_eq!(session.related(post, "author").unwrap(), vec![*user]);
        }
    }
    assert_eq!(queries.load(Ordering::SeqCst), 2);

    // Slots that are already loaded are skipped.
    assert_eq!(session.load_relationship_batch(&users, "posts").unwrap(), 0);
    assert_eq!(queries.load(Ordering::SeqCst), 2);
}

#[test]
fn lazy_loading_costs_one_query_per_parent() {
    let (db, factory) = seeded();
    let (store, queries) = CountingStore::new(db.connect());
    let mut session = factory.session(store);

    let users = session.query("users", vec![], &QueryOptions::new()).unwrap();
    for user in &users {
        session.related(*user, "posts").unwrap();
    }
    assert_eq!(queries.load(Ordering::SeqCst), 1 + users.len());
}

#[test]
fn collections_come_back_in_declared_order() {
    let (db, factory) = seeded();
    let mut session = factory.session(db.connect());
    let ann = session
        .query_one("users", vec![Condition::eq("name", "ann")], &QueryOptions::new())
        .unwrap();

    let extra = session.add("posts", [("title", Value::from("a0"))]).unwrap();
    session.link(ann, "posts", extra).unwrap();
    session.commit().unwrap();

    let titles: Vec<String> = session
        .related(ann, "posts")
        .unwrap()
        .into_iter()
        .map(|p| text(&session.value(p, "title").unwrap()).to_string())
        .collect();
    assert_eq!(titles, ["a0", "a1", "a2"]);
}

#[test]
fn many_to_many_batch_loads_through_the_link_table() {
    let (db, factory) = seeded();
    let (store, queries) = CountingStore::new(db.connect());
    let mut session = factory.session(store);

    let posts = session.query("posts", vec![], &QueryOptions::new()).unwrap();
    assert_eq!(posts.len(), 6);
    let before = queries.load(Ordering::SeqCst);
    session.load_relationship_batch(&posts, "tags").unwrap();
    // One read of the association rows, one of the tags they name.
    assert_eq!(queries.load(Ordering::SeqCst), before + 2);

    let first_tags = session.related(posts[0], "tags").unwrap();
    assert_eq!(first_tags.len(), 2);
    for post in &posts[1..] {
        assert_eq!(session.related(*post, "tags").unwrap().len(), 1);
    }
    assert_eq!(queries.load(Ordering::SeqCst), before + 2);
}

#[test]
fn batch_loading_rejects_mixed_tables() {
    let (db, factory) = seeded();
    let mut session = factory.session(db.connect());
    let user = session.get("users", 1).unwrap().unwrap();
    let post = session.get("posts", 1).unwrap().unwrap();
    assert!(session.load_relationship_batch(&[user, post], "posts").is_err());
    assert_eq!(session.load_relationship_batch(&[], "posts").unwrap(), 0);
}

#[test]
fn load_relationship_sees_rows_added_elsewhere() {
    let (db, factory) = seeded();
    let mut session = factory.session(db.connect());
    let ann = session.get("users", 1).unwrap().unwrap();
    assert_eq!(session.related(ann, "posts").unwrap().len(), 2);
    session.commit().unwrap();

    let mut other = factory.session(db.connect());
    let other_ann = other.get("users", 1).unwrap().unwrap();
    let post = other.add("posts", [("title", Value::from("a3"))]).unwrap();
    other.link(other_ann, "posts", post).unwrap();
    other.commit().unwrap();

    assert_eq!(session.load_relationship(ann, "posts").unwrap().len(), 3);
}

#[test]
fn queued_foreign_keys_resolve_after_the_parent_insert() {
    let registry = blog_registry();
    let db = MemoryDatabase::from_registry(&registry);
    let mut session = Session::new(registry, db.connect());

    let posts: Vec<EntityId> = ["x", "y"]
        .iter()
        .map(|t| session.add("posts", [("title", Value::from(*t))]).unwrap())
        .collect();
    let user = session.add("users", [("name", Value::from("dee"))]).unwrap();
    for post in &posts {
        session.link(*post, "author", user).unwrap();
        assert!(session.entity(*post).unwrap().get("user_id").is_null());
    }
    assert_eq!(session.related(user, "posts").unwrap(), posts);

    session.flush().unwrap();
    let key = session.value(user, "id").unwrap();
    assert!(!key.is_null());
    for post in &posts {
        assert_eq!(session.value(*post, "user_id").unwrap(), key);
        assert!(!session.is_dirty(*post).unwrap());
    }
    session.commit().unwrap();
    assert_eq!(
        session.count("posts", vec![Condition::eq("user_id", key)]).unwrap(),
        2
    );
}

#[test]
fn deleting_a_pending_parent_discards_its_queued_children() {
    let registry = blog_registry();
    let db = MemoryDatabase::from_registry(&registry);
    let mut session = Session::new(registry, db.connect());

    let user = session.add("users", [("name", Value::from("eve"))]).unwrap();
    let tag = session.add("tags", [("label", Value::from("draft"))]).unwrap();
    let post = session.add("posts", [("title", Value::from("z"))]).unwrap();
    session.link(post, "author", user).unwrap();
    session.link(post, "tags", tag).unwrap();
    session.unlink(post, "tags", tag).unwrap();

    // Discarding the user takes the post with it through the cascade.
    session.delete(user).unwrap();
    assert!(session.is_removed(user).unwrap());
    session.commit().unwrap();

    assert_eq!(db.row_count("users"), 0);
    assert_eq!(db.row_count("posts"), 0);
    assert_eq!(db.row_count("tags"), 1);
    assert_eq!(session.state(post).unwrap(), ObjectState::Detached);
}
