//! The same filter must select the same entities on both backends.

use higgstv_db::dsl::{Document, Filter, FindOptions, Sort};
use higgstv_db::{CollectionSource, DocumentStore, SqliteStore, Store};
use higgstv_types::collections::{CHANNELS, USERS};
use serde_json::{Value, json};

const ALICE: &str = "0000000000000000000000000000000A";
const BOB: &str = "0000000000000000000000000000000B";

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn user(id: &str, name: &str) -> Document {
    doc(json!({
        "_id": id,
        "username": name,
        "email": format!("{}@example.com", name),
        "password": "hash",
        "created": "2024-01-01T00:00:00Z",
        "last_modified": "2024-01-01T00:00:00Z",
    }))
}

fn channel(id: &str, name: &str, kind: &str, owners: &[&str], tags: &[i64], programs: &[i64], modified: &str) -> Document {
    let contents: Vec<Value> = programs
        .iter()
        .map(|p| {
            json!({
                "_id": p,
                "name": format!("program {}", p),
                "desc": "",
                "duration": 60,
                "type": "youtube",
                "youtube_id": "abc",
                "tags": [],
                "created": "2024-01-01T00:00:00Z",
                "last_modified": "2024-01-01T00:00:00Z",
            })
        })
        .collect();
    doc(json!({
        "_id": id,
        "type": kind,
        "name": name,
        "desc": "",
        "tags": tags,
        "contents_seq": "",
        "contents": contents,
        "contents_order": [],
        "owners": owners,
        "permission": [],
        "created": "2024-01-01T00:00:00Z",
        "last_modified": modified,
    }))
}

fn seed(store: &dyn Store) {
    let users = store.collection(USERS).unwrap();
    users.insert_one(user(ALICE, "alice")).unwrap();
    users.insert_one(user(BOB, "bob")).unwrap();

    let channels = store.collection(CHANNELS).unwrap();
    for ch in [
        channel("C1", "Morning News", "default", &[ALICE], &[1, 2], &[1, 2], "2024-03-01T00:00:00Z"),
        channel("C2", "news_archive", "default", &[BOB], &[2], &[], "2024-02-01T00:00:00Z"),
        channel("C3", "Inbox", "unclassified", &[ALICE, BOB], &[], &[3], "2024-04-01T00:00:00Z"),
        channel("C4", "100% Jazz", "default", &[BOB], &[5], &[4], "2024-01-01T00:00:00Z"),
    ] {
        channels.insert_one(ch).unwrap();
    }
}

struct Pair {
    _dir: tempfile::TempDir,
    document: DocumentStore,
    sqlite: SqliteStore,
}

fn pair() -> Pair {
    let dir = tempfile::TempDir::new().unwrap();
    let document = DocumentStore::temporary().unwrap();
    let sqlite = SqliteStore::open(&dir.path().join("eq.db")).unwrap();
    seed(&document);
    seed(&sqlite);
    Pair {
        _dir: dir,
        document,
        sqlite,
    }
}

fn ids(store: &dyn Store, filter: &Filter, opts: &FindOptions) -> Vec<String> {
    store
        .collection(CHANNELS)
        .unwrap()
        .find(filter, opts)
        .unwrap()
        .into_iter()
        .map(|d| d["_id"].as_str().unwrap().to_string())
        .collect()
}

fn assert_same(p: &Pair, filter: Filter, expected: &[&str]) {
    let opts = FindOptions::sorted(Sort::default().asc("_id"));
    let left = ids(&p.document, &filter, &opts);
    let right = ids(&p.sqlite, &filter, &opts);
    assert_eq!(left, right, "backends disagree on {:?}", filter);
    assert_eq!(left, expected, "unexpected result for {:?}", filter);
}

#[test]
fn test_membership_and_sets() {
    let p = pair();
    assert_same(&p, Filter::new().eq("owners", ALICE), &["C1", "C3"]);
    assert_same(&p, Filter::new().eq("tags", 2), &["C1", "C2"]);
    assert_same(&p, Filter::new().is_in("_id", ["C2", "C4", "C9"]), &["C2", "C4"]);
    assert_same(&p, Filter::new().not_in("type", ["unclassified"]), &["C1", "C2", "C4"]);
    assert_same(&p, Filter::new().is_in("tags", [5, 1]), &["C1", "C4"]);
    assert_same(&p, Filter::new().ne("owners", BOB), &["C1"]);
    assert_same(&p, Filter::new().is_in("_id", Vec::<String>::new()), &[]);
}

#[test]
fn test_null_against_arrays() {
    let p = pair();
    // C3 has an empty tags array, which is not null
    assert_same(&p, Filter::new().eq("tags", Value::Null), &[]);
    assert_same(&p, Filter::new().ne("tags", Value::Null), &["C1", "C2", "C3", "C4"]);
    // C2 has no programs, so no program name at all
    assert_same(&p, Filter::new().eq("contents.name", Value::Null), &["C2"]);
    assert_same(&p, Filter::new().ne("contents.name", Value::Null), &["C1", "C3", "C4"]);
    assert_same(
        &p,
        Filter::new().is_in("contents.name", [Value::Null, json!("program 4")]),
        &["C2", "C4"],
    );
    assert_same(
        &p,
        Filter::new().not_in("contents.name", [Value::Null, json!("program 4")]),
        &["C1", "C3"],
    );
}

#[test]
fn test_regex_subset() {
    let p = pair();
    assert_same(&p, Filter::new().regex("name", "news", "i"), &["C1", "C2"]);
    assert_same(&p, Filter::new().regex("name", "news", ""), &["C2"]);
    assert_same(&p, Filter::new().regex("name", "^in", "i"), &["C3"]);
    assert_same(&p, Filter::new().regex("name", "100%", ""), &["C4"]);
    assert_same(&p, Filter::new().regex("name", "s_a", ""), &["C2"]);
}

#[test]
fn test_embedded_programs() {
    let p = pair();
    assert_same(&p, Filter::new().exists("contents.0", true), &["C1", "C3", "C4"]);
    assert_same(&p, Filter::new().exists("contents.1", true), &["C1"]);
    assert_same(&p, Filter::new().exists("contents.0", false), &["C2"]);
    assert_same(&p, Filter::new().eq("contents._id", 3), &["C3"]);
    assert_same(&p, Filter::new().is_in("contents._id", [2, 4]), &["C1", "C4"]);
}

#[test]
fn test_or_and_sorting() {
    let p = pair();
    let filter = Filter::new().or(vec![Filter::new().eq("tags", 5), Filter::new().eq("type", "unclassified")]);
    assert_same(&p, filter, &["C3", "C4"]);

    let opts = FindOptions {
        sort: Sort::default().desc("last_modified"),
        limit: Some(2),
        skip: Some(1),
    };
    let filter = Filter::new();
    assert_eq!(ids(&p.document, &filter, &opts), ids(&p.sqlite, &filter, &opts));
    assert_eq!(ids(&p.sqlite, &filter, &opts), vec!["C1", "C2"]);
}

#[test]
fn test_counts_match() {
    let p = pair();
    for filter in [Filter::new(), Filter::new().eq("owners", BOB), Filter::new().exists("contents.0", true)] {
        let left = p.document.collection(CHANNELS).unwrap().count_documents(&filter).unwrap();
        let right = p.sqlite.collection(CHANNELS).unwrap().count_documents(&filter).unwrap();
        assert_eq!(left, right);
    }
}
