//! # Scenario Tests
//!
//! End-to-end runs through a [`Repository`]: register types, save object
//! graphs, query aggregates and materialize them again.
//!
//! ## Groups
//! - people: Person/Tag many-to-many with an inverse view
//! - filters: negated comparisons over stored rows
//! - mechanics: Set and Map fields
//! - limits: the traversal depth bound
//! - storage: the redb backend across reopen

use mesh_core::{
    AggregateQuery, Direction, EngineConfig, FieldValue, Instance, MeshKey, ObjectGraph, ObjectId,
    Predicate, Property, Repository, ScalarType, StorageConfig, TypeMapping, TypeRef, Value,
};
use std::collections::BTreeSet;

fn register_people(repo: &Repository) {
    repo.register_type(
        TypeMapping::builder("Tag")
            .scalar("label", ScalarType::Str)
            .property(Property::many("people", TypeRef::domain("Person")).with_inverse("tags"))
            .key("id")
            .build()
            .expect("tag"),
    )
    .expect("register tag");
    repo.register_type(
        TypeMapping::builder("Person")
            .scalar("name", ScalarType::Str)
            .scalar("age", ScalarType::I64)
            .many("tags", TypeRef::domain("Tag"))
            .key("id")
            .created_by("author")
            .build()
            .expect("person"),
    )
    .expect("register person");
}

fn people() -> Repository {
    let repo = Repository::in_memory().expect("repo");
    register_people(&repo);
    repo
}

fn domain_of(repo: &Repository, type_name: &str) -> MeshKey {
    repo.catalog().realize_type(type_name).expect("realize").key.clone()
}

fn names(graph: &ObjectGraph, ids: &[ObjectId]) -> BTreeSet<String> {
    ids.iter()
        .filter_map(|id| graph.get(*id))
        .filter_map(|i| i.scalar("name").and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// Person rooted query with a `tags` child filtered to `label = "vip"`.
fn vip_query(repo: &Repository, imposed: bool) -> AggregateQuery {
    let mut query = AggregateQuery::new(domain_of(repo, "Person"));
    let root = query.root();
    let tags = query
        .add_link(root, "tags", Direction::Forward, domain_of(repo, "Tag"))
        .expect("link");
    query.filter(tags, Predicate::equal("label", "vip")).expect("filter");
    if imposed {
        query.impose(root, tags).expect("impose");
    }
    query
}

// =============================================================================
// PEOPLE AND TAGS
// =============================================================================

mod people_and_tags {
    use super::*;

    #[test]
    fn filtered_links_do_not_trim_the_owner() {
        let repo = people();
        let mut objects = ObjectGraph::new();
        let vip = objects.add(Instance::new("Tag").with("label", "vip"));
        let new = objects.add(Instance::new("Tag").with("label", "new"));
        let alice = objects.add(
            Instance::new("Person")
                .with("name", "Alice")
                .with_field("tags", FieldValue::Refs(vec![vip, new])),
        );
        let saved = repo.save(&mut objects, &[alice]).expect("save");
        assert_eq!(saved.len(), 1);

        let result = repo.query(&vip_query(&repo, false)).expect("query");
        assert_eq!(result.roots, saved);

        let (graph, roots) = repo.materialize(&result, "Person").expect("materialize");
        assert_eq!(roots.len(), 1);
        let alice = graph.get(roots[0]).expect("alice");
        assert_eq!(alice.scalar("name"), Some(&Value::str("Alice")));
        let tags = alice.field("tags").map(FieldValue::refs).unwrap_or_default();
        assert_eq!(tags.len(), 2);
        let labels: BTreeSet<_> = tags
            .iter()
            .filter_map(|id| graph.get(*id))
            .filter_map(|t| t.scalar("label").cloned())
            .collect();
        assert_eq!(labels, BTreeSet::from([Value::str("new"), Value::str("vip")]));
    }

    #[test]
    fn imposition_excludes_owners_without_a_match() {
        let repo = people();
        let mut objects = ObjectGraph::new();
        let vip = objects.add(Instance::new("Tag").with("label", "vip"));
        let new = objects.add(Instance::new("Tag").with("label", "new"));
        let alice = objects.add(
            Instance::new("Person")
                .with("name", "Alice")
                .with_field("tags", FieldValue::Refs(vec![vip, new])),
        );
        let bob = objects.add(
            Instance::new("Person")
                .with("name", "Bob")
                .with_field("tags", FieldValue::Refs(vec![new])),
        );
        repo.save(&mut objects, &[alice, bob]).expect("save");
        let alice_key = objects.get(alice).and_then(|i| i.key.clone()).expect("key");

        let open = repo.query(&vip_query(&repo, false)).expect("query");
        assert_eq!(open.roots.len(), 2);

        let imposed = repo.query(&vip_query(&repo, true)).expect("query");
        assert_eq!(imposed.roots, vec![alice_key]);
        let (graph, roots) = repo.materialize(&imposed, "Person").expect("materialize");
        assert_eq!(names(&graph, &roots), BTreeSet::from(["Alice".to_string()]));
    }

    #[test]
    fn inverse_view_reaches_owners() {
        let repo = people();
        let mut objects = ObjectGraph::new();
        let vip = objects.add(Instance::new("Tag").with("label", "vip"));
        let alice = objects.add(
            Instance::new("Person")
                .with("name", "Alice")
                .with_field("tags", FieldValue::Refs(vec![vip])),
        );
        let bob = objects.add(
            Instance::new("Person")
                .with("name", "Bob")
                .with_field("tags", FieldValue::Refs(vec![vip])),
        );
        repo.save(&mut objects, &[alice, bob]).expect("save");

        let (graph, roots) = repo.load("Tag", None).expect("load");
        assert_eq!(roots.len(), 1);
        let people = graph
            .get(roots[0])
            .and_then(|t| t.field("people"))
            .map(FieldValue::refs)
            .unwrap_or_default();
        assert_eq!(
            names(&graph, &people),
            BTreeSet::from(["Alice".to_string(), "Bob".to_string()])
        );
    }

    #[test]
    fn resaving_replaces_links() {
        let repo = people();
        let mut objects = ObjectGraph::new();
        let vip = objects.add(Instance::new("Tag").with("label", "vip"));
        let new = objects.add(Instance::new("Tag").with("label", "new"));
        let alice = objects.add(
            Instance::new("Person")
                .with("name", "Alice")
                .with_field("tags", FieldValue::Refs(vec![vip, new])),
        );
        repo.save(&mut objects, &[alice]).expect("save");

        objects.set(alice, "tags", FieldValue::Refs(vec![new]));
        repo.save(&mut objects, &[alice]).expect("resave");

        let imposed = repo.query(&vip_query(&repo, true)).expect("query");
        assert!(imposed.roots.is_empty());
        let (graph, roots) = repo.load("Person", None).expect("load");
        let tags = graph
            .get(roots[0])
            .and_then(|p| p.field("tags"))
            .map(FieldValue::refs)
            .unwrap_or_default();
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn resaving_a_null_scalar_clears_it() {
        let repo = people();
        let mut objects = ObjectGraph::new();
        let alice = objects.add(Instance::new("Person").with("name", "Alice").with("age", 30_i64));
        repo.save(&mut objects, &[alice]).expect("save");

        objects.set(alice, "age", FieldValue::Null);
        repo.save(&mut objects, &[alice]).expect("resave");

        let (graph, roots) = repo.load("Person", None).expect("load");
        assert_eq!(roots.len(), 1);
        let loaded = graph.get(roots[0]).expect("alice");
        assert_eq!(loaded.field("age"), Some(&FieldValue::Null));
        assert_eq!(loaded.scalar("name"), Some(&Value::str("Alice")));
    }

    #[test]
    fn saved_instances_carry_keys_and_roles() {
        let repo = people();
        let mut objects = ObjectGraph::new();
        let alice = objects.add(Instance::new("Person").with("name", "Alice"));
        let keys = repo.save(&mut objects, &[alice]).expect("save");

        let alice = objects.get(alice).expect("alice");
        assert_eq!(alice.key.as_ref(), Some(&keys[0]));
        assert_eq!(alice.scalar("id"), Some(&Value::Key(keys[0].clone())));
        assert!(alice.scalar("author").is_some());
    }

    #[test]
    fn query_survives_json() {
        let repo = people();
        let query = vip_query(&repo, true);
        let wire = AggregateQuery::from_json(&query.to_json().expect("json")).expect("parse");
        assert_eq!(
            repo.query(&wire).expect("query"),
            repo.query(&query).expect("query")
        );
    }
}

// =============================================================================
// FILTERS
// =============================================================================

mod filters {
    use super::*;

    #[test]
    fn negated_comparison_admits_missing_values() {
        let repo = people();
        let mut objects = ObjectGraph::new();
        let carol = objects.add(Instance::new("Person").with("name", "Carol"));
        let dave = objects.add(Instance::new("Person").with("name", "Dave").with("age", 25_i64));
        let erin = objects.add(Instance::new("Person").with("name", "Erin").with("age", 35_i64));
        repo.save(&mut objects, &[carol, dave, erin]).expect("save");

        let filter = !Predicate::greater("age", 30_i64);
        let (graph, roots) = repo.load("Person", Some(filter)).expect("load");
        assert_eq!(
            names(&graph, &roots),
            BTreeSet::from(["Carol".to_string(), "Dave".to_string()])
        );
    }

    #[test]
    fn delete_removes_rows_and_links() {
        let repo = people();
        let mut objects = ObjectGraph::new();
        let vip = objects.add(Instance::new("Tag").with("label", "vip"));
        let alice = objects.add(
            Instance::new("Person")
                .with("name", "Alice")
                .with_field("tags", FieldValue::Refs(vec![vip])),
        );
        repo.save(&mut objects, &[alice]).expect("save");

        let removed = repo
            .delete(&domain_of(&repo, "Person"), &Predicate::equal("name", "Alice"))
            .expect("delete");
        assert_eq!(removed.len(), 1);

        let (graph, roots) = repo.load("Tag", None).expect("load");
        let people = graph
            .get(roots[0])
            .and_then(|t| t.field("people"))
            .map(FieldValue::refs)
            .unwrap_or_default();
        assert!(people.is_empty());
    }
}

// =============================================================================
// MECHANICS
// =============================================================================

mod mechanics {
    use super::*;
    use std::collections::BTreeMap;

    fn profiles() -> Repository {
        let repo = Repository::in_memory().expect("repo");
        let set = |arg| TypeRef::generic_domain("Set", vec![arg]);
        let map = |arg| TypeRef::generic_domain("Map", vec![arg]);
        repo.register_type(
            TypeMapping::builder("Profile")
                .scalar("name", ScalarType::Str)
                .one("labels", set(TypeRef::Scalar(ScalarType::Str)))
                .one("scores", map(TypeRef::Scalar(ScalarType::I64)))
                .one("pals", set(TypeRef::domain("Profile")))
                .one("named", map(TypeRef::domain("Profile")))
                .key("id")
                .build()
                .expect("profile"),
        )
        .expect("register");
        repo
    }

    fn by_name(graph: &ObjectGraph, name: &str) -> ObjectId {
        graph
            .iter()
            .find(|(_, i)| i.scalar("name") == Some(&Value::str(name)))
            .map(|(id, _)| id)
            .expect("instance")
    }

    #[test]
    fn scalar_sets_and_maps_round_trip() {
        let repo = profiles();
        let mut objects = ObjectGraph::new();
        let ada = objects.add(
            Instance::new("Profile")
                .with("name", "ada")
                .with_field(
                    "labels",
                    FieldValue::Values(vec![Value::str("x"), Value::str("y"), Value::str("x")]),
                )
                .with_field(
                    "scores",
                    FieldValue::Entries(BTreeMap::from([(
                        "math".to_string(),
                        FieldValue::Scalar(Value::I64(3)),
                    )])),
                ),
        );
        repo.save(&mut objects, &[ada]).expect("save");

        let (graph, roots) = repo.load("Profile", None).expect("load");
        assert_eq!(roots.len(), 1);
        let ada = graph.get(roots[0]).expect("ada");
        assert_eq!(
            ada.field("labels"),
            Some(&FieldValue::Values(vec![Value::str("x"), Value::str("y")]))
        );
        assert_eq!(
            ada.field("scores"),
            Some(&FieldValue::Entries(BTreeMap::from([(
                "math".to_string(),
                FieldValue::Scalar(Value::I64(3)),
            )])))
        );
    }

    #[test]
    fn domain_sets_and_maps_round_trip() {
        let repo = profiles();
        let mut objects = ObjectGraph::new();
        let ada = objects.add(Instance::new("Profile").with("name", "ada"));
        let bea = objects.add(
            Instance::new("Profile")
                .with("name", "bea")
                .with_field("pals", FieldValue::Refs(vec![ada]))
                .with_field(
                    "named",
                    FieldValue::Entries(BTreeMap::from([("best".to_string(), FieldValue::Ref(ada))])),
                ),
        );
        repo.save(&mut objects, &[bea]).expect("save");

        let (graph, roots) = repo
            .load("Profile", Some(Predicate::equal("name", "bea")))
            .expect("load");
        assert_eq!(roots.len(), 1);
        let ada = by_name(&graph, "ada");
        let bea = graph.get(roots[0]).expect("bea");
        assert_eq!(bea.field("pals"), Some(&FieldValue::Refs(vec![ada])));
        assert_eq!(
            bea.field("named"),
            Some(&FieldValue::Entries(BTreeMap::from([("best".to_string(), FieldValue::Ref(ada))])))
        );
    }

    #[test]
    fn resaving_a_set_replaces_its_items() {
        let repo = profiles();
        let mut objects = ObjectGraph::new();
        let ada = objects.add(Instance::new("Profile").with("name", "ada"));
        let cy = objects.add(Instance::new("Profile").with("name", "cy"));
        let bea = objects.add(
            Instance::new("Profile")
                .with("name", "bea")
                .with_field("pals", FieldValue::Refs(vec![ada, cy])),
        );
        repo.save(&mut objects, &[bea]).expect("save");
        objects.set(bea, "pals", FieldValue::Refs(vec![cy]));
        repo.save(&mut objects, &[bea]).expect("resave");

        let (graph, roots) = repo
            .load("Profile", Some(Predicate::equal("name", "bea")))
            .expect("load");
        let pals = graph
            .get(roots[0])
            .and_then(|b| b.field("pals"))
            .map(FieldValue::refs)
            .unwrap_or_default();
        assert_eq!(names(&graph, &pals), BTreeSet::from(["cy".to_string()]));
    }
}

// =============================================================================
// LIMITS
// =============================================================================

mod limits {
    use super::*;

    /// A `friends` chain p0 -> p1 -> ... -> p{len-1}. Returns the keys in order.
    fn chain(repo: &Repository, len: usize) -> Vec<MeshKey> {
        repo.register_type(
            TypeMapping::builder("Person")
                .scalar("name", ScalarType::Str)
                .many("friends", TypeRef::domain("Person"))
                .build()
                .expect("person"),
        )
        .expect("register");
        let mut objects = ObjectGraph::new();
        let ids: Vec<ObjectId> = (0..len)
            .map(|i| objects.add(Instance::new("Person").with("name", format!("p{i}"))))
            .collect();
        for pair in ids.windows(2) {
            objects.set(pair[0], "friends", FieldValue::Refs(vec![pair[1]]));
        }
        repo.save(&mut objects, &ids[..1]).expect("save");
        ids.iter()
            .map(|id| objects.get(*id).and_then(|p| p.key.clone()).expect("key"))
            .collect()
    }

    #[test]
    fn depth_bound_truncates_recursive_chains() {
        let config = EngineConfig {
            max_depth: 2,
            ..EngineConfig::default()
        };
        let repo = Repository::from_config(config).expect("repo");
        let keys = chain(&repo, 5);

        let query = repo
            .query_shape("Person", Some(Predicate::equal("name", "p0")))
            .expect("shape");
        let resolved = repo.query_keys(&query).expect("keys");
        assert!(resolved.truncated);
        assert_eq!(resolved.roots, vec![keys[0].clone()]);
        assert_eq!(
            resolved.keys(query.root()),
            keys[..3].iter().cloned().collect::<BTreeSet<_>>()
        );

        // the last followed link still loads its far endpoint, nothing beyond
        let result = repo.query(&query).expect("query");
        assert!(result.truncated);
        assert!(result.object(&keys[3]).is_some());
        assert!(result.object(&keys[4]).is_none());
        let (graph, roots) = repo.materialize(&result, "Person").expect("materialize");
        assert_eq!(roots.len(), 1);
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn chains_within_the_bound_are_complete() {
        let config = EngineConfig {
            max_depth: 8,
            ..EngineConfig::default()
        };
        let repo = Repository::from_config(config).expect("repo");
        let keys = chain(&repo, 5);

        let query = repo
            .query_shape("Person", Some(Predicate::equal("name", "p0")))
            .expect("shape");
        let resolved = repo.query_keys(&query).expect("keys");
        assert!(!resolved.truncated);
        assert_eq!(
            resolved.keys(query.root()),
            keys.iter().cloned().collect::<BTreeSet<_>>()
        );
    }
}

// =============================================================================
// STORAGE
// =============================================================================

mod storage {
    use super::*;

    #[test]
    fn redb_repository_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            actor: "importer".to_string(),
            storage: StorageConfig::Redb {
                path: dir.path().join("mesh.redb"),
            },
            ..EngineConfig::default()
        };

        {
            let repo = Repository::from_config(config.clone()).expect("open");
            register_people(&repo);
            let mut objects = ObjectGraph::new();
            let vip = objects.add(Instance::new("Tag").with("label", "vip"));
            let alice = objects.add(
                Instance::new("Person")
                    .with("name", "Alice")
                    .with_field("tags", FieldValue::Refs(vec![vip])),
            );
            repo.save(&mut objects, &[alice]).expect("save");
        }

        let repo = Repository::from_config(config).expect("reopen");
        register_people(&repo);
        let result = repo.query(&vip_query(&repo, true)).expect("query");
        assert_eq!(result.roots.len(), 1);
        let (graph, roots) = repo.materialize(&result, "Person").expect("materialize");
        let alice = graph.get(roots[0]).expect("alice");
        assert_eq!(alice.scalar("author"), Some(&Value::str("importer")));
    }

    #[test]
    fn config_files_open_repositories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mesh.toml");
        let db = dir.path().join("data.redb");
        std::fs::write(
            &path,
            format!("actor = \"loader\"\n\n[storage]\nkind = \"redb\"\npath = {:?}\n", db),
        )
        .expect("write");

        let config = EngineConfig::load(&path).expect("load");
        let repo = Repository::from_config(config).expect("open");
        assert_eq!(repo.config().actor, "loader");
    }
}
