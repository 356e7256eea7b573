//! Subscription teardown and staleness handling.

use livebind::{Binder, DocumentId, MemorySource, RawFields, RawValue, SourceOp};
use serde_json::json;
use std::sync::Arc;

fn doc(id: &str) -> DocumentId {
    DocumentId::new("items", id)
}

fn fields(value: serde_json::Value) -> RawFields {
    RawValue::from(value).into_object().expect("object payload")
}

fn with_ref(mut fields: RawFields, key: &str, target: &DocumentId) -> RawFields {
    fields.insert(key.to_string(), RawValue::Reference(target.clone()));
    fields
}

fn setup() -> (Arc<MemorySource>, Binder) {
    let source = Arc::new(MemorySource::new());
    let binder = Binder::new(source.clone());
    (source, binder)
}

#[test]
fn unbind_releases_root_and_refs() {
    let (source, binder) = setup();
    let c = doc("c");
    let d = doc("d");
    source.set(&c, fields(json!({"isC": true})));
    source.set(&d, with_ref(RawFields::new(), "ref", &c));

    binder.bind("d", d.clone()).unwrap();
    binder.unbind("d");

    assert_eq!(source.unsubscribe_count(&d), 1);
    assert_eq!(source.unsubscribe_count(&c), 1);
    assert_eq!(source.active_subscriptions(), 0);
    assert_eq!(binder.resolved("d"), None);
}

#[test]
fn unbind_releases_nested_refs() {
    let (source, binder) = setup();
    let a = doc("a");
    let c = doc("c");
    let d = doc("d");
    source.set(&a, fields(json!({"isA": true})));
    source.set(&c, with_ref(RawFields::new(), "ref", &a));
    source.set(&d, with_ref(RawFields::new(), "ref", &c));

    let resolved = binder.bind("d", d.clone()).unwrap();
    assert_eq!(resolved, json!({"ref": {"ref": {"isA": true}}}));

    binder.unbind("d");

    assert_eq!(source.unsubscribe_count(&d), 1);
    assert_eq!(source.unsubscribe_count(&c), 1);
    assert_eq!(source.unsubscribe_count(&a), 1);
    assert_eq!(source.active_subscriptions(), 0);
}

#[test]
fn unbind_releases_multiple_refs() {
    let (source, binder) = setup();
    let a = doc("a");
    let c = doc("c");
    let d = doc("d");
    source.set(&a, fields(json!({"isA": true})));
    source.set(&c, fields(json!({"isC": true})));
    let payload = with_ref(with_ref(RawFields::new(), "a", &a), "c", &c);
    source.set(&d, payload);

    let resolved = binder.bind("d", d.clone()).unwrap();
    assert_eq!(resolved, json!({"a": {"isA": true}, "c": {"isC": true}}));

    binder.unbind("d");

    assert_eq!(source.unsubscribe_count(&d), 1);
    assert_eq!(source.unsubscribe_count(&c), 1);
    assert_eq!(source.unsubscribe_count(&a), 1);
}

#[test]
fn every_subscribe_is_matched_by_an_unsubscribe() {
    let (source, binder) = setup();
    let a = doc("a");
    let b = doc("b");
    let c = doc("c");
    let d = doc("d");
    source.set(&a, fields(json!({"isA": true})));
    source.set(&b, with_ref(RawFields::new(), "ref", &a));
    source.set(&c, with_ref(RawFields::new(), "ref", &b));
    source.set(&d, with_ref(RawFields::new(), "ref", &c));

    binder.bind("d", d).unwrap();
    binder.unbind("d");

    let ops = source.ops();
    let subscribes = ops
        .iter()
        .filter(|op| matches!(op, SourceOp::SubscribeDocument(_)))
        .count();
    let unsubscribes = ops
        .iter()
        .filter(|op| matches!(op, SourceOp::UnsubscribeDocument(_)))
        .count();
    assert_eq!(subscribes, 4);
    assert_eq!(subscribes, unsubscribes);
    assert_eq!(source.active_subscriptions(), 0);
}

#[test]
fn replacing_a_ref_unsubscribes_old_before_subscribing_new() {
    let (source, binder) = setup();
    let a = doc("a");
    let c = doc("c");
    let d = doc("d");
    source.set(&a, fields(json!({"isA": true})));
    source.set(&c, fields(json!({"isC": true})));
    source.set(&d, with_ref(RawFields::new(), "ref", &c));

    binder.bind("d", d.clone()).unwrap();
    source.clear_ops();

    source.set(&d, with_ref(RawFields::new(), "ref", &a));

    assert_eq!(binder.resolved("d").unwrap(), json!({"ref": {"isA": true}}));
    assert_eq!(source.unsubscribe_count(&c), 1);
    assert_eq!(source.unsubscribe_count(&a), 0);

    // Strict order: the old target is released before the new subscribe.
    let ops = source.ops();
    let unsub_c = ops
        .iter()
        .position(|op| *op == SourceOp::UnsubscribeDocument(c.clone()))
        .expect("c released");
    let sub_a = ops
        .iter()
        .position(|op| *op == SourceOp::SubscribeDocument(a.clone()))
        .expect("a subscribed");
    assert!(unsub_c < sub_a);
}

#[test]
fn removed_field_releases_its_subscription_once() {
    let (source, binder) = setup();
    let a = doc("a");
    let b = doc("b");
    let item = doc("item");
    source.set(&a, fields(json!({"isA": true})));
    source.set(&b, fields(json!({"isB": true})));
    source.set(&item, with_ref(RawFields::new(), "a", &a));

    binder.bind("item", item.clone()).unwrap();
    assert_eq!(binder.resolved("item").unwrap(), json!({"a": {"isA": true}}));

    // Replace the whole payload; field `a` disappears.
    source.set(&item, with_ref(RawFields::new(), "b", &b));

    assert_eq!(binder.resolved("item").unwrap(), json!({"b": {"isB": true}}));
    assert_eq!(source.unsubscribe_count(&a), 1);

    // Updates to the released target no longer reach the bound value.
    source.update(&a, fields(json!({"newA": true})));
    assert_eq!(binder.resolved("item").unwrap(), json!({"b": {"isB": true}}));
    assert_eq!(source.unsubscribe_count(&a), 1);
}

#[test]
fn late_snapshot_from_superseded_subscription_is_discarded() {
    let (source, binder) = setup();
    let x = doc("x");
    let y = doc("y"); // never created
    let d = doc("d");
    source.set(&x, fields(json!({"isX": true})));
    source.set(&d, with_ref(RawFields::new(), "ref", &x));

    binder.bind("d", d.clone()).unwrap();
    assert_eq!(binder.resolved("d").unwrap(), json!({"ref": {"isX": true}}));

    // Queue an update of x as an in-flight callback, then move the field to
    // a different reference before it lands.
    source.hold(&x);
    source.update(&x, fields(json!({"isX": false})));
    source.set(&d, with_ref(RawFields::new(), "ref", &y));
    assert_eq!(binder.resolved("d").unwrap(), json!({"ref": null}));
    assert_eq!(source.unsubscribe_count(&x), 1);

    // The stale callback arrives after the swap and must not resurrect x.
    source.release_held();
    assert_eq!(binder.resolved("d").unwrap(), json!({"ref": null}));
}

#[test]
fn ref_target_deletion_nulls_value_and_keeps_subscription() {
    let (source, binder) = setup();
    let c = doc("c");
    let d = doc("d");
    source.set(&c, fields(json!({"isC": true})));
    source.set(&d, with_ref(RawFields::new(), "ref", &c));

    binder.bind("d", d).unwrap();
    source.delete(&c);

    assert_eq!(binder.resolved("d").unwrap(), json!({"ref": null}));
    assert_eq!(source.unsubscribe_count(&c), 0);

    // The reference identity is unchanged, so a re-created target resolves
    // again over the same subscription.
    source.set(&c, fields(json!({"isC": false})));
    assert_eq!(binder.resolved("d").unwrap(), json!({"ref": {"isC": false}}));
    assert_eq!(source.subscribe_count(&c), 1);
}

#[test]
fn nested_refs_die_with_their_parent_target() {
    let (source, binder) = setup();
    let a = doc("a");
    let c = doc("c");
    let d = doc("d");
    source.set(&a, fields(json!({"isA": true})));
    source.set(&c, with_ref(RawFields::new(), "ref", &a));
    source.set(&d, with_ref(RawFields::new(), "ref", &c));

    binder.bind("d", d).unwrap();
    assert_eq!(source.subscribe_count(&a), 1);

    // c stops referencing a: a's subscription is torn down underneath d.
    source.set(&c, fields(json!({"plain": 1})));

    assert_eq!(binder.resolved("d").unwrap(), json!({"ref": {"plain": 1}}));
    assert_eq!(source.unsubscribe_count(&a), 1);
}
