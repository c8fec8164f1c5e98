use serde_json::{json, Value};
use shared::domain::ConnectionId;
use storage::{ModuleStates, SessionStore};

fn initial_counter() -> Value {
    json!({ "counter": 0 })
}

/// Behaviour every backend must share, as seen by the dispatch engine.
pub async fn exercise_contract(store: &dyn SessionStore) {
    let missing = ConnectionId::from("missing-connection");
    assert!(store
        .get_state(&missing, "counter", &initial_counter)
        .await
        .expect_err("unknown connection")
        .is_unknown_connection());
    assert!(store
        .update_state(&missing, &ModuleStates::new())
        .await
        .expect_err("unknown connection")
        .is_unknown_connection());
    assert!(store
        .renew_connection(&missing, &[])
        .await
        .expect_err("unknown connection")
        .is_unknown_connection());

    let id = store.new_connection().await.expect("connection");
    let other = store.new_connection().await.expect("connection");
    assert_ne!(id, other);

    let state = store
        .get_state(&id, "counter", &initial_counter)
        .await
        .expect("initial state");
    assert_eq!(state, initial_counter());

    let nested = json!({
        "counter": 5,
        "ratio": 0.25,
        "big": 9_007_199_254_740_993_i64,
        "negative": -17,
        "label": "héllo",
        "flags": [true, false, null],
        "nested": { "deep": { "list": [1, { "x": "y" }] } }
    });
    let mut states = ModuleStates::new();
    states.insert("counter".into(), nested.clone());
    states.insert("session".into(), json!({ "user": null }));
    store.update_state(&id, &states).await.expect("update");

    let read_back = store
        .get_state(&id, "counter", &initial_counter)
        .await
        .expect("read back");
    assert_eq!(read_back, nested);

    let untouched = store
        .get_state(&other, "counter", &initial_counter)
        .await
        .expect("other connection");
    assert_eq!(untouched, initial_counter());

    store
        .renew_connection(&id, &["counter".to_string(), "session".to_string()])
        .await
        .expect("renew");
    let info = store.connection_info(&id).await.expect("info");
    assert_eq!(info.id, id);
}
