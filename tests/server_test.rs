mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use common::*;
use contentsync::connection::{get_connection_map, ConnectionTarget};
use contentsync::db;
use contentsync::destination::{requests_from_keys, Destination};
use contentsync::distributor::Distributor;
use contentsync::model::{ItemStatus, META_CONNECTION_MAP};
use contentsync::queue;
use contentsync::server::{router, ApiState};
use contentsync::store::{BlogSwitch, Multisite, PostStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const TOKEN: &str = "s3cret";

fn post_json(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn distribution_body(root: i64) -> Value {
    json!({
        "origin": REMOTE_NETWORK,
        "origin_id": 17,
        "destination": {
            "ID": NETWORK,
            "blogs": { "2": { "ID": 2, "conflict_action": "replace" } }
        },
        "posts": {
            root.to_string(): {
                "ID": root,
                "blog_id": 1,
                "post_type": "page",
                "post_title": "Shared",
                "post_name": "shared",
                "post_status": "publish",
                "post_content": "from the partner",
                "meta": {
                    "synced_post_id": [format!("1-{root}-{REMOTE_NETWORK}")],
                    "synced_post_status": ["root"]
                }
            }
        }
    })
}

#[tokio::test]
async fn requests_without_token_are_rejected() {
    let env = setup().await;
    let remote = RecordingRemote::default();
    let state = Arc::new(ApiState {
        distributor: Arc::new(distributor(&env, &remote)),
        token: Some(TOKEN.into()),
    });

    for token in [None, Some("wrong")] {
        let response = router(state.clone())
            .oneshot(post_json("/contentsync/v1/distribute", token, &distribution_body(5)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }
    assert!(db::list_items(&env.pool, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn accepted_distribution_is_queued_and_imported() {
    let env = setup().await;
    let remote = RecordingRemote::default();
    let dist = Arc::new(distributor(&env, &remote));
    let state = Arc::new(ApiState {
        distributor: dist.clone(),
        token: Some(TOKEN.into()),
    });

    let response = router(state)
        .oneshot(post_json("/contentsync/v1/distribute", Some(TOKEN), &distribution_body(5)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "started");
    let item_id = body["items"][0].as_i64().unwrap();

    let item = db::fetch_item(&env.pool, item_id).await.unwrap().unwrap();
    assert_eq!(item.origin.as_deref(), Some(REMOTE_NETWORK));
    assert_eq!(item.origin_id, Some(17));

    queue::drain(&env.pool, &dist, 60).await.unwrap();
    let copies = pages_on(env.store.as_ref(), 2).await;
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].post_content, "from the partner");

    let reports = remote.reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].origin, REMOTE_NETWORK);
    assert_eq!(reports[0].origin_id, 17);
    assert_eq!(reports[0].report.status, ItemStatus::Success);
}

#[tokio::test]
async fn malformed_distribution_is_a_client_error() {
    let env = setup().await;
    let remote = RecordingRemote::default();
    let state = Arc::new(ApiState {
        distributor: Arc::new(distributor(&env, &remote)),
        token: None,
    });
    let mut body = distribution_body(5);
    body["destination"]["blogs"] = json!({});

    let response = router(state)
        .oneshot(post_json("/contentsync/v1/distribute", None, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("no blogs"));
}

async fn sent_remote_item(env: &Env, dist: &Distributor) -> (i64, i64) {
    let root = insert_page(env.store.as_ref(), 1, "shared", "").await;
    let key = format!("3|{REMOTE_NETWORK}");
    let items = dist
        .distribute_root_post(root, &requests_from_keys([key]), None)
        .await
        .unwrap();
    queue::drain(&env.pool, dist, 60).await.unwrap();
    (root, items[0])
}

fn success_report(root: i64) -> Value {
    json!({
        "network_url": REMOTE_NETWORK,
        "blog_id": 3,
        "status": "success",
        "posts": { root.to_string(): { "post_id": 88, "status": "success", "url": "https://partner.test/three/shared/" } }
    })
}

#[tokio::test]
async fn status_report_is_queued_then_completes_remote_item() {
    let env = setup().await;
    let remote = RecordingRemote::default();
    let dist = Arc::new(distributor(&env, &remote));
    let (root, item_id) = sent_remote_item(&env, &dist).await;

    let state = Arc::new(ApiState {
        distributor: dist.clone(),
        token: Some(TOKEN.into()),
    });
    let uri = format!("/contentsync/v1/items/{item_id}/status");
    let response = router(state.clone())
        .oneshot(post_json(&uri, Some(TOKEN), &success_report(root)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(read_json(response).await["status"], "queued");
    let item = db::fetch_item(&env.pool, item_id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Started);

    assert_eq!(queue::drain(&env.pool, &dist, 60).await.unwrap(), 1);
    let item = db::fetch_item(&env.pool, item_id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Success);
    let Destination::Remote(sent) = &item.destination else {
        panic!("expected a remote destination");
    };
    assert_eq!(sent.blogs[&3].posts[&root].post_id, 88);
    let target = ConnectionTarget::Remote {
        network_url: REMOTE_NETWORK.into(),
        blog_id: 3,
    };
    let map = get_connection_map(env.store.as_ref(), root).await.unwrap();
    assert_eq!(map.get(&target).map(|c| c.post_id), Some(88));

    let response = router(state.clone())
        .oneshot(post_json("/contentsync/v1/items/999/status", Some(TOKEN), &success_report(root)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let mut wrong_network = success_report(root);
    wrong_network["network_url"] = json!("https://elsewhere.test");
    let response = router(state)
        .oneshot(post_json(&uri, Some(TOKEN), &wrong_network))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(db::count_pending_tasks(&env.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn status_report_leaves_the_workers_blog_context_alone() {
    let env = setup().await;
    let remote = RecordingRemote::default();
    let dist = Arc::new(distributor(&env, &remote));
    let (root, item_id) = sent_remote_item(&env, &dist).await;
    let state = Arc::new(ApiState {
        distributor: dist.clone(),
        token: None,
    });
    let store = env.store.as_ref();
    let uri = format!("/contentsync/v1/items/{item_id}/status");

    // An import on blog 2 is suspended mid-way while the report arrives.
    let (imported, response) = tokio::join!(
        async {
            let _switch = BlogSwitch::enter(store, 2);
            tokio::task::yield_now().await;
            let id = store.insert_or_update_post(&page("imported", "")).await.unwrap();
            assert_eq!(store.current_blog_id(), 2);
            id
        },
        router(state).oneshot(post_json(&uri, None, &success_report(root))),
    );
    assert_eq!(response.unwrap().status(), StatusCode::ACCEPTED);
    assert_eq!(store.current_blog_id(), 1);

    let on_two = pages_on(store, 2).await;
    assert!(on_two.iter().any(|p| p.id == imported && p.post_name == "imported"));
    assert!(pages_on(store, 1).await.iter().all(|p| p.post_name != "imported"));

    queue::drain(&env.pool, &dist, 60).await.unwrap();
    let target = ConnectionTarget::Remote {
        network_url: REMOTE_NETWORK.into(),
        blog_id: 3,
    };
    let map = get_connection_map(store, root).await.unwrap();
    assert_eq!(map.get(&target).map(|c| c.post_id), Some(88));
    let _switch = BlogSwitch::enter(store, 2);
    assert!(store.get_post_meta(imported, META_CONNECTION_MAP).await.unwrap().is_empty());
}
