mod common;

use adieu_db::{events, outbox, rooms};
use adieu_types::{now_millis, EventId, Membership, OwnedEventId, RoomId, RoomVersionId, UserId};
use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use common::*;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn fetch_template(server: &TestServer) -> Value {
    let uri = format!("/_matrix/federation/v1/make_leave/{ROOM}/{USER}");
    let request = signed_request("GET", &uri, "b.org", &remote_key(), None);
    let response = server.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["event"].clone()
}

fn send_leave_uri(api: &str, room: &str, event_id: &str) -> String {
    format!(
        "/_matrix/federation/{api}/send_leave/{room}/{}",
        encode_path(event_id)
    )
}

async fn put_leave(server: &TestServer, uri: &str, origin: &str, event: &Value) -> (StatusCode, Value) {
    let request = signed_request("PUT", uri, origin, &remote_key(), Some(event));
    let response = server.app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

fn queued_destinations(server: &TestServer) -> Vec<String> {
    let conn = server.pool.get().unwrap();
    outbox::pending(&conn, 100)
        .unwrap()
        .into_iter()
        .map(|entry| entry.destination.to_string())
        .collect()
}

#[tokio::test]
async fn leave_handshake_completes_for_every_id_format() {
    for version in [RoomVersionId::V1, RoomVersionId::V3, RoomVersionId::V4, RoomVersionId::V10] {
        let server = setup_app(version.clone(), u64::MAX);
        let template = fetch_template(&server).await;
        let (event_id, event) = sign_template(&version, &template, "$leave:b.org");

        let uri = send_leave_uri("v2", ROOM, &event_id);
        let (status, body) = put_leave(&server, &uri, "b.org", &event).await;
        assert_eq!(status, StatusCode::OK, "room version {version}: {body}");
        assert_eq!(body, json!({}));

        let conn = server.pool.get().unwrap();
        assert!(events::event_exists(&conn, &EventId::parse(&event_id).unwrap()).unwrap());
        let snapshot = rooms::load_snapshot(&conn, &RoomId::parse(ROOM).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(
            snapshot.state.membership_of(&UserId::parse(USER).unwrap()),
            Some(Membership::Leave)
        );
        let expected_prev: Vec<OwnedEventId> = vec![EventId::parse(&event_id).unwrap()];
        assert_eq!(snapshot.prev_events, expected_prev);
        drop(conn);

        assert_eq!(queued_destinations(&server), vec!["b.org", "c.org"]);
    }
}

#[tokio::test]
async fn v1_api_wraps_acknowledgement() {
    let server = setup_app(RoomVersionId::V1, u64::MAX);
    let template = fetch_template(&server).await;
    let (event_id, event) = sign_template(&RoomVersionId::V1, &template, "$leave:b.org");
    assert_eq!(event_id, "$leave:b.org");

    let uri = send_leave_uri("v1", ROOM, &event_id);
    let (status, body) = put_leave(&server, &uri, "b.org", &event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([200, {}]));
}

#[tokio::test]
async fn repeated_send_leave_is_idempotent() {
    let server = setup_app(RoomVersionId::V4, u64::MAX);
    let template = fetch_template(&server).await;
    let (event_id, event) = sign_template(&RoomVersionId::V4, &template, "");
    let uri = send_leave_uri("v2", ROOM, &event_id);

    let (first, _) = put_leave(&server, &uri, "b.org", &event).await;
    let (second, body) = put_leave(&server, &uri, "b.org", &event).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body, json!({}));
    assert_eq!(queued_destinations(&server).len(), 2);
}

#[tokio::test]
async fn send_leave_from_another_server_is_forbidden() {
    let server = setup_app(RoomVersionId::V4, u64::MAX);
    let template = fetch_template(&server).await;
    let (event_id, event) = sign_template(&RoomVersionId::V4, &template, "");

    let uri = send_leave_uri("v2", ROOM, &event_id);
    let (status, body) = put_leave(&server, &uri, "c.org", &event).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["errcode"], "M_FORBIDDEN");
    assert!(queued_destinations(&server).is_empty());
}

#[tokio::test]
async fn send_leave_checks_path_against_event() {
    let server = setup_app(RoomVersionId::V4, u64::MAX);
    let template = fetch_template(&server).await;
    let (_, event) = sign_template(&RoomVersionId::V4, &template, "");

    let uri = send_leave_uri("v2", ROOM, "$someOtherEvent");
    let (status, body) = put_leave(&server, &uri, "b.org", &event).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errcode"], "M_BAD_JSON");
}

#[tokio::test]
async fn send_leave_to_unknown_room_reports_unsupported_version() {
    let server = setup_app(RoomVersionId::V4, u64::MAX);
    let template = fetch_template(&server).await;
    let (event_id, event) = sign_template(&RoomVersionId::V4, &template, "");

    let uri = send_leave_uri("v2", "!missing:a.org", &event_id);
    let (status, body) = put_leave(&server, &uri, "b.org", &event).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errcode"], "M_UNSUPPORTED_ROOM_VERSION");
}

#[tokio::test]
async fn send_leave_rejects_event_signed_after_key_expiry() {
    let now = now_millis();
    let server = setup_app(RoomVersionId::V4, now + 60 * 60 * 1000);
    let mut template = fetch_template(&server).await;
    template["origin_server_ts"] = json!(now + 24 * 60 * 60 * 1000);
    let (event_id, event) = sign_template(&RoomVersionId::V4, &template, "");

    let uri = send_leave_uri("v2", ROOM, &event_id);
    let (status, body) = put_leave(&server, &uri, "b.org", &event).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["errcode"], "M_FORBIDDEN");

    let conn = server.pool.get().unwrap();
    assert!(!events::event_exists(&conn, &EventId::parse(&event_id).unwrap()).unwrap());
}

#[tokio::test]
async fn send_leave_stores_tampered_event_redacted() {
    let server = setup_app(RoomVersionId::V4, u64::MAX);
    let template = fetch_template(&server).await;
    let (event_id, mut event) = sign_template(&RoomVersionId::V4, &template, "");
    event["content"]["reason"] = json!("edited after signing");

    let uri = send_leave_uri("v2", ROOM, &event_id);
    let (status, body) = put_leave(&server, &uri, "b.org", &event).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let conn = server.pool.get().unwrap();
    let stored = events::get_event_json(&conn, &EventId::parse(&event_id).unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(stored["content"], json!({ "membership": "leave" }));
}

#[tokio::test]
async fn send_leave_rejects_leave_for_user_of_another_server() {
    let server = setup_app(RoomVersionId::V4, u64::MAX);
    let mut template = fetch_template(&server).await;
    // c.org authors and signs a leave for b.org's user.
    template["origin"] = json!("c.org");
    let (event_id, event) = sign_as("c.org", &RoomVersionId::V4, &template, "");

    let uri = send_leave_uri("v2", ROOM, &event_id);
    let (status, body) = put_leave(&server, &uri, "c.org", &event).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["errcode"], "M_FORBIDDEN");
    assert!(queued_destinations(&server).is_empty());

    let conn = server.pool.get().unwrap();
    assert!(!events::event_exists(&conn, &EventId::parse(&event_id).unwrap()).unwrap());
}

#[tokio::test]
async fn send_leave_rejects_body_that_is_not_json() {
    let server = setup_app(RoomVersionId::V4, u64::MAX);
    let uri = send_leave_uri("v2", ROOM, "$e");
    let authorization = {
        let request = signed_request("PUT", &uri, "b.org", &remote_key(), None);
        request.headers()["authorization"].clone()
    };
    let request = Request::builder()
        .method("PUT")
        .uri(&uri)
        .header("authorization", authorization)
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = server.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["errcode"], "M_NOT_JSON");
}

#[tokio::test]
async fn send_leave_rejects_signed_join() {
    let server = setup_app(RoomVersionId::V4, u64::MAX);
    let mut template = fetch_template(&server).await;
    template["content"]["membership"] = json!("join");
    let (event_id, event) = sign_template(&RoomVersionId::V4, &template, "");

    let uri = send_leave_uri("v2", ROOM, &event_id);
    let (status, body) = put_leave(&server, &uri, "b.org", &event).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errcode"], "M_BAD_JSON");
    assert!(queued_destinations(&server).is_empty());
}
