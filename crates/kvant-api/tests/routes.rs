use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

use kvant_api::{AppStateInner, routes};
use kvant_db::{Database, MessageStore};
use kvant_gateway::lifecycle::SendRequest;
use kvant_gateway::{Hub, MessageEngine};
use kvant_types::api::Claims;
use kvant_types::models::Message;

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    engine: MessageEngine,
    db: Arc<Database>,
}

fn app() -> TestApp {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.upsert_user("alice", "Alice", None).unwrap();
    db.upsert_user("bob", "Bob", None).unwrap();
    let store: Arc<dyn MessageStore> = db.clone();
    let engine = MessageEngine::new(store, Hub::spawn());
    let state = Arc::new(AppStateInner {
        engine: engine.clone(),
        jwt_secret: SECRET.into(),
    });
    TestApp {
        router: Router::new().nest("/api", routes(state)),
        engine,
        db,
    }
}

fn token(user_id: &str) -> String {
    let claims = Claims {
        sub: user_id.into(),
        username: user_id.into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

impl TestApp {
    async fn call(&self, user: &str, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let resp = self.router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn send(&self, from: &str, to: &str, text: &str) -> Message {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        self.engine
            .send_message(
                from,
                SendRequest {
                    receiver_id: to.into(),
                    text: text.into(),
                    reply_to_id: None,
                },
            )
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn requests_without_valid_token_are_unauthorized() {
    let app = app();

    let req = Request::builder().uri("/api/messages/recent").body(Body::empty()).unwrap();
    let resp = app.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/messages/recent")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let resp = app.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn history_shows_visible_messages_with_reactions() {
    let app = app();
    let first = app.send("alice", "bob", "hello").await;
    let second = app.send("bob", "alice", "hi!").await;
    app.engine.add_reaction("bob", first.id, "👋").await.unwrap();
    app.engine.delete_message("alice", second.id, false).await.unwrap();

    let (status, body) = app.call("alice", Method::GET, "/api/messages/bob", None).await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!(first.id));
    assert_eq!(rows[0]["sender_name"], "Alice");
    assert_eq!(rows[0]["reactions"][0]["emoji"], "👋");
    assert_eq!(rows[0]["reactions"][0]["user_ids"], json!(["bob"]));

    let (_, body) = app.call("bob", Method::GET, "/api/messages/alice?limit=1", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], json!(second.id));
}

#[tokio::test]
async fn recent_chats_and_mark_read() {
    let app = app();
    app.send("alice", "bob", "one").await;
    app.send("alice", "bob", "two").await;

    let (status, body) = app.call("bob", Method::GET, "/api/messages/recent", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], "alice");
    assert_eq!(body[0]["username"], "Alice");

    let (status, body) = app.call("bob", Method::POST, "/api/messages/alice/read", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 2);

    let (_, body) = app.call("bob", Method::POST, "/api/messages/alice/read", None).await;
    assert_eq!(body["updated"], 0);
}

#[tokio::test]
async fn edit_maps_errors_to_status_codes() {
    let app = app();
    let msg = app.send("alice", "bob", "draft").await;
    let uri = format!("/api/messages/{}/edit", msg.id);

    let (status, body) = app.call("alice", Method::PUT, &uri, Some(json!({ "text": "final" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["text"], "final");
    assert!(body["edited_at"].is_string());

    let (status, _) = app.call("bob", Method::PUT, &uri, Some(json!({ "text": "mine now" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.call("alice", Method::PUT, &uri, Some(json!({ "text": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = format!("/api/messages/{}/edit", uuid::Uuid::new_v4());
    let (status, _) = app.call("alice", Method::PUT, &missing, Some(json!({ "text": "x" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .call("alice", Method::PUT, "/api/messages/not-a-uuid/edit", Some(json!({ "text": "x" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_defaults_to_self_and_supports_everyone() {
    let app = app();
    let msg = app.send("alice", "bob", "regret").await;
    let uri = format!("/api/messages/{}/delete", msg.id);

    let (status, body) = app.call("bob", Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted_for_everyone"], false);
    assert!(app.db.get_message(msg.id).unwrap().unwrap().deleted_for_receiver);

    let (status, _) = app
        .call("bob", Method::DELETE, &uri, Some(json!({ "delete_for_everyone": true })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .call("alice", Method::DELETE, &uri, Some(json!({ "delete_for_everyone": true })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted_for_everyone"], true);
    assert!(app.db.get_message(msg.id).unwrap().unwrap().deleted_at.is_some());
}

#[tokio::test]
async fn reactions_and_pins_round_trip_through_http() {
    let app = app();
    let msg = app.send("alice", "bob", "pin me").await;
    let reactions = format!("/api/messages/{}/reactions", msg.id);

    let (status, body) = app.call("bob", Method::POST, &reactions, Some(json!({ "emoji": "❤️" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"], true);

    let (status, _) = app.call("carol", Method::POST, &reactions, Some(json!({ "emoji": "❤️" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.call("bob", Method::DELETE, &format!("{}?emoji=", reactions), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let encoded = format!("{}?emoji=%E2%9D%A4%EF%B8%8F", reactions);
    let (status, body) = app.call("bob", Method::DELETE, &encoded, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], true);

    let (status, body) = app
        .call("bob", Method::POST, &format!("/api/messages/{}/pin", msg.id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["pinned_at"].is_string());
    assert!(app.db.get_message(msg.id).unwrap().unwrap().pinned_at.is_some());

    let (status, _) = app
        .call("alice", Method::POST, &format!("/api/messages/{}/unpin", msg.id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(app.db.get_message(msg.id).unwrap().unwrap().pinned_at.is_none());
}
