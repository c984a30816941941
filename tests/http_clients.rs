use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use kaiwa::token::{CredentialSource, HttpTokenClient, Persona};
use kaiwa::usage::{BillingClient, HttpBillingClient, UsageCounters, UsageDebit};
use kaiwa::SessionError;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn token_client_posts_persona_and_reads_wrapped_secret() {
    let seen: Arc<Mutex<Option<Value>>> = Arc::default();
    let seen_in = seen.clone();
    let app = Router::new().route(
        "/api/realtime/token",
        post(move |Json(body): Json<Value>| {
            let seen = seen_in.clone();
            async move {
                *seen.lock().unwrap() = Some(body);
                Json(json!({ "client_secret": { "value": "ek_abc", "expires_at": 1234 } }))
            }
        }),
    );
    let base = serve(app).await;

    let persona = Persona {
        name: Some("Yuki".into()),
        speaking_style: Some("casual".into()),
        ..Default::default()
    };
    let credential = HttpTokenClient::new(&base).fetch(&persona).await.unwrap();
    assert_eq!(credential.secret(), "ek_abc");
    assert_eq!(credential.expires_at, Some(1234));
    assert_eq!(
        seen.lock().unwrap().clone().unwrap(),
        json!({ "name": "Yuki", "speaking_style": "casual" })
    );
}

#[tokio::test]
async fn token_client_accepts_flat_secret() {
    let app = Router::new().route(
        "/api/realtime/token",
        post(|| async { Json(json!({ "value": "ek_flat" })) }),
    );
    let base = serve(app).await;
    let credential = HttpTokenClient::new(&format!("{}/", base))
        .fetch(&Persona::default())
        .await
        .unwrap();
    assert_eq!(credential.secret(), "ek_flat");
    assert_eq!(credential.expires_at, None);
}

#[tokio::test]
async fn token_endpoint_failure_is_a_network_error() {
    let app = Router::new().route(
        "/api/realtime/token",
        post(|| async { (StatusCode::UNAUTHORIZED, "sign in first") }),
    );
    let base = serve(app).await;
    let err = HttpTokenClient::new(&base)
        .fetch(&Persona::default())
        .await
        .unwrap_err();
    match err {
        SessionError::NetworkError(msg) => assert!(msg.contains("401")),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = HttpTokenClient::new(&format!("http://{}", addr))
        .fetch(&Persona::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NetworkError(_)));
    assert!(err.is_terminal());
}

#[tokio::test]
async fn billing_client_sends_all_counters_and_duration() {
    let seen: Arc<Mutex<Option<Value>>> = Arc::default();
    let seen_in = seen.clone();
    let app = Router::new().route(
        "/api/realtime/usage",
        post(move |Json(body): Json<Value>| {
            let seen = seen_in.clone();
            async move {
                *seen.lock().unwrap() = Some(body);
                Json(json!({ "credits_charged": 3.5, "cost": 0.0125 }))
            }
        }),
    );
    let base = serve(app).await;

    let debit = UsageDebit {
        counters: UsageCounters {
            audio_input_tokens: 200,
            audio_output_tokens: 450,
            text_input_tokens: 12,
            text_output_tokens: 90,
        },
        duration_seconds: 42,
    };
    let receipt = HttpBillingClient::new(&base).debit(&debit).await.unwrap();
    assert_eq!(receipt.credits_charged, Some(3.5));
    assert_eq!(receipt.cost, Some(0.0125));
    assert_eq!(
        seen.lock().unwrap().clone().unwrap(),
        json!({
            "audio_input_tokens": 200,
            "audio_output_tokens": 450,
            "text_input_tokens": 12,
            "text_output_tokens": 90,
            "duration_seconds": 42,
        })
    );
}

#[tokio::test]
async fn billing_rejection_is_reported_as_billing_failure() {
    let app = Router::new().route(
        "/api/realtime/usage",
        post(|| async { (StatusCode::PAYMENT_REQUIRED, "out of credits") }),
    );
    let base = serve(app).await;
    let debit = UsageDebit {
        counters: UsageCounters {
            text_input_tokens: 1,
            ..Default::default()
        },
        duration_seconds: 1,
    };
    let err = HttpBillingClient::new(&base).debit(&debit).await.unwrap_err();
    assert!(matches!(err, SessionError::BillingRequestFailed(_)));
    assert!(!err.is_terminal());
}
