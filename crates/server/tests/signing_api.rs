//! HTTPS API surface, exercised in-process through the router.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use keyless_server::api::{router, ApiState};
use keyless_server::{ChallengeBroker, ChallengeKind, ChallengeRecord, KeyStore, Signer};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;
use tower::ServiceExt;

struct Fixture {
    app: axum::Router,
    fingerprint: String,
    verifying_key: p256::ecdsa::VerifyingKey,
    _chain: tempfile::NamedTempFile,
    broker: Arc<ChallengeBroker>,
}

fn fixture() -> Fixture {
    let secret = p256::SecretKey::random(&mut rand::thread_rng());
    let signing_key: p256::ecdsa::SigningKey = secret.into();
    let verifying_key = *signing_key.verifying_key();

    let mut keys = KeyStore::new();
    let fingerprint = keys.insert(Signer::EcdsaP256(signing_key)).unwrap();

    let mut chain = tempfile::NamedTempFile::new().unwrap();
    chain
        .write_all(b"-----BEGIN CERTIFICATE-----\nAA==\n-----END CERTIFICATE-----\n")
        .unwrap();

    let broker = ChallengeBroker::new();
    let state = ApiState {
        keys: Arc::new(keys),
        broker: broker.clone(),
        certificate_path: chain.path().to_path_buf(),
    };

    Fixture {
        app: router(state, "/keyless"),
        fingerprint,
        verifying_key,
        _chain: chain,
        broker,
    }
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn sign_roundtrip_verifies() {
    let fixture = fixture();
    let digest = Sha256::digest(b"hello");

    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/keyless/sign?key={}&hash=SHA-256",
            fixture.fingerprint
        ))
        .body(Body::from(digest.to_vec()))
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );

    let signature_der = body_bytes(response).await;
    let signature = p256::ecdsa::Signature::from_der(&signature_der).unwrap();
    fixture
        .verifying_key
        .verify_prehash(&digest, &signature)
        .unwrap();
}

#[tokio::test]
async fn unknown_key_is_not_found() {
    let fixture = fixture();
    let request = Request::builder()
        .method("POST")
        .uri("/keyless/sign?key=bogus&hash=SHA-256")
        .body(Body::from(vec![0u8; 32]))
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_hash_is_not_found() {
    let fixture = fixture();
    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/keyless/sign?key={}&hash=MD5",
            fixture.fingerprint
        ))
        .body(Body::from(vec![0u8; 32]))
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_digest_is_bad_request() {
    let fixture = fixture();
    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/keyless/sign?key={}&hash=SHA-256",
            fixture.fingerprint
        ))
        .body(Body::from(vec![0u8; 66]))
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn empty_digest_is_bad_request() {
    let fixture = fixture();
    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/keyless/sign?key={}&hash=SHA-256",
            fixture.fingerprint
        ))
        .body(Body::empty())
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn certificate_endpoint_serves_the_chain_verbatim() {
    let fixture = fixture();
    let request = Request::builder()
        .uri("/keyless/certificate")
        .body(Body::empty())
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/pem-certificate-chain"
    );
    let body = body_bytes(response).await;
    assert!(body.starts_with(b"-----BEGIN CERTIFICATE-----"));
}

#[tokio::test]
async fn http01_challenge_is_served_while_live() {
    let fixture = fixture();
    fixture.broker.present(ChallengeRecord::new(
        ChallengeKind::Http01,
        "api.example.com",
        "tok-123",
        "tok-123.thumbprint",
    ));

    let request = Request::builder()
        .uri("/.well-known/acme-challenge/tok-123")
        .header(header::HOST, "api.example.com:443")
        .body(Body::empty())
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"tok-123.thumbprint");
}

#[tokio::test]
async fn http01_challenge_for_wrong_host_is_not_found() {
    let fixture = fixture();
    fixture.broker.present(ChallengeRecord::new(
        ChallengeKind::Http01,
        "api.example.com",
        "tok-123",
        "tok-123.thumbprint",
    ));

    let request = Request::builder()
        .uri("/.well-known/acme-challenge/tok-123")
        .header(header::HOST, "other.example.com")
        .body(Body::empty())
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_token_is_not_found() {
    let fixture = fixture();
    let request = Request::builder()
        .uri("/.well-known/acme-challenge/absent")
        .header(header::HOST, "api.example.com")
        .body(Body::empty())
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sign_route_requires_the_prefix() {
    let fixture = fixture();
    let request = Request::builder()
        .method("POST")
        .uri(format!("/sign?key={}&hash=SHA-256", fixture.fingerprint))
        .body(Body::from(vec![0u8; 32]))
        .unwrap();
    let response = fixture.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
