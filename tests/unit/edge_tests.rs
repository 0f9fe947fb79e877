// Edge authenticator tests against URLs produced by the offline signer

use std::sync::Arc;

use shashin::config::Environment;
use shashin::edge::canonical::{canonical_query, split_query};
use shashin::edge::signer::{encode_payload, sign_url};
use shashin::edge::{EdgeAuthenticator, EdgeDecision, SignedRequest};
use shashin::secrets::{SecretAccessor, StaticSecretStore};

const SECRET: &str = "*integration-secret*";

fn authenticator() -> EdgeAuthenticator {
    let store = Arc::new(StaticSecretStore::new(SECRET));
    EdgeAuthenticator::new(SecretAccessor::new(store, "hmacSecret"), Environment::Production)
}

fn request_from_url(url: &str) -> SignedRequest {
    match url.split_once('?') {
        Some((path, query)) => SignedRequest::new(path, query),
        None => SignedRequest::new(url, ""),
    }
}

#[tokio::test]
async fn test_signer_output_is_accepted() {
    let query = split_query("w=300&h=200&fit=inside");
    let signed = sign_url(SECRET, "/photos/cat.jpg", &query, None).unwrap();

    let decision = authenticator().authenticate(&request_from_url(&signed.url)).await;
    match decision {
        EdgeDecision::Forward { uri, query, .. } => {
            assert_eq!(uri, "/photos/cat.jpg");
            assert_eq!(
                query,
                format!("fit=inside&h=200&signature={}&w=300", signed.signature)
            );
        }
        other => panic!("expected forward, got {:?}", other),
    }
}

#[tokio::test]
async fn test_signed_payload_path_is_accepted() {
    let path = encode_payload(&serde_json::json!({
        "key": "img/12x18.jpg",
        "edits": {"resize": {"width": 1000, "height": 1000, "fit": "inside"}}
    }));
    let signed = sign_url(SECRET, &path, &[], None).unwrap();
    assert_eq!(signed.canonical, path);

    let decision = authenticator().authenticate(&request_from_url(&signed.url)).await;
    assert!(matches!(decision, EdgeDecision::Forward { .. }));
}

#[tokio::test]
async fn test_any_change_after_signing_is_rejected() {
    let auth = authenticator();
    let signed = sign_url(SECRET, "/photos/cat.jpg", &split_query("w=300"), None).unwrap();

    let tampered = signed.url.replace("w=300", "w=3000");
    assert_eq!(auth.authenticate(&request_from_url(&tampered)).await.status(), Some(403));

    let extra = format!("{}&h=10", signed.url);
    assert_eq!(auth.authenticate(&request_from_url(&extra)).await.status(), Some(403));

    let wrong_secret = sign_url("other", "/photos/cat.jpg", &split_query("w=300"), None).unwrap();
    assert_eq!(
        auth.authenticate(&request_from_url(&wrong_secret.url)).await.status(),
        Some(403)
    );
}

#[tokio::test]
async fn test_expiry_is_enforced_after_verification() {
    let auth = authenticator();
    let signed = sign_url(SECRET, "/a.png", &[], Some(2_000)).unwrap();
    let request = request_from_url(&signed.url);

    assert!(matches!(
        auth.authenticate_at(&request, 1_999_999).await,
        EdgeDecision::Forward { .. }
    ));
    assert_eq!(auth.authenticate_at(&request, 2_000_001).await.status(), Some(400));

    // A forged expiry fails the signature check first
    let forged = signed.url.replace("expires=2000", "expires=9999999999");
    assert_eq!(
        auth.authenticate_at(&request_from_url(&forged), 2_000_001).await.status(),
        Some(403)
    );
}

#[test]
fn test_canonical_query_ignores_order_and_signature() {
    let a = canonical_query(&split_query("b=2&a=1&c=3"));
    let b = canonical_query(&split_query("c=3&signature=xyz&a=1&b=2"));
    assert_eq!(a, b);
    assert_eq!(canonical_query(&split_query(&a)), a);
}
