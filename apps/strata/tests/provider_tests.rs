//! Tests for the HTTP capability provider against a one-shot local server.

#![allow(clippy::unwrap_used, clippy::panic)]

use strata::config::ProviderConfig;
use strata::provider::HttpProvider;
use strata_core::{
    CapabilityError, Classifier, ContentSynthesizer, DetailedVerdict, Embedder, EntityId,
    EntityVersion, MemoryStore, NewEntityVersion, PreliminaryVerdict, VersionStore,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Handle;

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Serve exactly one request with `status` and `body`; returns the base URL.
async fn serve_once(status: u16, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = header_end(&buf) {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        let response = format!(
            "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
    });
    format!("http://{}", addr)
}

fn provider(base_url: String) -> HttpProvider {
    let config = ProviderConfig {
        base_url,
        ..ProviderConfig::default()
    };
    HttpProvider::new(&config, Handle::current()).unwrap()
}

fn pair() -> (EntityVersion, EntityVersion) {
    let store = MemoryStore::new();
    let a = store
        .put_entity_version(NewEntityVersion::new(None, "Alice", "engineer"))
        .unwrap();
    let b = store
        .put_entity_version(NewEntityVersion::new(None, "Alice Smith", "engineer at Acme"))
        .unwrap();
    (a, b)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_detailed_verdict_from_fenced_output() {
    let url = serve_once(200, "```json\n{\"action\": \"merge\", \"target\": 1,}\n```").await;
    let provider = provider(url);
    let (a, b) = pair();
    let verdict = tokio::task::spawn_blocking(move || provider.classify_detailed(&a, &b, &[]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verdict, DetailedVerdict::Merge { target: EntityId(1) });
}

#[tokio::test(flavor = "multi_thread")]
async fn test_preliminary_wire_shape() {
    let url = serve_once(
        200,
        r#"{"results": [{"entity_id": 2, "verdict": "possible_merge"}]}"#,
    )
    .await;
    let provider = provider(url);
    let (a, b) = pair();
    let verdicts = tokio::task::spawn_blocking(move || {
        provider.classify_preliminary(&a, std::slice::from_ref(&b))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(verdicts, vec![(EntityId(2), PreliminaryVerdict::PossibleMerge)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_embed_and_synthesize() {
    let embed_url = serve_once(200, r#"{"embedding": [0.5, 0.25]}"#).await;
    let synth_url = serve_once(200, r#"{"content": "Alice, also called Alice Smith"}"#).await;
    let embedder = provider(embed_url);
    let synthesizer = provider(synth_url);

    let (vector, content) = tokio::task::spawn_blocking(move || {
        let vector = embedder.embed("Alice").unwrap();
        let content = synthesizer
            .synthesize("Alice", &["nickname Alice Smith".to_string()])
            .unwrap();
        (vector, content)
    })
    .await
    .unwrap();
    assert_eq!(vector, vec![0.5, 0.25]);
    assert_eq!(content, "Alice, also called Alice Smith");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_garbage_is_unparseable() {
    let url = serve_once(200, "I think they are the same person.").await;
    let provider = provider(url);
    let (a, b) = pair();
    let result = tokio::task::spawn_blocking(move || provider.classify_detailed(&a, &b, &[]))
        .await
        .unwrap();
    assert!(matches!(result, Err(CapabilityError::Unparseable(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_error_is_unavailable() {
    let url = serve_once(500, r#"{"error": "model overloaded"}"#).await;
    let provider = provider(url);
    let result = tokio::task::spawn_blocking(move || provider.embed("x"))
        .await
        .unwrap();
    match result {
        Err(CapabilityError::Unavailable(msg)) => assert!(msg.contains("500")),
        other => panic!("expected Unavailable, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let provider = provider(format!("http://{}", addr));
    let result = tokio::task::spawn_blocking(move || provider.embed("x"))
        .await
        .unwrap();
    assert!(matches!(result, Err(CapabilityError::Unavailable(_))));
}
