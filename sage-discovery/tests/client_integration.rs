mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sage_core::{BackendInfo, BackendStatus, Candidate, Origin, Scheme, now_millis};
use sage_discovery::{
    ApiRequest, BackendUrl, DiscoveryCache, DiscoveryConfig, Discoverer, Error, HttpProbe, Probe,
    ProbeOutcome, ProbeReport, ResilientClient,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use support::{FakeBackend, closed_port, sage_echo};

fn make_client(ports: Vec<u16>, start_url: String) -> ResilientClient {
    let config = DiscoveryConfig {
        origin: Origin::new(Scheme::Http, "127.0.0.1"),
        ports,
        probe_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        ..DiscoveryConfig::default()
    };
    let probe = Arc::new(HttpProbe::from_config(&config).unwrap());
    let discoverer = Arc::new(Discoverer::new(config, probe, DiscoveryCache::in_memory()));
    ResilientClient::with_backend_url(discoverer, BackendUrl::new(start_url)).unwrap()
}

fn dead_url() -> String {
    format!("http://127.0.0.1:{}", closed_port())
}

#[tokio::test]
async fn background_discovery_replaces_default_address() {
    let Some(sage) = FakeBackend::sage().await else {
        return;
    };
    let client = make_client(vec![sage.port], dead_url());

    client.wait_for_discovery().await;

    assert_eq!(client.current_url(), sage.url());
    assert_eq!(client.rediscovery_count(), 0);
}

#[tokio::test]
async fn request_follows_backend_to_new_port() {
    let new_port = closed_port();
    let client = make_client(vec![new_port], dead_url());

    // Nothing is up yet, so the default address is kept.
    client.wait_for_discovery().await;
    let before = client.current_url();

    let Some(sage) = FakeBackend::sage_on(new_port).await else {
        return;
    };

    let body: Value = client.get_json("/api/v1/ping").await.unwrap();

    assert_eq!(body["path"], "/api/v1/ping");
    assert_eq!(body["method"], "GET");
    assert_ne!(client.current_url(), before);
    assert_eq!(client.current_url(), sage.url());
    assert_eq!(client.rediscovery_count(), 1);
    assert_eq!(sage.hits("/api/v1/ping"), 1);
}

/// The first discovery is slow and reports `stale`; every later one reports
/// `live` straight away.
struct SlowFirstDiscovery {
    calls: AtomicUsize,
    stale: String,
    live: String,
}

#[async_trait]
impl Probe for SlowFirstDiscovery {
    async fn probe(&self, candidate: &Candidate) -> ProbeReport {
        let url = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.stale.clone()
        } else {
            self.live.clone()
        };
        let port = Candidate::parse(&url).map(|c| c.port).unwrap_or(candidate.port);
        let info = BackendInfo {
            url,
            port,
            version: "1.0.0".to_string(),
            status: BackendStatus::Healthy,
            validated_at: now_millis(),
        };
        ProbeReport::new(candidate.clone(), ProbeOutcome::Healthy(info), Duration::from_millis(1))
    }
}

#[tokio::test]
async fn late_initial_discovery_does_not_undo_rediscovery() {
    let Some(sage) = FakeBackend::sage().await else {
        return;
    };
    let stale = dead_url();
    let probe = Arc::new(SlowFirstDiscovery {
        calls: AtomicUsize::new(0),
        stale: stale.clone(),
        live: sage.url(),
    });
    let config = DiscoveryConfig {
        origin: Origin::new(Scheme::Http, "127.0.0.1"),
        ports: vec![sage.port],
        request_timeout: Duration::from_secs(5),
        ..DiscoveryConfig::default()
    };
    let discoverer =
        Discoverer::new(config, probe.clone(), DiscoveryCache::in_memory()).without_cache();
    let client =
        ResilientClient::with_backend_url(Arc::new(discoverer), BackendUrl::new(dead_url())).unwrap();

    client.start_discovery();
    while probe.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The request fails on the default address and rediscovers while the
    // initial discovery is still in flight.
    let body: Value = client.get_json("/api/v1/ping").await.unwrap();
    assert_eq!(body["path"], "/api/v1/ping");
    assert_eq!(client.current_url(), sage.url());

    client.wait_for_discovery().await;
    assert_eq!(client.current_url(), sage.url());
    assert_ne!(client.current_url(), stale);
    assert_eq!(client.rediscovery_count(), 1);
}

#[tokio::test]
async fn failed_rediscovery_returns_original_error() {
    let start = dead_url();
    let client = make_client(vec![closed_port()], start.clone());
    client.wait_for_discovery().await;

    let err = client.get_json::<Value>("/api/v1/ping").await.unwrap_err();

    match err {
        Error::Unreachable { url, .. } => assert!(url.starts_with(&start), "{url}"),
        other => panic!("expected unreachable, got {other:?}"),
    }
    assert_eq!(client.rediscovery_count(), 1);
    assert_eq!(client.current_url(), start);
}

#[tokio::test]
async fn failed_retry_returns_original_error() {
    let new_port = closed_port();
    let start = dead_url();
    let client = make_client(vec![new_port], start.clone());
    client.wait_for_discovery().await;

    // Healthy for discovery, broken for the actual call.
    let Some(sage) = FakeBackend::start_on(new_port, |method, path| {
        if path == "/health" {
            sage_echo(method, path)
        } else {
            (503, r#"{"detail":"warming up"}"#.to_string())
        }
    })
    .await
    else {
        return;
    };

    let err = client.get_json::<Value>("/api/v1/ping").await.unwrap_err();

    assert!(matches!(err, Error::Unreachable { ref url, .. } if url.starts_with(&start)));
    assert_eq!(client.rediscovery_count(), 1);
    assert_eq!(sage.hits("/api/v1/ping"), 1);
}

#[tokio::test]
async fn application_errors_do_not_trigger_rediscovery() {
    let Some(sage) = FakeBackend::start(|method, path| {
        if path == "/health" {
            sage_echo(method, path)
        } else {
            (500, r#"{"detail":"boom"}"#.to_string())
        }
    })
    .await
    else {
        return;
    };
    let client = make_client(vec![sage.port], sage.url());
    client.wait_for_discovery().await;

    let err = client
        .post_json::<_, Value>("/api/v1/chat", &serde_json::json!({"message": "hi"}))
        .await
        .unwrap_err();

    match err {
        Error::Application { status, body, .. } => {
            assert_eq!(status, 500);
            assert!(body.contains("boom"));
        }
        other => panic!("expected application error, got {other:?}"),
    }
    assert_eq!(client.rediscovery_count(), 0);
    assert_eq!(sage.hits("/api/v1/chat"), 1);
}

#[tokio::test]
async fn per_request_timeout_is_a_connection_failure() {
    // Accepts connections but never answers.
    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        return;
    };
    let port = listener.local_addr().unwrap().port();
    let hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let start = format!("http://127.0.0.1:{port}");
    let client = make_client(vec![closed_port()], start.clone());
    client.wait_for_discovery().await;

    let request = ApiRequest::get("/api/v1/slow").with_timeout(Duration::from_millis(200));
    let err = client.send(&request).await.unwrap_err();

    assert!(matches!(err, Error::Timeout { after, .. } if after == Duration::from_millis(200)));
    assert!(err.is_connection_class());
    assert_eq!(client.rediscovery_count(), 1);
    hold.abort();
}

#[tokio::test]
async fn streaming_hands_over_body() {
    let Some(sage) = FakeBackend::sage().await else {
        return;
    };
    let client = make_client(vec![sage.port], sage.url());

    let resp = client
        .stream(&ApiRequest::get("/api/v1/stream"))
        .await
        .unwrap();
    let text = resp.text().await.unwrap();

    assert!(text.contains("/api/v1/stream"));
}

#[tokio::test]
async fn health_checks_current_backend() {
    let Some(sage) = FakeBackend::sage().await else {
        return;
    };
    let client = make_client(vec![sage.port], sage.url());

    let info = client.health().await.unwrap();
    assert_eq!(info.version, "1.0.0");

    let foreign = make_client(vec![], dead_url());
    assert!(foreign.health().await.unwrap_err().is_connection_class());
}
