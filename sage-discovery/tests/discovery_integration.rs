mod support;

use std::sync::Arc;
use std::time::Duration;

use sage_core::{FailureKind, Origin, Scheme};
use sage_discovery::{DiscoveryCache, DiscoveryConfig, Discoverer, Error, HttpProbe};
use support::{FakeBackend, can_bind_local_ports, closed_port};

fn config(ports: Vec<u16>, override_url: Option<String>) -> DiscoveryConfig {
    DiscoveryConfig {
        origin: Origin::new(Scheme::Http, "127.0.0.1"),
        ports,
        override_url,
        probe_timeout: Duration::from_secs(2),
        ..DiscoveryConfig::default()
    }
}

fn discoverer(config: DiscoveryConfig) -> Discoverer {
    let probe = Arc::new(HttpProbe::from_config(&config).unwrap());
    Discoverer::new(config, probe, DiscoveryCache::in_memory())
}

#[tokio::test]
async fn override_address_answers_on_first_probe() {
    let Some(backend) = FakeBackend::sage().await else {
        return;
    };
    let d = discoverer(config(vec![closed_port()], Some(backend.url())));

    let result = d.discover().await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.attempts.len(), 1);
    let info = result.backend.unwrap();
    assert_eq!(info.url, backend.url());
    assert_eq!(info.port, backend.port);
    assert_eq!(info.version, "1.0.0");
    assert_eq!(backend.hits("/health"), 1);
}

#[tokio::test]
async fn unrelated_service_is_skipped() {
    let Some(foreign) = FakeBackend::start(|_, _| (200, r#"{"hello":"world"}"#.to_string())).await
    else {
        return;
    };
    let Some(sage) = FakeBackend::sage().await else {
        return;
    };
    let mut cfg = config(vec![foreign.port, sage.port], None);
    cfg.batch_size = 1;
    let d = discoverer(cfg);

    let result = d.discover().await;

    assert!(result.success);
    assert_eq!(result.attempts.len(), 2);
    assert!(!result.attempts[0].success);
    assert!(result.attempts[0].url.contains(&foreign.port.to_string()));
    assert!(result.attempts[1].success);
    assert_eq!(result.backend.unwrap().port, sage.port);
    assert_eq!(foreign.hits("/health"), 1);
}

#[tokio::test]
async fn nothing_listening_exhausts_every_candidate() {
    if !can_bind_local_ports() {
        return;
    }
    let ports = vec![closed_port(), closed_port()];
    let d = discoverer(config(ports.clone(), None));

    let result = d.discover().await;

    assert!(!result.success);
    assert!(result.backend.is_none());
    assert_eq!(result.attempts.len(), 2);
    assert!(result.attempts.iter().all(|a| !a.success && a.error.is_some()));
    assert!(
        result
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("no SAGE backend found")
    );

    let err = d.discover_backend().await.unwrap_err();
    assert!(matches!(err, Error::ExhaustedCandidates { ref attempts } if attempts.len() == 2));
}

#[tokio::test]
async fn foreign_service_on_every_candidate_blames_port_collision() {
    let Some(foreign) = FakeBackend::start(|_, _| (200, r#"{"hello":"world"}"#.to_string())).await
    else {
        return;
    };
    let d = discoverer(config(vec![foreign.port, closed_port()], None));

    let result = d.discover().await;
    assert!(!result.success);
    assert!(result.attempts[0].failed_with(FailureKind::NotOurs));

    let err = d.discover_backend().await.unwrap_err();
    assert!(matches!(err, Error::ExhaustedCandidates { .. }));
    assert!(err.guidance().contains("different program"), "{}", err.guidance());
}

#[tokio::test]
async fn second_discovery_uses_cached_address() {
    let Some(sage) = FakeBackend::sage().await else {
        return;
    };
    let d = discoverer(config(vec![closed_port(), sage.port], None));

    let first = d.discover().await;
    assert!(first.success);
    assert_eq!(first.attempts.len(), 2);

    let second = d.discover().await;
    assert!(second.success);
    assert_eq!(second.attempts.len(), 1);
    assert_eq!(second.backend.unwrap().url, sage.url());
    assert_eq!(sage.hits("/health"), 2);
}

#[tokio::test]
async fn cached_address_that_died_falls_back_to_sweep() {
    let Some(first) = FakeBackend::sage().await else {
        return;
    };
    let Some(second) = FakeBackend::sage().await else {
        return;
    };
    let d = discoverer(config(vec![first.port, second.port], None));

    assert_eq!(d.discover().await.backend.unwrap().port, first.port);

    first.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = d.discover().await;
    assert!(result.success);
    assert_eq!(result.backend.unwrap().port, second.port);
    // Failed re-check of the cached address, then the sweep.
    assert!(!result.attempts[0].success);
    assert!(result.attempts.len() >= 2);
}
