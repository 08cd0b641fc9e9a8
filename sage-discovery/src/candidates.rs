//! Candidate generation
//!
//! Pure function of its inputs: no network I/O, same inputs give the same
//! sequence. Order is the probe order, so it also decides who wins a tie.

use sage_core::{Candidate, Origin, Scheme};
use std::collections::HashSet;
use std::net::IpAddr;

/// Loopback names tried when the caller is served from another interface.
const LOOPBACK_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Build the ordered, de-duplicated list of backend addresses to try.
///
/// 1. `override_url` first, when present and parseable.
/// 2. The origin host on every port (`https` then `http` for a secure
///    origin, `http` only otherwise).
/// 3. `localhost` and `127.0.0.1` on every port, unless the origin host is
///    already a loopback name.
pub fn generate(origin: &Origin, ports: &[u16], override_url: Option<&str>) -> Vec<Candidate> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |candidate: Candidate| {
        if seen.insert(candidate.clone()) {
            out.push(candidate);
        }
    };

    if let Some(raw) = override_url {
        match Candidate::parse(raw) {
            Ok(candidate) => push(candidate),
            Err(e) => tracing::warn!(url = %raw, "Ignoring invalid backend override: {}", e),
        }
    }

    let schemes = viable_schemes(origin);

    for &port in ports {
        for &scheme in &schemes {
            push(Candidate::new(scheme, origin.host.clone(), port));
        }
    }

    if !is_loopback_host(&origin.host) {
        for &port in ports {
            for host in LOOPBACK_HOSTS {
                for &scheme in &schemes {
                    push(Candidate::new(scheme, host, port));
                }
            }
        }
    }

    out
}

fn viable_schemes(origin: &Origin) -> Vec<Scheme> {
    if origin.is_secure() {
        vec![Scheme::Https, Scheme::Http]
    } else {
        vec![Scheme::Http]
    }
}

pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost")
    {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
