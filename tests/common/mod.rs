//! Test doubles shared by the integration tests: a fixed DNS table, a
//! scripted HTTP transport that records every request, and helpers for
//! building legacy aggregator links.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedgate::resolver::{
    HopResponse, HttpTransport, LinkResolver, RateLimiter, ResolverConfig, TransportError,
};
use feedgate::util::{HostResolver, PinnedUrl, SsrfGuard};

/// Public address every test host resolves to unless told otherwise.
pub const PUBLIC_IP: &str = "93.184.216.34";

/// DNS answers from a fixed table; unknown hosts fail like NXDOMAIN.
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
    default: Option<IpAddr>,
    /// Lookups still to fail before the table answers
    outages: Mutex<u32>,
}

impl StaticResolver {
    /// Resolver mapping every host to [`PUBLIC_IP`].
    pub fn public() -> Self {
        Self {
            hosts: HashMap::new(),
            default: PUBLIC_IP.parse().ok(),
            outages: Mutex::new(0),
        }
    }

    pub fn with_host(mut self, host: &str, ips: &[&str]) -> Self {
        self.hosts.insert(
            host.to_string(),
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        );
        self
    }

    pub fn without_default(mut self) -> Self {
        self.default = None;
        self
    }

    /// Fail the next `lookups` lookups like a flaky DNS server.
    pub fn with_outages(self, lookups: u32) -> Self {
        *self.outages.lock().unwrap() = lookups;
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        {
            let mut outages = self.outages.lock().unwrap();
            if *outages > 0 {
                *outages -= 1;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "temporary failure in name resolution",
                ));
            }
        }
        let ips = match (self.hosts.get(host), self.default) {
            (Some(ips), _) => ips.clone(),
            (None, Some(ip)) => vec![ip],
            (None, None) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "failed to lookup address information: Name or service not known",
                ))
            }
        };
        Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }
}

/// One scripted reaction of [`ScriptedTransport`].
#[derive(Clone)]
pub enum Step {
    Respond(Result<HopResponse, TransportError>),
    /// Never answer within any reasonable timeout
    Hang,
}

impl Step {
    pub fn ok() -> Self {
        Step::Respond(Ok(HopResponse::ok()))
    }

    pub fn redirect(location: &str) -> Self {
        Step::Respond(Ok(HopResponse::redirect(location)))
    }

    pub fn status(status: u16) -> Self {
        Step::Respond(Ok(HopResponse {
            status,
            location: None,
        }))
    }

    pub fn fail(err: TransportError) -> Self {
        Step::Respond(Err(err))
    }
}

/// Transport answering per URL from a script. The last step for a URL
/// repeats; URLs without a script get 404.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<PinnedUrl>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, url: &str, steps: Vec<Step>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(url.to_string(), steps.into());
        self
    }

    /// Every request sent, in order.
    pub fn calls(&self) -> Vec<PinnedUrl> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called_urls(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|target| target.as_str().to_string())
            .collect()
    }

    fn next_step(&self, url: &str) -> Step {
        let mut script = self.script.lock().unwrap();
        match script.get_mut(url) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
            Some(steps) => steps.front().cloned().unwrap_or_else(|| Step::status(404)),
            None => Step::status(404),
        }
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, target: &PinnedUrl) -> Result<HopResponse, TransportError> {
        self.calls.lock().unwrap().push(target.clone());
        match self.next_step(target.as_str()) {
            Step::Respond(result) => result,
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(HopResponse::ok())
            }
        }
    }
}

/// Legacy link whose envelope carries `urls` in order.
pub fn legacy_link(urls: &[&str]) -> String {
    let mut bytes = Vec::new();
    for url in urls {
        bytes.extend_from_slice(&[0x08, 0x13, 0x22, url.len() as u8]);
        bytes.extend_from_slice(url.as_bytes());
    }
    format!(
        "https://news.example/rss/articles/{}?oc=5",
        URL_SAFE_NO_PAD.encode(bytes)
    )
}

/// Resolver config for tests: no rate-limit spacing, fast local retries.
pub fn fast_config() -> ResolverConfig {
    ResolverConfig {
        rate_limit_spacing: Duration::ZERO,
        fetch_retry_base: Duration::from_millis(1),
        ..ResolverConfig::default()
    }
}

pub fn resolver_with(
    dns: StaticResolver,
    transport: Arc<ScriptedTransport>,
    config: ResolverConfig,
) -> LinkResolver {
    LinkResolver::new(
        SsrfGuard::new(Arc::new(dns)),
        transport,
        Arc::new(RateLimiter::new(config.rate_limit_spacing)),
        config,
    )
}
