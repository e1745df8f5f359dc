//! Broker service-lookup data and endpoint parsing.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Metadata path under which brokers publish their lookup data.
pub const LOADBALANCE_BROKERS_ROOT: &str = "/loadbalance/brokers";

/// Default AMQP port when an advertisement carries a scheme but no port.
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Scheme of a plain (non-TLS) listener.
const PLAIN_SCHEME: &str = "amqp";

/// Per-broker lookup record as stored by the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLookupData {
    #[serde(default)]
    pub web_service_url: Option<String>,
    #[serde(default)]
    pub web_service_url_tls: Option<String>,
    #[serde(default, rename = "pulsarServiceUrl")]
    pub broker_service_url: Option<String>,
    #[serde(default, rename = "pulsarServiceUrlTls")]
    pub broker_service_url_tls: Option<String>,
    /// Protocol name to advertised listener(s).
    #[serde(default)]
    pub protocols: BTreeMap<String, String>,
}

impl ServiceLookupData {
    /// Lookup data for a broker reachable at `web_service_url`.
    pub fn new(web_service_url: impl Into<String>) -> Self {
        Self {
            web_service_url: Some(web_service_url.into()),
            ..Self::default()
        }
    }

    pub fn protocol(&self, name: &str) -> Option<&str> {
        self.protocols.get(name).map(String::as_str)
    }

    pub fn with_protocol(mut self, name: impl Into<String>, advertisement: impl Into<String>) -> Self {
        self.protocols.insert(name.into(), advertisement.into());
        self
    }
}

/// Key of a broker's lookup data, from its web service URL.
pub fn lookup_data_path(web_service_url: &str) -> Option<String> {
    let url = Url::parse(web_service_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{LOADBALANCE_BROKERS_ROOT}/{host}:{port}"))
}

/// Address of a broker's AMQP listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerEndpoint {
    /// Host name or IP, without IPv6 brackets.
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Pick the first plain listener out of an advertisement.
    ///
    /// Accepts `host:port`, `amqp://host:port`, or a comma separated list of
    /// either; TLS listeners are skipped.
    pub fn from_advertisement(advertisement: &str) -> Option<Self> {
        advertisement
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .find_map(parse_listener)
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_listener(listener: &str) -> Option<BrokerEndpoint> {
    if listener.contains("://") {
        let url = Url::parse(listener).ok()?;
        if url.scheme() != PLAIN_SCHEME {
            return None;
        }
        let host = strip_brackets(url.host_str()?);
        if host.is_empty() {
            return None;
        }
        return Some(BrokerEndpoint::new(host, url.port().unwrap_or(DEFAULT_AMQP_PORT)));
    }

    let (host, port) = listener.rsplit_once(':')?;
    let host = strip_brackets(host);
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok().filter(|p| *p != 0)?;
    Some(BrokerEndpoint::new(host, port))
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_host_port() {
        assert_eq!(
            BrokerEndpoint::from_advertisement("10.0.0.5:5673"),
            Some(BrokerEndpoint::new("10.0.0.5", 5673))
        );
    }

    #[test]
    fn test_first_plain_listener_wins() {
        assert_eq!(
            BrokerEndpoint::from_advertisement("amqps://b1:5671, amqp://b1:5673,amqp://b1:5674"),
            Some(BrokerEndpoint::new("b1", 5673))
        );
        assert_eq!(
            BrokerEndpoint::from_advertisement("amqp://b1"),
            Some(BrokerEndpoint::new("b1", DEFAULT_AMQP_PORT))
        );
    }

    #[test]
    fn test_ipv6() {
        let endpoint = BrokerEndpoint::from_advertisement("[::1]:5672").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.to_string(), "[::1]:5672");
    }

    #[test]
    fn test_unusable_advertisements() {
        assert_eq!(BrokerEndpoint::from_advertisement(""), None);
        assert_eq!(BrokerEndpoint::from_advertisement("broker-without-port"), None);
        assert_eq!(BrokerEndpoint::from_advertisement("broker:notaport"), None);
        assert_eq!(BrokerEndpoint::from_advertisement("amqps://tls-only:5671"), None);
        assert_eq!(BrokerEndpoint::from_advertisement(":5672"), None);
    }

    #[test]
    fn test_lookup_data_json() {
        let json = r#"{
            "webServiceUrl": "http://10.0.0.5:8080",
            "pulsarServiceUrl": "pulsar://10.0.0.5:6650",
            "protocols": { "amqp": "10.0.0.5:5673" },
            "loadReportType": "LocalBrokerData"
        }"#;
        let data: ServiceLookupData = serde_json::from_str(json).unwrap();
        assert_eq!(data.protocol("amqp"), Some("10.0.0.5:5673"));
        assert_eq!(data.protocol("kafka"), None);
        assert_eq!(data.broker_service_url.as_deref(), Some("pulsar://10.0.0.5:6650"));
    }

    #[test]
    fn test_lookup_data_path() {
        assert_eq!(
            lookup_data_path("http://10.0.0.5:8080").as_deref(),
            Some("/loadbalance/brokers/10.0.0.5:8080")
        );
        assert_eq!(
            lookup_data_path("http://broker.local").as_deref(),
            Some("/loadbalance/brokers/broker.local:80")
        );
        assert_eq!(lookup_data_path("not a url"), None);
    }
}
