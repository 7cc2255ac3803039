//! Flattening an exchange into the attributes of one event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use wirespan_core::events::{Headers, HttpExchange};

/// Identity of the agent instance, attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentInfo {
    pub node_ip: Option<String>,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub pod_name: Option<String>,
    pub service_account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOptions {
    /// Report the request target as `url.path`.
    pub include_request_url: bool,
    pub agent: AgentInfo,
    pub additional_attributes: Vec<(String, String)>,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            include_request_url: true,
            agent: AgentInfo::default(),
            additional_attributes: Vec::new(),
        }
    }
}

/// One event as handed to an [`EventHandler`](super::EventHandler).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl EventRecord {
    pub fn from_exchange(exchange: &HttpExchange, options: &RecordOptions, handled_at: DateTime<Utc>) -> Self {
        let mut record = EventRecord {
            timestamp: handled_at,
            attributes: Map::new(),
        };

        for (key, value) in &options.additional_attributes {
            record.set(key, value.as_str());
        }
        record.add_agent(&options.agent);
        record.add_timing(exchange, handled_at);

        record.set("meta.stream.ident", exchange.stream_ident.as_str());
        record.set("meta.seqack", i64::from(exchange.seqack));
        record.set("meta.request.packet_count", exchange.request_packets);
        record.set("meta.response.packet_count", exchange.response_packets);
        record.set("client.socket.address", exchange.client.ip().to_string());
        record.set("server.socket.address", exchange.server.ip().to_string());

        match &exchange.request {
            Some(request) => {
                record.set("name", format!("HTTP {}", request.method));
                record.set("http.request.method", request.method.as_str());
                if let Some(agent) = request.header("User-Agent") {
                    record.set("user_agent.original", agent);
                }
                record.set("http.request.body.size", request.content_length);
                if options.include_request_url {
                    record.set("url.path", request.target.as_str());
                }
                record.add_headers("http.request.header", &request.headers);
            }
            None => {
                record.set("name", "HTTP");
                record.set("http.request.missing", "no request on this event");
            }
        }

        match &exchange.response {
            Some(response) => {
                record.set("http.response.status_code", response.status);
                if response.status >= 500 {
                    record.set("error", "HTTP server error");
                } else if response.status >= 400 {
                    record.set("error", "HTTP client error");
                }
                record.set("http.response.body.size", response.content_length);
                record.add_headers("http.response.header", &response.headers);
            }
            None => {
                record.set("http.response.missing", "no response on this event");
            }
        }

        record
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    fn add_agent(&mut self, agent: &AgentInfo) {
        self.set("meta.agent.version", wirespan_core::VERSION);
        let fields = [
            ("meta.agent.node.ip", &agent.node_ip),
            ("meta.agent.node.name", &agent.node_name),
            ("meta.agent.pod.ip", &agent.pod_ip),
            ("meta.agent.pod.name", &agent.pod_name),
            ("meta.agent.serviceaccount.name", &agent.service_account),
        ];
        for (key, value) in fields {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                self.set(key, value);
            }
        }
    }

    fn add_timing(&mut self, exchange: &HttpExchange, handled_at: DateTime<Utc>) {
        self.set("meta.event_handled_at", handled_at.to_rfc3339());

        let request_at = exchange.request_timestamp_us.and_then(DateTime::<Utc>::from_timestamp_micros);
        let response_at = exchange.response_timestamp_us.and_then(DateTime::<Utc>::from_timestamp_micros);

        if let Some(at) = request_at {
            self.set("http.request.timestamp", at.to_rfc3339());
            self.set(
                "meta.request.capture_to_handle.latency_ms",
                (handled_at - at).num_milliseconds(),
            );
        }
        if let Some(at) = response_at {
            self.set("http.response.timestamp", at.to_rfc3339());
            self.set(
                "meta.response.capture_to_handle.latency_ms",
                (handled_at - at).num_milliseconds(),
            );
        }

        match (request_at, response_at) {
            (Some(_), Some(_)) => {
                if let Some(duration_us) = exchange.duration_us() {
                    self.set("duration_ms", duration_us / 1000);
                }
            }
            (None, Some(_)) => self.set("meta.timestamps_missing", "request"),
            (Some(_), None) => self.set("meta.timestamps_missing", "response"),
            (None, None) => self.set("meta.timestamps_missing", "request, response"),
        }

        self.timestamp = exchange
            .timestamp_us()
            .and_then(DateTime::<Utc>::from_timestamp_micros)
            .unwrap_or(handled_at);
    }

    fn add_headers(&mut self, prefix: &str, headers: &Headers) {
        for (name, value) in headers {
            let key = format!("{prefix}.{}", name.to_ascii_lowercase().replace('-', "_"));
            self.set(&key, value.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirespan_core::events::{HttpRequest, HttpResponse};
    use wirespan_core::stream::FlowInfo;

    fn flow() -> FlowInfo {
        FlowInfo::new(
            1,
            "1.2.3.4:40000".parse().unwrap(),
            "5.6.7.8:80".parse().unwrap(),
        )
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect()
    }

    fn teapot_exchange() -> HttpExchange {
        let mut ex = HttpExchange::new(&flow(), 12345);
        ex.request = Some(HttpRequest {
            method: "GET".into(),
            target: "/check?teapot=true".into(),
            version: 1,
            content_length: 42,
            headers: headers(&[("User-Agent", "teapot-checker/1.0")]),
        });
        ex.response = Some(HttpResponse {
            status: 418,
            reason: "I'm a teapot".into(),
            version: 1,
            content_length: 84,
            headers: Headers::new(),
        });
        ex.request_timestamp_us = Some(1_700_000_000_000_000);
        ex.response_timestamp_us = Some(1_700_000_000_003_000);
        ex.request_packets = 1;
        ex.response_packets = 2;
        ex
    }

    fn handled_at() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(1_700_000_000_010_000).unwrap()
    }

    // Test 1: the teapot exchange carries every required attribute
    #[test]
    fn test_complete_exchange() {
        let record = EventRecord::from_exchange(&teapot_exchange(), &RecordOptions::default(), handled_at());

        assert_eq!(record.get("name").unwrap(), "HTTP GET");
        assert_eq!(record.get("http.request.method").unwrap(), "GET");
        assert_eq!(record.get("url.path").unwrap(), "/check?teapot=true");
        assert_eq!(record.get("http.request.body.size").unwrap(), 42);
        assert_eq!(record.get("http.response.status_code").unwrap(), 418);
        assert_eq!(record.get("http.response.body.size").unwrap(), 84);
        assert_eq!(record.get("user_agent.original").unwrap(), "teapot-checker/1.0");
        assert_eq!(record.get("duration_ms").unwrap(), 3);
        assert_eq!(record.get("client.socket.address").unwrap(), "1.2.3.4");
        assert_eq!(record.get("server.socket.address").unwrap(), "5.6.7.8");
        assert_eq!(record.get("error").unwrap(), "HTTP client error");
        assert_eq!(record.get("meta.seqack").unwrap(), 12345);
        assert_eq!(record.get("meta.stream.ident").unwrap(), "1.2.3.4->5.6.7.8:40000->80:1");
        assert_eq!(record.get("meta.response.packet_count").unwrap(), 2);
        assert!(record.get("http.request.missing").is_none());
        assert!(record.get("http.response.missing").is_none());
        assert!(record.get("meta.timestamps_missing").is_none());
        assert_eq!(record.timestamp.timestamp_micros(), 1_700_000_000_000_000);
    }

    // Test 2: only allow-listed headers become attributes
    #[test]
    fn test_header_attributes() {
        let mut ex = teapot_exchange();
        if let Some(req) = ex.request.as_mut() {
            req.headers = headers(&[("User-Agent", "curl/8"), ("X-Test", "yes")]);
        }
        let record = EventRecord::from_exchange(&ex, &RecordOptions::default(), handled_at());
        let header_keys: Vec<&String> = record
            .attributes
            .keys()
            .filter(|k| k.starts_with("http.request.header."))
            .collect();
        assert_eq!(header_keys, vec!["http.request.header.user_agent", "http.request.header.x_test"]);
        assert_eq!(record.get("http.request.header.x_test").unwrap(), "yes");
    }

    // Test 3: a missing response is flagged and time falls back to the request
    #[test]
    fn test_missing_response() {
        let mut ex = teapot_exchange();
        ex.response = None;
        ex.response_timestamp_us = None;
        ex.closed_at_us = Some(1_700_000_000_009_000);
        let record = EventRecord::from_exchange(&ex, &RecordOptions::default(), handled_at());
        assert_eq!(record.get("http.response.missing").unwrap(), "no response on this event");
        assert_eq!(record.get("meta.timestamps_missing").unwrap(), "response");
        assert!(record.get("duration_ms").is_none());
        assert!(record.get("error").is_none());
        assert_eq!(record.timestamp.timestamp_micros(), 1_700_000_000_000_000);
    }

    // Test 4: a missing request renames the event and uses the response time
    #[test]
    fn test_missing_request() {
        let mut ex = teapot_exchange();
        ex.request = None;
        ex.request_timestamp_us = None;
        if let Some(res) = ex.response.as_mut() {
            res.status = 503;
        }
        let record = EventRecord::from_exchange(&ex, &RecordOptions::default(), handled_at());
        assert_eq!(record.get("name").unwrap(), "HTTP");
        assert_eq!(record.get("http.request.missing").unwrap(), "no request on this event");
        assert_eq!(record.get("meta.timestamps_missing").unwrap(), "request");
        assert_eq!(record.get("error").unwrap(), "HTTP server error");
        assert!(record.get("http.request.method").is_none());
        assert_eq!(record.timestamp.timestamp_micros(), 1_700_000_000_003_000);
    }

    // Test 5: agent fields, extra attributes and the url toggle
    #[test]
    fn test_options() {
        let options = RecordOptions {
            include_request_url: false,
            agent: AgentInfo {
                node_name: Some("node-a".into()),
                pod_ip: Some(String::new()),
                ..AgentInfo::default()
            },
            additional_attributes: vec![("env".into(), "prod".into())],
        };
        let record = EventRecord::from_exchange(&teapot_exchange(), &options, handled_at());
        assert!(record.get("url.path").is_none());
        assert_eq!(record.get("meta.agent.node.name").unwrap(), "node-a");
        assert!(record.get("meta.agent.pod.ip").is_none());
        assert_eq!(record.get("env").unwrap(), "prod");
        assert_eq!(record.get("meta.agent.version").unwrap(), wirespan_core::VERSION);
    }

    // Test 6: with neither timestamp the close time is reported
    #[test]
    fn test_no_timestamps() {
        let mut ex = HttpExchange::new(&flow(), 9);
        ex.closed_at_us = Some(1_700_000_000_005_000);
        let record = EventRecord::from_exchange(&ex, &RecordOptions::default(), handled_at());
        assert_eq!(record.get("meta.timestamps_missing").unwrap(), "request, response");
        assert_eq!(record.timestamp.timestamp_micros(), 1_700_000_000_005_000);
    }
}
