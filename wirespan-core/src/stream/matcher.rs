//! Pairs requests with responses on one flow.
//!
//! Both parser tasks of a flow share one [`Matcher`]. Whichever half
//! arrives first is parked under its correlator id; the other half takes
//! it out again.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::events::{HttpExchange, HttpRequest, HttpResponse};
use crate::stream::FlowInfo;

/// One side of an exchange as it was parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Half<T> {
    pub message: T,
    pub timestamp_us: i64,
    pub packets: u32,
}

/// An exchange waiting for its other half.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingExchange {
    pub request: Option<Half<HttpRequest>>,
    pub response: Option<Half<HttpResponse>>,
}

impl PendingExchange {
    /// Build the exchange for `flow` under correlator `id`. `closed_at_us`
    /// is set when the flow's close released it.
    pub fn into_exchange(self, flow: &FlowInfo, id: u32, closed_at_us: Option<i64>) -> HttpExchange {
        let mut exchange = HttpExchange::new(flow, id);
        if let Some(req) = self.request {
            exchange.request_timestamp_us = Some(req.timestamp_us);
            exchange.request_packets = req.packets;
            exchange.request = Some(req.message);
        }
        if let Some(res) = self.response {
            exchange.response_timestamp_us = Some(res.timestamp_us);
            exchange.response_packets = res.packets;
            exchange.response = Some(res.message);
        }
        exchange.closed_at_us = closed_at_us;
        exchange
    }
}

/// Result of storing one half.
#[derive(Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Parked until the other half shows up.
    Pending,
    /// Both halves present; the entry has left the matcher.
    Matched(PendingExchange),
    /// The same side was already parked under this id. The parked entry
    /// keeps its place so it pairs with the first answer; the new half is
    /// handed back on its own.
    Displaced(PendingExchange),
}

#[derive(Debug, Default)]
pub struct Matcher {
    entries: Mutex<HashMap<u32, PendingExchange>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_store_request(
        &self,
        id: u32,
        timestamp_us: i64,
        request: HttpRequest,
        packets: u32,
    ) -> MatchOutcome {
        let half = Half {
            message: request,
            timestamp_us,
            packets,
        };
        let mut entries = self.entries.lock();
        match entries.remove(&id) {
            None => {
                entries.insert(
                    id,
                    PendingExchange {
                        request: Some(half),
                        response: None,
                    },
                );
                MatchOutcome::Pending
            }
            Some(mut found) if found.request.is_none() => {
                found.request = Some(half);
                MatchOutcome::Matched(found)
            }
            Some(parked) => {
                entries.insert(id, parked);
                MatchOutcome::Displaced(PendingExchange {
                    request: Some(half),
                    response: None,
                })
            }
        }
    }

    pub fn get_or_store_response(
        &self,
        id: u32,
        timestamp_us: i64,
        response: HttpResponse,
        packets: u32,
    ) -> MatchOutcome {
        let half = Half {
            message: response,
            timestamp_us,
            packets,
        };
        let mut entries = self.entries.lock();
        match entries.remove(&id) {
            None => {
                entries.insert(
                    id,
                    PendingExchange {
                        request: None,
                        response: Some(half),
                    },
                );
                MatchOutcome::Pending
            }
            Some(mut found) if found.response.is_none() => {
                found.response = Some(half);
                MatchOutcome::Matched(found)
            }
            Some(parked) => {
                entries.insert(id, parked);
                MatchOutcome::Displaced(PendingExchange {
                    request: None,
                    response: Some(half),
                })
            }
        }
    }

    /// Whether a `HEAD` request is parked under `id`. Its response has no
    /// body whatever its Content-Length says.
    pub fn answers_head(&self, id: u32) -> bool {
        self.entries
            .lock()
            .get(&id)
            .and_then(|entry| entry.request.as_ref())
            .is_some_and(|req| req.message.method.eq_ignore_ascii_case("HEAD"))
    }

    /// Take every parked entry, ordered by id.
    pub fn drain(&self) -> Vec<(u32, PendingExchange)> {
        let mut drained: Vec<_> = self.entries.lock().drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Headers;

    fn request(target: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            target: target.into(),
            version: 1,
            content_length: 0,
            headers: Headers::new(),
        }
    }

    fn response(status: u16) -> HttpResponse {
        HttpResponse {
            status,
            reason: "".into(),
            version: 1,
            content_length: 0,
            headers: Headers::new(),
        }
    }

    // Test 1: request first, then response
    #[test]
    fn test_request_then_response() {
        let matcher = Matcher::new();
        assert_eq!(
            matcher.get_or_store_request(7, 100, request("/a"), 2),
            MatchOutcome::Pending
        );
        assert_eq!(matcher.len(), 1);
        let MatchOutcome::Matched(found) = matcher.get_or_store_response(7, 150, response(200), 3) else {
            panic!("expected a match");
        };
        assert_eq!(found.request.unwrap().packets, 2);
        assert_eq!(found.response.unwrap().timestamp_us, 150);
        assert!(matcher.is_empty());
    }

    // Test 2: response stored first keeps its packet count
    #[test]
    fn test_response_then_request() {
        let matcher = Matcher::new();
        assert_eq!(
            matcher.get_or_store_response(12345, 10, response(418), 4),
            MatchOutcome::Pending
        );
        let MatchOutcome::Matched(found) = matcher.get_or_store_request(12345, 5, request("/t"), 1) else {
            panic!("expected a match");
        };
        let res = found.response.as_ref().unwrap();
        assert_eq!(res.packets, 4);
        assert_eq!(res.message.status, 418);
        assert_eq!(found.request.as_ref().unwrap().message.target, "/t");

        let flow = FlowInfo::new(1, "1.2.3.4:5000".parse().unwrap(), "5.6.7.8:80".parse().unwrap());
        let exchange = found.into_exchange(&flow, 12345, None);
        assert!(exchange.is_complete());
        assert_eq!(exchange.response_packets, 4);
        assert_eq!(exchange.duration_us(), Some(5));
    }

    // Test 3: a second request under the same id is handed back, the first stays parked
    #[test]
    fn test_same_side_collision() {
        let matcher = Matcher::new();
        matcher.get_or_store_request(1, 1, request("/old"), 1);
        let MatchOutcome::Displaced(newer) = matcher.get_or_store_request(1, 2, request("/new"), 1) else {
            panic!("expected displacement");
        };
        assert_eq!(newer.request.unwrap().message.target, "/new");
        assert_eq!(matcher.len(), 1);

        let MatchOutcome::Matched(found) = matcher.get_or_store_response(1, 3, response(200), 1) else {
            panic!("expected the parked request to match");
        };
        assert_eq!(found.request.unwrap().message.target, "/old");
        assert!(matcher.is_empty());
    }

    // Test 4: a second response under the same id leaves the first one parked
    #[test]
    fn test_response_collision() {
        let matcher = Matcher::new();
        matcher.get_or_store_response(9, 10, response(200), 1);
        let MatchOutcome::Displaced(newer) = matcher.get_or_store_response(9, 20, response(500), 1) else {
            panic!("expected displacement");
        };
        assert_eq!(newer.response.unwrap().message.status, 500);

        let drained = matcher.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.response.as_ref().unwrap().message.status, 200);
    }

    // Test 5: only a parked HEAD request marks its response bodiless
    #[test]
    fn test_answers_head() {
        let matcher = Matcher::new();
        let mut head = request("/h");
        head.method = "HEAD".into();
        matcher.get_or_store_request(3, 1, head, 1);
        matcher.get_or_store_request(4, 1, request("/g"), 1);
        assert!(matcher.answers_head(3));
        assert!(!matcher.answers_head(4));
        assert!(!matcher.answers_head(5));
    }
}
