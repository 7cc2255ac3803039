//! Event output.
//!
//! The emitter task pops completed exchanges off the event queue, turns
//! each into an [`EventRecord`] and hands it to an [`EventHandler`].

mod record;
mod stdout;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use wirespan_core::EventQueue;

use crate::error::Result;

pub use record::{AgentInfo, EventRecord, RecordOptions};
pub use stdout::JsonLinesHandler;

/// Destination for event records.
pub trait EventHandler: Send {
    fn handle(&mut self, record: &EventRecord) -> Result<()>;

    /// Push out anything buffered. Called once the queue is drained.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drain `queue` into `handler` until the queue is closed and empty.
/// Returns the number of records handled.
pub async fn run_emitter<H: EventHandler>(
    queue: Arc<EventQueue>,
    mut handler: H,
    options: RecordOptions,
) -> u64 {
    let mut handled = 0;
    while let Some(exchange) = queue.pop().await {
        let record = EventRecord::from_exchange(&exchange, &options, Utc::now());
        match handler.handle(&record) {
            Ok(()) => {
                handled += 1;
                debug!(id = %exchange.display_id(), "event sent");
            }
            Err(e) => warn!(id = %exchange.display_id(), error = %e, "cannot emit event"),
        }
    }
    if let Err(e) = handler.flush() {
        warn!(error = %e, "cannot flush event handler");
    }
    handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirespan_core::events::HttpExchange;
    use wirespan_core::stream::FlowInfo;
    use wirespan_core::Stats;

    #[derive(Default)]
    struct Collect(Vec<EventRecord>);

    impl EventHandler for Collect {
        fn handle(&mut self, record: &EventRecord) -> Result<()> {
            self.0.push(record.clone());
            Ok(())
        }
    }

    // Test 1: the emitter drains the queue in order and stops on close
    #[tokio::test]
    async fn test_emitter_drains() {
        let queue = Arc::new(EventQueue::new(8, Arc::new(Stats::new())));
        let flow = FlowInfo::new(4, "1.2.3.4:1000".parse().unwrap(), "5.6.7.8:80".parse().unwrap());
        queue.push(HttpExchange::new(&flow, 1));
        queue.push(HttpExchange::new(&flow, 2));
        queue.close();

        let handled = run_emitter(Arc::clone(&queue), Collect::default(), RecordOptions::default()).await;
        assert_eq!(handled, 2);
        assert!(queue.is_empty());
    }
}
