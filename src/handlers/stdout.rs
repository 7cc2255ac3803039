use std::io::{self, Stdout, Write};

use super::{EventHandler, EventRecord};
use crate::error::Result;

/// Writes one JSON object per event, newline terminated.
pub struct JsonLinesHandler<W: Write + Send> {
    writer: W,
}

impl JsonLinesHandler<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonLinesHandler<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> EventHandler for JsonLinesHandler<W> {
    fn handle(&mut self, record: &EventRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::RecordOptions;
    use chrono::{DateTime, Utc};
    use wirespan_core::events::HttpExchange;
    use wirespan_core::stream::FlowInfo;

    // Test 1: each record is a single JSON line with a flattened timestamp
    #[test]
    fn test_json_lines() {
        let flow = FlowInfo::new(2, "1.2.3.4:1000".parse().unwrap(), "5.6.7.8:80".parse().unwrap());
        let mut ex = HttpExchange::new(&flow, 77);
        ex.closed_at_us = Some(1_700_000_000_000_000);
        let at = DateTime::<Utc>::from_timestamp(1_700_000_001, 0).unwrap();
        let record = EventRecord::from_exchange(&ex, &RecordOptions::default(), at);

        let mut handler = JsonLinesHandler::new(Vec::new());
        handler.handle(&record).unwrap();
        handler.handle(&record).unwrap();
        let out = String::from_utf8(handler.into_inner()).unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(value["meta.seqack"], 77);
        assert_eq!(value["name"], "HTTP");
    }
}
