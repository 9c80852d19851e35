use anyhow::{Context, Result};
use chrono::Local;
use csv::Writer;
use serde::Serialize;
use std::fs::{create_dir_all, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Serialize, Clone)]
pub struct TradeRecord {
    pub timestamp: String,
    pub symbol: String,
    pub event: String, // REQ, FILL
    pub side: String,
    pub price: f64,
    pub quantity: f64,
    pub order_id: Option<u64>,
    pub client_id: Option<String>,
    pub profit: Option<f64>,
}

/// Append-only CSV audit trail of order requests and fills.
#[derive(Clone)]
pub struct TradeAuditLogger {
    writer: Arc<Mutex<Writer<std::fs::File>>>,
}

impl TradeAuditLogger {
    pub fn new(log_dir: &str) -> Result<Self> {
        let dir = Path::new(log_dir);
        create_dir_all(dir).context("Failed to create log directory")?;

        let file_path = dir.join("trade_audit.csv");
        let file_exists = file_path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .context("Failed to open trade_audit.csv")?;

        let writer = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn log(&self, record: TradeRecord) {
        if let Ok(mut w) = self.writer.lock() {
            if let Err(e) = w.serialize(record) {
                eprintln!("Failed to write trade audit log: {}", e);
            } else {
                let _ = w.flush();
            }
        }
    }

    pub fn log_request(
        &self,
        symbol: &str,
        side: &str,
        price: f64,
        quantity: f64,
        client_id: Option<Uuid>,
    ) {
        self.log(TradeRecord {
            timestamp: Local::now().to_rfc3339(),
            symbol: symbol.to_string(),
            event: "REQ".to_string(),
            side: side.to_string(),
            price,
            quantity,
            order_id: None,
            client_id: client_id.map(|c| c.to_string()),
            profit: None,
        });
    }

    pub fn log_fill(
        &self,
        symbol: &str,
        side: &str,
        price: f64,
        quantity: f64,
        order_id: u64,
        profit: f64,
    ) {
        self.log(TradeRecord {
            timestamp: Local::now().to_rfc3339(),
            symbol: symbol.to_string(),
            event: "FILL".to_string(),
            side: side.to_string(),
            price,
            quantity,
            order_id: Some(order_id),
            client_id: None,
            profit: Some(profit),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_audit_log_header() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap();
        let logger = TradeAuditLogger::new(log_dir).unwrap();

        logger.log_request("ADAUSDT", "BUY", 0.795, 13.0, None);

        let file_path = dir.path().join("trade_audit.csv");
        let content = std::fs::read_to_string(file_path).unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();

        // Should have exactly 2 lines: header + 1 record
        assert_eq!(lines.len(), 2);
        assert!(lines[0]
            .contains("timestamp,symbol,event,side,price,quantity,order_id,client_id,profit"));
        assert!(lines[1].contains("ADAUSDT,REQ,BUY,0.795,13.0"));
    }

    #[test]
    fn test_fill_record_carries_profit() {
        let dir = tempdir().unwrap();
        let logger = TradeAuditLogger::new(dir.path().to_str().unwrap()).unwrap();

        logger.log_fill("ADAUSDT", "SELL", 0.80, 13.0, 42, 0.065);

        let content =
            std::fs::read_to_string(dir.path().join("trade_audit.csv")).unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("FILL,SELL,0.8,13.0,42,,0.065"));
    }
}
