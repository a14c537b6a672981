use anyhow::Result;

use crate::db::models::StoredMessage;
use crate::db::DatabaseStats;
use crate::extract::ExtractedRecord;
use crate::pipeline::RunReport;

// Compact so a run streams as JSON lines.
pub fn format_record(record: &ExtractedRecord) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

pub fn format_report(report: &RunReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn format_stored_message(message: &StoredMessage) -> Result<String> {
    Ok(serde_json::to_string_pretty(message)?)
}

pub fn format_stored_messages(messages: &[StoredMessage]) -> Result<String> {
    Ok(serde_json::to_string_pretty(messages)?)
}

pub fn format_stats(stats: &DatabaseStats) -> Result<String> {
    Ok(serde_json::to_string_pretty(stats)?)
}

#[cfg(test)]
mod tests {
    use super::format_record;
    use crate::extract::ExtractedRecord;

    #[test]
    fn record_is_a_single_json_line() {
        let record = ExtractedRecord {
            id: "m1".to_string(),
            from: "a@example.com".to_string(),
            subject: "Pie\nCrust".to_string(),
            body: "<p>pie</p>".to_string(),
            urls: vec!["http://pie.example".to_string()],
            received_at_ms: 42,
        };
        let line = format_record(&record).expect("serialize record");
        assert!(!line.contains('\n'));

        let parsed: ExtractedRecord = serde_json::from_str(&line).expect("parse back");
        assert_eq!(parsed, record);
    }
}
