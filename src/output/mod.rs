pub mod json;
pub mod table;

use anyhow::Result;

use crate::db::models::StoredMessage;
use crate::db::DatabaseStats;
use crate::extract::ExtractedRecord;
use crate::pipeline::RunReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// One line (table) or one JSON object (json) per delivered record.
pub fn format_record(format: OutputFormat, record: &ExtractedRecord) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_record(record)),
        OutputFormat::Json => json::format_record(record),
    }
}

pub fn format_report(format: OutputFormat, report: &RunReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_report(report)),
        OutputFormat::Json => json::format_report(report),
    }
}

pub fn format_stored_message(format: OutputFormat, message: &StoredMessage) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stored_message(message)),
        OutputFormat::Json => json::format_stored_message(message),
    }
}

pub fn format_stored_messages(format: OutputFormat, messages: &[StoredMessage]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stored_messages(messages)),
        OutputFormat::Json => json::format_stored_messages(messages),
    }
}

pub fn format_stats(format: OutputFormat, stats: &DatabaseStats) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stats(stats)),
        OutputFormat::Json => json::format_stats(stats),
    }
}
