use chrono::DateTime;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::models::StoredMessage;
use crate::db::DatabaseStats;
use crate::extract::ExtractedRecord;
use crate::pipeline::RunReport;

const FROM_WIDTH: usize = 24;
const SUBJECT_WIDTH: usize = 56;
const DATE_WIDTH: usize = 16;
const URL_PLACEHOLDER: &str = "N/A";
const BODY_WRAP_WIDTH: usize = 100;

pub fn format_record(record: &ExtractedRecord) -> String {
    let subject = if record.subject.is_empty() {
        "(no subject)"
    } else {
        record.subject.as_str()
    };
    let urls = if record.urls.is_empty() {
        URL_PLACEHOLDER.to_string()
    } else {
        record.urls.join(", ")
    };

    format!(
        "{}  {}\n\t{}",
        record.id,
        truncate_for_width(subject, SUBJECT_WIDTH),
        urls
    )
}

pub fn format_report(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str("Sync summary\n");
    out.push_str("============\n");
    out.push_str(&format!("Pages:           {}\n", report.pages));
    out.push_str(&format!("Listed:          {}\n", report.listed));
    out.push_str(&format!("Received:        {}\n", report.received));
    out.push_str(&format!("Fetch failures:  {}\n", report.fetch_failures));
    out.push_str(&format!("Decode failures: {}\n", report.decode_failures));
    out.push_str(&format!("Displayed:       {}\n", report.displayed));
    out.push_str(&format!(
        "Stored:          {} inserted, {} updated, {} unchanged\n",
        report.inserted, report.updated, report.unchanged
    ));
    if report.cancelled {
        out.push_str(&format!(
            "Cancelled:       yes ({} producer task(s) stopped early)\n",
            report.cancelled_tasks
        ));
    }

    if !report.failures.is_empty() {
        out.push('\n');
        out.push_str("Failures\n");
        out.push_str("--------\n");
        for failure in &report.failures {
            out.push_str(&format!(
                "{:<20} {:<7} {}\n",
                truncate_for_width(&failure.id, 20),
                failure.kind.as_str(),
                failure.message
            ));
        }
    }

    out
}

pub fn format_stored_message(message: &StoredMessage) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", message.message_id));
    out.push_str(&format!(
        "Subject: {}\n",
        message.subject.as_deref().unwrap_or("(no subject)")
    ));
    out.push_str(&format!(
        "From: {}\n",
        message.from_address.as_deref().unwrap_or("(unknown)")
    ));
    out.push_str(&format!("Received: {}\n", received_date(message.received_at)));
    if let Some(stored_at) = &message.stored_at {
        out.push_str(&format!("Stored: {stored_at}\n"));
    }

    let urls = message.url_list();
    out.push('\n');
    out.push_str("Links\n");
    out.push_str("-----\n");
    if urls.is_empty() {
        out.push_str(URL_PLACEHOLDER);
        out.push('\n');
    }
    for url in urls {
        out.push_str(&url);
        out.push('\n');
    }

    out.push('\n');
    out.push_str("Body\n");
    out.push_str("----\n");
    let body = message
        .body
        .as_deref()
        .map(html_to_text)
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| "(empty)".to_string());
    out.push_str(&body);
    out.push('\n');
    out
}

pub fn format_stored_messages(messages: &[StoredMessage]) -> String {
    if messages.is_empty() {
        return "No stored messages.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<from$}  {:<subject$}  {:<date$}  {}\n",
        "From",
        "Subject",
        "Received",
        "Links",
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH,
        date = DATE_WIDTH,
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}\n",
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(DATE_WIDTH),
        "-".repeat(5)
    ));

    for message in messages {
        let from = truncate_for_width(
            message.from_address.as_deref().unwrap_or("(unknown)"),
            FROM_WIDTH,
        );
        let subject = truncate_for_width(
            message.subject.as_deref().unwrap_or("(no subject)"),
            SUBJECT_WIDTH,
        );
        out.push_str(&format!(
            "{}  {}  {:<date$}  {}\n",
            pad_to_width(&from, FROM_WIDTH),
            pad_to_width(&subject, SUBJECT_WIDTH),
            received_date(message.received_at),
            message.url_list().len(),
            date = DATE_WIDTH,
        ));
    }

    out
}

pub fn format_stats(stats: &DatabaseStats) -> String {
    let mut out = String::new();
    out.push_str("Recipe Sync Stats\n");
    out.push_str("=================\n");
    out.push_str(&format!("Messages:      {}\n", stats.total_messages));
    out.push_str(&format!("With links:    {}\n", stats.messages_with_urls));
    out.push_str(&format!(
        "Newest:        {}\n",
        stats
            .newest_received_at
            .map(received_date)
            .unwrap_or_else(|| "-".to_string())
    ));
    out.push_str(&format!(
        "Last sync:     {}\n",
        stats.last_sync.as_deref().unwrap_or("never")
    ));
    out
}

fn received_date(received_at_ms: i64) -> String {
    if received_at_ms <= 0 {
        return "unknown".to_string();
    }
    DateTime::from_timestamp_millis(received_at_ms)
        .map(|date| date.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| received_at_ms.to_string())
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), BODY_WRAP_WIDTH)
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn pad_to_width(value: &str, width: usize) -> String {
    let used = UnicodeWidthStr::width(value);
    format!("{value}{}", " ".repeat(width.saturating_sub(used)))
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}
