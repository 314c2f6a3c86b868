//! Plain-text table of the queue.

use chrono::{DateTime, Utc};

use crate::model::Operation;

const HEADERS: [&str; 6] = [
    "USSD Code",
    "SIM Slot",
    "Status",
    "Result",
    "Created",
    "Executed",
];

/// Longest outcome shown before truncation, in characters.
const MAX_RESULT_WIDTH: usize = 40;

const EMPTY: &str = "No operations found";

/// Renders operations in the given order, one row each.
pub fn render_table(operations: &[Operation]) -> String {
    if operations.is_empty() {
        return format!("{}\n", EMPTY);
    }

    let rows: Vec<[String; 6]> = operations.iter().map(row).collect();

    let mut widths = HEADERS.map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_line(&mut out, &HEADERS.map(String::from), &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&rule.join("-+-"));
    out.push('\n');
    for row in &rows {
        push_line(&mut out, row, &widths);
    }
    out
}

fn row(op: &Operation) -> [String; 6] {
    let outcome = op
        .outcome()
        .map(|text| truncate(text, MAX_RESULT_WIDTH))
        .unwrap_or_else(|| "-".to_string());

    [
        op.ussd_code.clone(),
        format!("SIM {}", op.sim_slot),
        op.status.to_string(),
        outcome,
        timestamp(op.created_at),
        op.executed_at.map(timestamp).unwrap_or_else(|| "-".to_string()),
    ]
}

fn push_line(out: &mut String, cells: &[String; 6], widths: &[usize; 6]) {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = width))
        .collect();
    out.push_str(padded.join(" | ").trim_end());
    out.push('\n');
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%b %d, %H:%M:%S").to_string()
}

fn truncate(text: &str, max: usize) -> String {
    // Multi-line modem replies are flattened onto one line.
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let mut cut: String = flat.chars().take(max - 1).collect();
    cut.push('…');
    cut
}
