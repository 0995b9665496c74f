//! Operator-facing conversion banners.

use crate::task::ConversionTask;

const RULE_WIDTH: usize = 80;

/// Format a byte count as megabytes with two decimals
pub fn format_file_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0)
}

fn heavy_rule() -> String {
    "=".repeat(RULE_WIDTH)
}

fn light_rule() -> String {
    "─".repeat(RULE_WIDTH)
}

/// Banner printed when a job is admitted
pub fn conversion_started(task: &ConversionTask, started_at: &str) -> String {
    [
        String::new(),
        heavy_rule(),
        "CONVERSION STARTED".to_string(),
        light_rule(),
        format!("  File:     {}", task.display_name),
        format!("  Input:    {}", task.source_path.display()),
        format!("  Size:     {}", format_file_size(task.input_bytes)),
        format!("  Started:  {}", started_at),
        light_rule(),
    ]
    .join("\n")
}

/// Banner printed after the encoder finished successfully
pub fn conversion_complete(task: &ConversionTask, output_bytes: u64) -> String {
    let input_bytes = task.input_bytes;
    let change = if output_bytes <= input_bytes {
        let pct = if input_bytes > 0 {
            (1.0 - output_bytes as f64 / input_bytes as f64) * 100.0
        } else {
            0.0
        };
        format!(
            "  Size Reduction:  {} ({:.1}% smaller)",
            format_file_size(input_bytes - output_bytes),
            pct
        )
    } else {
        let pct = if input_bytes > 0 {
            (output_bytes as f64 / input_bytes as f64 - 1.0) * 100.0
        } else {
            100.0
        };
        format!(
            "  Size Increase:   {} ({:.1}% larger)",
            format_file_size(output_bytes - input_bytes),
            pct
        )
    };

    [
        String::new(),
        heavy_rule(),
        "CONVERSION COMPLETE".to_string(),
        light_rule(),
        format!("  File:            {}", task.display_name),
        format!("  Input Path:      {}", task.source_path.display()),
        format!("  Output Path:     {}", task.output_path.display()),
        format!("  Input Size:      {}", format_file_size(input_bytes)),
        format!("  Output Size:     {}", format_file_size(output_bytes)),
        change,
        light_rule(),
    ]
    .join("\n")
}

/// Diagnostic block printed when a job fails
pub fn conversion_failed(task: &ConversionTask, reason: &str) -> String {
    [
        String::new(),
        heavy_rule(),
        "CONVERSION FAILED".to_string(),
        light_rule(),
        format!("  File:     {}", task.display_name),
        format!("  Input:    {}", task.source_path.display()),
        format!("  Error:    {}", reason),
        light_rule(),
    ]
    .join("\n")
}
