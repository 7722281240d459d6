//! UI utilities for AnyDrop CLI.

use std::io::{self, Write};

use anydrop_core::discovery::Device;
use anydrop_core::file::format_size;

const BAR_WIDTH: usize = 24;
const TABLE_WIDTH: usize = 60;

/// Render a progress line like `[#####-----]  45%  1.2 MB / 2.6 MB`.
pub fn progress_line(transferred: u64, total: u64) -> String {
    let ratio = if total == 0 {
        1.0
    } else {
        (transferred as f64 / total as f64).clamp(0.0, 1.0)
    };
    let filled = (ratio * BAR_WIDTH as f64).round() as usize;

    format!(
        "[{}{}] {:>3}%  {} / {}",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        (ratio * 100.0).round() as u64,
        format_size(transferred),
        format_size(total)
    )
}

/// Overwrite the current terminal line.
pub fn redraw(line: &str) {
    print!("\r  {}", line);
    let _ = io::stdout().flush();
}

/// Print the header of the device table.
pub fn print_device_header() {
    println!("{}", "─".repeat(TABLE_WIDTH));
    println!("  {:21}  {:20}  {:8}", "Address", "Name", "Class");
    println!("{}", "─".repeat(TABLE_WIDTH));
}

/// Print one row of the device table.
pub fn print_device_row(device: &Device) {
    println!(
        "  {:21}  {:20}  {:8}",
        device.id,
        truncate_string(&device.display_name, 20),
        device.class.to_string()
    );
}

/// Print the footer of the device table.
pub fn print_device_footer(count: usize) {
    if count == 0 {
        println!("  (no devices found)");
    }
    println!("{}", "─".repeat(TABLE_WIDTH));
}

/// Truncate a string to fit within a maximum width.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len - 1).collect();
        format!("{}…", truncated)
    }
}
