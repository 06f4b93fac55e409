use std::io::{self, Write};

use colored::*;
use comfy_table::{Attribute, Cell, CellAlignment, ContentArrangement, Table};

use crate::onnx::{format_shape, ExportReport};

// Progress and reports go to stderr; stdout carries only results

/// Prints a highlighted stage header
pub fn stage(step: usize, total: usize, message: &str) {
    eprintln!("{} {}", format!("[{}/{}]", step, total).bright_black(), message.bold());
}

pub fn success(message: &str) {
    eprintln!("{} {}", "✓".green().bold(), message.green());
}

/// Displays the graph interface and statistics of an export on stderr.
pub fn print_export_report(report: &ExportReport) {
    // Nothing useful to do when stderr is gone
    let _ = write_export_report(&mut io::stderr().lock(), report);
}

/// Writes the export report table and summary lines to `out`.
///
/// # Arguments
///
/// * `out` - Destination of the report
/// * `report` - What the export stage produced
pub fn write_export_report<W: Write>(out: &mut W, report: &ExportReport) -> io::Result<()> {
    let header = |text: &str| Cell::new(text).fg(comfy_table::Color::Cyan).add_attribute(Attribute::Bold);

    let mut table = Table::new();
    table
        .set_header(vec![header("Direction"), header("Name"), header("Shape")])
        .load_preset(comfy_table::presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let rows = report
        .inputs
        .iter()
        .map(|value| ("input", value))
        .chain(report.outputs.iter().map(|value| ("output", value)));
    for (direction, (name, dims)) in rows {
        table.add_row(vec![
            Cell::new(direction).fg(comfy_table::Color::Yellow).set_alignment(CellAlignment::Center),
            Cell::new(name).fg(comfy_table::Color::Green),
            Cell::new(format_shape(dims)).fg(comfy_table::Color::White),
        ]);
    }

    writeln!(out, "\n{}", table)?;
    writeln!(out, "{}", "=".repeat(60).bright_black())?;
    writeln!(
        out,
        "{}",
        format!(
            "opset {} · IR {} · {} nodes · {} initializers ({} values){}",
            report.opset_version,
            report.ir_version,
            report.node_count,
            report.initializer_count,
            report.embedded_values,
            if report.constant_folding { " · BatchNorm folded" } else { "" }
        )
        .bright_green()
    )?;
    writeln!(
        out,
        "{}",
        format!(
            "{} bytes written to {} at {} (model loaded {})",
            report.bytes,
            report.path.display(),
            report.exported_at.format("%Y-%m-%d %H:%M:%S"),
            report.model_loaded_at.format("%Y-%m-%d %H:%M:%S")
        )
        .bright_black()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::Dim;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn report() -> ExportReport {
        let batch = || Dim::Symbolic("batch_size".to_string());
        ExportReport {
            path: PathBuf::from("../models/model.onnx"),
            bytes: 4096,
            opset_version: 11,
            ir_version: 6,
            inputs: vec![("input".to_string(), vec![batch(), Dim::Fixed(3), Dim::Fixed(512), Dim::Fixed(512)])],
            outputs: vec![("output".to_string(), vec![batch(), Dim::Fixed(1000)])],
            node_count: 12,
            initializer_count: 8,
            embedded_values: 1024,
            constant_folding: true,
            model_loaded_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            exported_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 31, 0).unwrap(),
        }
    }

    #[test]
    fn test_report_goes_to_the_given_writer() {
        colored::control::set_override(false);
        let mut out = Vec::new();
        write_export_report(&mut out, &report()).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("batch_size × 3 × 512 × 512"));
        assert!(text.contains("batch_size × 1000"));
        assert!(text.contains("opset 11 · IR 6 · 12 nodes · 8 initializers (1024 values) · BatchNorm folded"));
        assert!(text.contains("at 2024-05-01 09:31:00 (model loaded 2024-05-01 09:30:00)"));
    }
}
