use std::io::Write;
use std::num::NonZeroUsize;

use anyhow::{Context, Result};

use crate::models::Reading;

pub const CSV_HEADER: &str = "time,timestamp,accelerationX,accelerationY,accelerationZ,\
rotationRateX,rotationRateY,rotationRateZ,gravityX,gravityY,gravityZ,pitch,roll,yaw";

/// Shortest round-trip decimal text. Integral values keep a trailing `.0`;
/// non-finite values render as `0.0`.
pub fn format_value(value: f64) -> String {
    if !value.is_finite() {
        return "0.0".to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e16 {
        // -0.0 prints as 0.0
        return format!("{:.1}", value + 0.0);
    }
    format!("{value}")
}

fn push_text_cell(row: &mut String, text: &str) {
    if text.contains([',', '"', '\n', '\r']) {
        row.push('"');
        row.push_str(&text.replace('"', "\"\""));
        row.push('"');
    } else {
        row.push_str(text);
    }
}

fn push_row(out: &mut String, reading: &Reading) {
    out.push_str(&format_value(reading.time));
    out.push(',');
    if let Some(timestamp) = &reading.timestamp {
        push_text_cell(out, timestamp);
    }
    for value in reading.motion_values() {
        out.push(',');
        out.push_str(&format_value(value));
    }
    out.push('\n');
}

/// Writes the header and then `readings` in batches of `batch_rows`. Each
/// batch is handed to `writer` before the next one is formatted. Returns the
/// number of batches written.
pub fn export_session_to_writer<W: Write>(
    readings: &[Reading],
    writer: &mut W,
    batch_rows: NonZeroUsize,
) -> Result<usize> {
    writer
        .write_all(CSV_HEADER.as_bytes())
        .and_then(|_| writer.write_all(b"\n"))
        .context("failed to write csv header")?;

    let mut buffer = String::new();
    let mut flushes = 0;
    for rows in readings.chunks(batch_rows.get()) {
        buffer.clear();
        for reading in rows {
            push_row(&mut buffer, reading);
        }
        writer
            .write_all(buffer.as_bytes())
            .with_context(|| format!("failed to write csv rows (batch {})", flushes + 1))?;
        flushes += 1;
    }

    writer.flush().context("failed to flush csv output")?;
    Ok(flushes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MotionSample;

    fn rows(count: usize) -> Vec<Reading> {
        (0..count).map(|i| Reading::at(i as f64 * 0.01)).collect()
    }

    struct CountingWriter {
        bytes: Vec<u8>,
        writes: usize,
    }

    impl Write for CountingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes += 1;
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn values_are_shortest_decimal_text() {
        assert_eq!(format_value(0.0), "0.0");
        assert_eq!(format_value(-0.0), "0.0");
        assert_eq!(format_value(1.0), "1.0");
        assert_eq!(format_value(-9.0), "-9.0");
        assert_eq!(format_value(0.01), "0.01");
        assert_eq!(format_value(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_value(f64::NAN), "0.0");
        assert_eq!(format_value(f64::INFINITY), "0.0");
    }

    #[test]
    fn row_matches_header_order() {
        let sample = MotionSample {
            user_acceleration: [1.0, 2.0, 3.0],
            rotation_rate: [4.0, 5.0, 6.0],
            gravity: [7.0, 8.0, 9.0],
            attitude: [0.1, 0.2, 0.3],
        };
        let reading = Reading::new(0.5, Some("2024-07-02 12:00:00.500".into()), sample);

        let mut out = Vec::new();
        export_session_to_writer(&[reading], &mut out, NonZeroUsize::new(10).unwrap()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(
            lines[1],
            "0.5,2024-07-02 12:00:00.500,1.0,2.0,3.0,4.0,5.0,6.0,7.0,8.0,9.0,0.1,0.2,0.3"
        );
    }

    #[test]
    fn missing_timestamp_is_an_empty_cell() {
        let mut out = Vec::new();
        export_session_to_writer(&[Reading::at(0.0)], &mut out, NonZeroUsize::new(1).unwrap())
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().nth(1).unwrap().starts_with("0.0,,0.0"));
    }

    #[test]
    fn rows_are_written_in_batches() {
        let mut writer = CountingWriter {
            bytes: Vec::new(),
            writes: 0,
        };
        let flushes =
            export_session_to_writer(&rows(2500), &mut writer, NonZeroUsize::new(1000).unwrap())
                .unwrap();

        assert_eq!(flushes, 3);
        let text = String::from_utf8(writer.bytes).unwrap();
        assert_eq!(text.lines().count(), 2501);
        // header + newline + three row batches
        assert_eq!(writer.writes, 5);
    }

    #[test]
    fn empty_session_is_header_only() {
        let mut out = Vec::new();
        let flushes =
            export_session_to_writer(&[], &mut out, NonZeroUsize::new(1000).unwrap()).unwrap();
        assert_eq!(flushes, 0);
        assert_eq!(String::from_utf8(out).unwrap(), format!("{CSV_HEADER}\n"));
    }
}
