//! Graphite plaintext protocol: `path value timestamp\n`.

use crate::row::{Point, WriteBuffer};

/// Paths must be non-empty and free of whitespace and control characters.
pub(crate) fn valid_path(path: &str) -> bool {
    !path.is_empty() && !path.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Parse one plaintext line.
pub fn parse_line(line: &str) -> Option<Point> {
    let mut fields = line.split_whitespace();
    let (path, value, timestamp) = (fields.next()?, fields.next()?, fields.next()?);
    if fields.next().is_some() || !valid_path(path) {
        return None;
    }

    let value: f64 = value.parse().ok()?;
    let timestamp: f64 = timestamp.parse().ok()?;
    if value.is_nan() || !(0.0..=f64::from(u32::MAX)).contains(&timestamp) {
        return None;
    }

    Some(Point::new(path, value, timestamp as u32))
}

/// Parse a chunk of newline-separated lines into a write buffer.
///
/// Blank lines are ignored. Returns the buffer and the number of rejected lines.
pub fn parse_chunk(chunk: &[u8], version: u32) -> (WriteBuffer, usize) {
    let mut buf = WriteBuffer::new();
    let mut invalid = 0;

    for raw in chunk.split(|b| *b == b'\n') {
        let Ok(line) = std::str::from_utf8(raw) else {
            invalid += 1;
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(point) => buf.write_point(&point, version),
            None => invalid += 1,
        }
    }

    (buf, invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowReader;

    #[test]
    fn test_parse_line_valid() {
        assert_eq!(
            parse_line("servers.web01.cpu 12.5 1500000000"),
            Some(Point::new("servers.web01.cpu", 12.5, 1_500_000_000))
        );
        // Fractional timestamps are truncated.
        assert_eq!(
            parse_line("a 1 1500000000.9").map(|p| p.time),
            Some(1_500_000_000)
        );
    }

    #[test]
    fn test_parse_line_invalid() {
        assert_eq!(parse_line("only.path"), None);
        assert_eq!(parse_line("a b 1"), None);
        assert_eq!(parse_line("a 1 notatime"), None);
        assert_eq!(parse_line("a 1 -5"), None);
        assert_eq!(parse_line("a 1 2 extra"), None);
        assert_eq!(parse_line("a nan 1"), None);
    }

    #[test]
    fn test_parse_chunk_counts_invalid() {
        let chunk = b"a.b 1 100\n\ngarbage\r\nc.d 2 200\r\n\xff\xfe 1 1\n";
        let (buf, invalid) = parse_chunk(chunk, 7);
        assert_eq!(buf.points(), 2);
        assert_eq!(invalid, 2);

        let rows: Vec<_> = RowReader::new(buf.as_bytes())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows[1].path, "c.d");
        assert_eq!(rows[1].version, 7);
    }

    #[test]
    fn test_valid_path() {
        assert!(valid_path("a.b-c_d"));
        assert!(!valid_path(""));
        assert!(!valid_path("a\tb"));
    }
}
