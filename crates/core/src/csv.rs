//! Single-column CSV handling for user id uploads.
//!
//! Uploads are split by byte range, not by line. A line belongs to the part
//! in which its first byte lies, so a reader for `[start, end)` fetches one
//! byte before `start` (to know whether `start` begins a line) and up to
//! [`MAX_LINE_LEN`] bytes past `end` (to finish its last line).

use crate::error::{DomainError, DomainResult};
use crate::user::is_user_id_valid;

/// Header of user id uploads.
pub const USER_IDS_HEADER: &str = "userIds";

/// Header of control-group exports.
pub const CONTROL_GROUP_HEADER: &str = "controlGroupUserIds";

/// Upper bound on the length of one line, in bytes.
pub const MAX_LINE_LEN: u64 = 1024;

/// One byte range of a CSV object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part: u64,
    pub start: u64,
    pub size: u64,
}

impl PartRange {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Byte window to fetch so every line starting in this part is complete.
    pub fn read_window(&self, total_size: u64) -> (u64, u64) {
        let from = self.start.saturating_sub(1);
        let to = (self.end() + MAX_LINE_LEN).min(total_size);
        (from, to)
    }
}

/// Fail unless `head` starts with the user id header.
pub fn check_header(head: &[u8]) -> DomainResult<()> {
    if head.starts_with(USER_IDS_HEADER.as_bytes()) {
        Ok(())
    } else {
        Err(DomainError::malformed_csv(format!(
            "expected header '{USER_IDS_HEADER}', found '{}'",
            String::from_utf8_lossy(&head[..head.len().min(USER_IDS_HEADER.len())])
        )))
    }
}

/// Partition `total_size` bytes into consecutive parts of `part_size`.
pub fn plan_parts(total_size: u64, part_size: u64) -> Vec<PartRange> {
    if total_size == 0 || part_size == 0 {
        return Vec::new();
    }
    let total_parts = total_size.div_ceil(part_size);
    (0..total_parts)
        .map(|part| {
            let start = part * part_size;
            PartRange {
                part,
                start,
                size: part_size.min(total_size - start),
            }
        })
        .collect()
}

fn is_break(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

fn first_cell(line: &str) -> &str {
    line.split(',').next().unwrap_or_default().trim().trim_matches('"')
}

/// Valid user ids of every line that starts inside `[start, end)`.
///
/// `chunk` holds the object bytes beginning at absolute offset
/// `chunk_offset`. The header line and invalid ids are skipped.
pub fn ids_in_range(chunk: &[u8], chunk_offset: u64, start: u64, end: u64) -> Vec<String> {
    let mut ids = Vec::new();
    let mut pos = 0usize;
    while pos < chunk.len() {
        let abs = chunk_offset + pos as u64;
        if abs >= end {
            break;
        }
        let line_start = abs == 0 || (pos > 0 && is_break(chunk[pos - 1]));
        if !line_start || is_break(chunk[pos]) {
            pos += 1;
            continue;
        }
        let len = chunk[pos..]
            .iter()
            .position(|b| is_break(*b))
            .unwrap_or(chunk.len() - pos);
        if abs >= start {
            let line = String::from_utf8_lossy(&chunk[pos..pos + len]);
            let id = first_cell(&line);
            if id != USER_IDS_HEADER && is_user_id_valid(id) {
                ids.push(id.to_string());
            }
        }
        pos += len;
    }
    ids
}

/// Render a one-column CSV, with an optional header line.
pub fn render_column<'a>(header: Option<&str>, values: impl IntoIterator<Item = &'a str>) -> Vec<u8> {
    let mut out = String::new();
    if let Some(header) = header {
        out.push_str(header);
        out.push('\n');
    }
    for value in values {
        out.push_str(value);
        out.push('\n');
    }
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"userIds\nalpha\nbeta\r\ngamma\ndelta\n".to_vec()
    }

    fn collect(data: &[u8], part_size: u64) -> Vec<String> {
        let total = data.len() as u64;
        plan_parts(total, part_size)
            .into_iter()
            .flat_map(|p| {
                let (from, to) = p.read_window(total);
                ids_in_range(&data[from as usize..to as usize], from, p.start, p.end())
            })
            .collect()
    }

    #[test]
    fn header_check() {
        assert!(check_header(b"userIds\n").is_ok());
        assert!(matches!(check_header(b"user_id\n"), Err(DomainError::MalformedCsv(_))));
        assert!(check_header(b"").is_err());
    }

    #[test]
    fn plan_covers_object_exactly() {
        let parts = plan_parts(25, 10);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2], PartRange { part: 2, start: 20, size: 5 });
        assert_eq!(parts.iter().map(|p| p.size).sum::<u64>(), 25);
        assert!(plan_parts(0, 10).is_empty());
    }

    #[test]
    fn whole_object_in_one_part() {
        assert_eq!(collect(&sample(), 1 << 20), vec!["alpha", "beta", "gamma", "delta"]);
    }

    #[test]
    fn every_line_lands_in_exactly_one_part() {
        let data = sample();
        for part_size in 1..=data.len() as u64 {
            assert_eq!(
                collect(&data, part_size),
                vec!["alpha", "beta", "gamma", "delta"],
                "part size {part_size}"
            );
        }
    }

    #[test]
    fn invalid_ids_are_skipped() {
        let data = b"userIds\nok\nbad'id\n\"quoted\"\n";
        assert_eq!(ids_in_range(data, 0, 0, data.len() as u64), vec!["ok", "quoted"]);
    }

    #[test]
    fn render_with_header() {
        let bytes = render_column(Some(CONTROL_GROUP_HEADER), ["a", "b"]);
        assert_eq!(bytes, b"controlGroupUserIds\na\nb\n");
        assert_eq!(render_column(None, ["a"]), b"a\n");
    }
}
