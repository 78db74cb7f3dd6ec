// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

/// Formats a duration as the `mm:ss` field used by timestamps and rusage
/// summaries: minutes padded to two columns with spaces, seconds with
/// zeros.
pub(crate) fn format_mm_ss(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:2}:{:02}", secs / 60, secs % 60)
}

/// Pads `text` with dots out to `column`, for batch result lines.
pub(crate) fn dot_pad(text: &str, column: usize) -> String {
    let mut out = String::with_capacity(column.max(text.len()) + 1);
    out.push_str(text);
    while out.len() < column {
        out.push('.');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mm_ss_format() {
        assert_eq!(format_mm_ss(Duration::from_secs(0)), " 0:00");
        assert_eq!(format_mm_ss(Duration::from_secs(59)), " 0:59");
        assert_eq!(format_mm_ss(Duration::from_secs(61)), " 1:01");
        assert_eq!(format_mm_ss(Duration::from_secs(3600)), "60:00");
    }

    #[test]
    fn dot_padding() {
        assert_eq!(dot_pad("abc", 6), "abc...");
        assert_eq!(dot_pad("abcdef", 6), "abcdef");
        assert_eq!(dot_pad("abcdefg", 6), "abcdefg");
    }
}
