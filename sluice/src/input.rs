//! Bulk download input parsing.

use crate::error::{Error, Result};

/// Separator between URL and file name in bulk input lines. The spaces are
/// part of the token; URLs may legally contain runs of dashes.
const LINE_SEPARATOR: &str = " ---- ";

/// One parsed bulk input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub url: String,
    pub file_name: String,
}

/// Parse bulk download input, one `<url> ---- <file name>` pair per line.
///
/// Blank lines are skipped. A line without the separator, or with an empty
/// side, fails the whole parse and the error names the offending line.
pub fn parse_batch_input(text: &str) -> Result<Vec<BatchItem>> {
    let mut items = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((url, file_name)) = line.split_once(LINE_SEPARATOR) else {
            return Err(Error::InvalidBatchLine(line.to_string()));
        };
        let url = url.trim();
        let file_name = file_name.trim();
        if url.is_empty() || file_name.is_empty() {
            return Err(Error::InvalidBatchLine(line.to_string()));
        }
        items.push(BatchItem {
            url: url.to_string(),
            file_name: file_name.to_string(),
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_url_name_pairs() {
        let text = "https://a.example/one.m3u8 ---- one.mp4\n\
                    https://a.example/two.m3u8 ---- two.mp4\n";
        let items = parse_batch_input(text).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "https://a.example/one.m3u8");
        assert_eq!(items[0].file_name, "one.mp4");
        assert_eq!(items[1].file_name, "two.mp4");
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let text = "\nhttps://a.example/one.m3u8 ---- one.mp4\n\n   \n";
        let items = parse_batch_input(text).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let items = parse_batch_input("  https://a.example/v.m3u8   ----   v.mp4  ").unwrap();
        assert_eq!(items[0].url, "https://a.example/v.m3u8");
        assert_eq!(items[0].file_name, "v.mp4");
    }

    #[test]
    fn test_missing_separator_names_the_line() {
        let err = parse_batch_input("https://a.example/one.m3u8 one.mp4").unwrap_err();
        match err {
            Error::InvalidBatchLine(line) => {
                assert_eq!(line, "https://a.example/one.m3u8 one.mp4");
            }
            other => panic!("expected InvalidBatchLine, got {other}"),
        }
    }

    #[test]
    fn test_empty_side_is_rejected() {
        assert!(parse_batch_input("https://a.example/one.m3u8 ---- ").is_err());
        assert!(parse_batch_input(" ---- one.mp4").is_err());
    }

    #[test]
    fn test_dashes_inside_the_url_are_not_a_separator() {
        let items =
            parse_batch_input("https://cdn.example.com/a----b/index.m3u8 ---- out.mp4").unwrap();
        assert_eq!(items[0].url, "https://cdn.example.com/a----b/index.m3u8");
        assert_eq!(items[0].file_name, "out.mp4");
    }

    #[test]
    fn test_separator_requires_surrounding_spaces() {
        let err = parse_batch_input("https://a.example/v.m3u8----v.mp4").unwrap_err();
        match err {
            Error::InvalidBatchLine(line) => {
                assert_eq!(line, "https://a.example/v.m3u8----v.mp4");
            }
            other => panic!("expected InvalidBatchLine, got {other}"),
        }
    }
}
