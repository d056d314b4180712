use std::path::Path;

use anyhow::Context;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 2000;

/// Order of lines within one page. Pages themselves always run newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page_size: u32,
    pub page_index: i64,
    pub order: PageOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_index: 0,
            order: PageOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LogPage {
    pub lines: Vec<String>,
    pub page_index: usize,
    pub total_pages: usize,
    pub total_lines: usize,
}

impl LogPage {
    pub fn empty() -> Self {
        Self {
            lines: Vec::new(),
            page_index: 0,
            total_pages: 0,
            total_lines: 0,
        }
    }
}

fn clamp_page_size(v: u32) -> usize {
    if v == 0 {
        return DEFAULT_PAGE_SIZE as usize;
    }
    v.min(MAX_PAGE_SIZE) as usize
}

/// Splits `text` into lines, newest first, and returns the requested chunk.
/// Out-of-range indexes snap to the first or last page.
pub fn paginate(text: &str, req: PageRequest) -> LogPage {
    let size = clamp_page_size(req.page_size);
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return LogPage::empty();
    }
    lines.reverse();

    let total_lines = lines.len();
    let total_pages = total_lines.div_ceil(size);
    let page_index = if req.page_index <= 0 {
        0
    } else {
        usize::try_from(req.page_index)
            .unwrap_or(usize::MAX)
            .min(total_pages - 1)
    };

    let start = page_index * size;
    let end = (start + size).min(total_lines);
    let mut page: Vec<String> = lines[start..end].iter().map(|l| l.to_string()).collect();
    if req.order == PageOrder::Asc {
        page.reverse();
    }

    LogPage {
        lines: page,
        page_index,
        total_pages,
        total_lines,
    }
}

/// Reads the whole log file; a missing file is an empty page.
pub async fn read_page(path: &Path, req: PageRequest) -> anyhow::Result<LogPage> {
    let buf = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogPage::empty()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    // Best-effort UTF-8: invalid sequences become replacement characters.
    let text = String::from_utf8_lossy(&buf);
    Ok(paginate(&text, req))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}\n")).collect()
    }

    fn req(page_size: u32, page_index: i64, order: PageOrder) -> PageRequest {
        PageRequest {
            page_size,
            page_index,
            order,
        }
    }

    #[test]
    fn pages_run_newest_first() {
        let text = log_of(250);
        let p = paginate(&text, req(100, 0, PageOrder::Desc));
        assert_eq!(p.total_pages, 3);
        assert_eq!(p.total_lines, 250);
        assert_eq!(p.lines.len(), 100);
        assert_eq!(p.lines.first().unwrap(), "line 250");
        assert_eq!(p.lines.last().unwrap(), "line 151");
    }

    #[test]
    fn index_past_end_snaps_to_last_page() {
        let text = log_of(250);
        let p = paginate(&text, req(100, 10, PageOrder::Desc));
        assert_eq!(p.page_index, 2);
        assert_eq!(p.lines.len(), 50);
        assert_eq!(p.lines.first().unwrap(), "line 50");
        assert_eq!(p.lines.last().unwrap(), "line 1");

        let p = paginate(&text, req(100, -3, PageOrder::Desc));
        assert_eq!(p.page_index, 0);
    }

    #[test]
    fn asc_only_flips_within_page() {
        let text = log_of(250);
        let p = paginate(&text, req(100, 0, PageOrder::Asc));
        assert_eq!(p.lines.first().unwrap(), "line 151");
        assert_eq!(p.lines.last().unwrap(), "line 250");
    }

    #[test]
    fn page_size_defaults_and_clamps() {
        let text = log_of(5000);
        assert_eq!(paginate(&text, req(0, 0, PageOrder::Desc)).lines.len(), 100);
        let p = paginate(&text, req(u32::MAX, 0, PageOrder::Desc));
        assert_eq!(p.lines.len(), 2000);
        assert_eq!(p.total_pages, 3);
    }

    #[test]
    fn crlf_and_missing_trailing_newline() {
        let p = paginate("a\r\nb\r\nc", PageRequest::default());
        assert_eq!(p.lines, vec!["c", "b", "a"]);
        assert_eq!(paginate("", PageRequest::default()), LogPage::empty());
    }

    #[tokio::test]
    async fn missing_file_is_empty_page() {
        let tmp = tempfile::tempdir().unwrap();
        let p = read_page(&tmp.path().join("server.log"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(p, LogPage::empty());

        std::fs::write(tmp.path().join("server.log"), log_of(3)).unwrap();
        let p = read_page(&tmp.path().join("server.log"), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(p.lines, vec!["line 3", "line 2", "line 1"]);
    }
}
