//! askama templates and atomic report output.

use std::path::Path;

use askama::Template;
use tracing::info;

use super::{cherry, date_line, to_json, Cherry, ReportError, ReportKind};
use crate::config::DateString;
use crate::engine::RunSnapshot;
use crate::fsio::write_atomic;

/// One table row, with numbers already formatted.
struct Row {
    endpoint: String,
    total: u32,
    bb_errors: bool,
    successful: String,
    failed: String,
    running: String,
    queued: String,
    new: String,
    waiting: String,
    timeout: String,
}

impl Row {
    fn new(cell: &Cherry) -> Self {
        let fmt = |v: f64| format!("{v:.1}");
        Self {
            endpoint: cell.endpoint.clone(),
            total: cell.total,
            bb_errors: cell.bb_errors,
            successful: fmt(cell.successful),
            failed: fmt(cell.failed),
            running: fmt(cell.running),
            queued: fmt(cell.queued),
            new: fmt(cell.new),
            waiting: fmt(cell.waiting),
            timeout: fmt(cell.timeout),
        }
    }
}

struct ServerSection {
    name: String,
    url: String,
    rows: Vec<Row>,
}

fn sections(snapshot: &RunSnapshot) -> Vec<ServerSection> {
    let mut sections: Vec<ServerSection> = Vec::new();
    for cell in cherry(snapshot) {
        let row = Row::new(&cell);
        match sections.iter_mut().find(|s| s.name == cell.server) {
            Some(section) => section.rows.push(row),
            None => sections.push(ServerSection {
                url: snapshot.urls.get(&cell.server).cloned().unwrap_or_default(),
                name: cell.server,
                rows: vec![row],
            }),
        }
    }
    sections
}

#[derive(Template)]
#[template(path = "summary.html")]
struct SummaryTemplate<'a> {
    standalone: bool,
    started: &'a str,
    label: &'a str,
    run_id: String,
    sections: &'a [ServerSection],
}

#[derive(Template)]
#[template(path = "report.html")]
struct PageTemplate<'a> {
    started: &'a str,
    summary: &'a str,
    json: &'a str,
}

#[derive(Template)]
#[template(path = "report.md")]
struct MarkdownTemplate<'a> {
    started: &'a str,
    label: &'a str,
    run_id: String,
    sections: &'a [ServerSection],
    json: &'a str,
}

fn summary_html(
    snapshot: &RunSnapshot,
    date_string: Option<&DateString>,
    standalone: bool,
) -> Result<String, ReportError> {
    let (started, label) = date_line(snapshot, date_string);
    let sections = sections(snapshot);
    let template = SummaryTemplate {
        standalone,
        started: &started,
        label: label.as_deref().unwrap_or_default(),
        run_id: snapshot.run_id.to_string(),
        sections: &sections,
    };
    Ok(template.render()?)
}

/// Standalone HTML summary table.
pub fn render_summary(snapshot: &RunSnapshot, date_string: Option<&DateString>) -> Result<String, ReportError> {
    summary_html(snapshot, date_string, true)
}

/// Full HTML page embedding the summary table and the raw snapshot.
pub fn render_page(snapshot: &RunSnapshot, date_string: Option<&DateString>) -> Result<String, ReportError> {
    let summary = summary_html(snapshot, date_string, false)?;
    let json = to_json(snapshot)?;
    let (started, _) = date_line(snapshot, date_string);
    let template = PageTemplate {
        started: &started,
        summary: &summary,
        json: &json,
    };
    Ok(template.render()?)
}

pub fn render_markdown(snapshot: &RunSnapshot, date_string: Option<&DateString>) -> Result<String, ReportError> {
    let (started, label) = date_line(snapshot, date_string);
    let sections = sections(snapshot);
    let json = to_json(snapshot)?;
    let template = MarkdownTemplate {
        started: &started,
        label: label.as_deref().unwrap_or_default(),
        run_id: snapshot.run_id.to_string(),
        sections: &sections,
        json: &json,
    };
    Ok(template.render()?)
}

/// Render `kind` and write it atomically to `path`.
pub fn write_report(
    kind: ReportKind,
    path: &Path,
    snapshot: &RunSnapshot,
    date_string: Option<&DateString>,
) -> Result<(), ReportError> {
    kind.validate_path(path)?;
    let content = match kind {
        ReportKind::Page => render_page(snapshot, date_string)?,
        ReportKind::Summary => render_summary(snapshot, date_string)?,
        ReportKind::Markdown => render_markdown(snapshot, date_string)?,
    };
    write_atomic(path, content.as_bytes(), None).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "report generated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Aggregator, Outcome};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn sample() -> RunSnapshot {
        let mut agg = Aggregator::new(Utc::now());
        agg.record("Main", "Default", Outcome::Successful);
        agg.record("Main", "cluster-<A>", Outcome::ConnectionError);
        agg.finish(BTreeMap::from([(
            "Main".to_string(),
            "https://usegalaxy.example".to_string(),
        )]))
    }

    #[test]
    fn test_summary_marks_hard_errors() {
        let html = render_summary(&sample(), None).unwrap();
        assert!(html.contains("<html"));
        assert!(html.contains("https://usegalaxy.example"));
        assert!(html.contains("100.0"));
        assert!(html.contains("connection error"));
        // endpoint names are escaped
        assert!(html.contains("cluster-&lt;A&gt;"));
    }

    #[test]
    fn test_page_embeds_summary_and_json() {
        let html = render_page(&sample(), Some(&DateString::Text("nightly".to_string()))).unwrap();
        assert!(html.contains("<table"));
        assert!(html.contains("nightly"));
        assert!(html.contains("has_connection_error"));
    }

    #[test]
    fn test_markdown_table() {
        let md = render_markdown(&sample(), None).unwrap();
        assert!(md.contains("## Main"));
        assert!(md.contains("| Default | 1 |"));
        assert!(md.contains("cluster-<A>"));
    }

    #[test]
    fn test_write_report_atomic() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.md");
        write_report(ReportKind::Markdown, &path, &sample(), None).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Main"));

        let wrong = dir.path().join("out.txt");
        assert!(matches!(
            write_report(ReportKind::Markdown, &wrong, &sample(), None),
            Err(ReportError::InvalidPath { .. })
        ));
    }
}
