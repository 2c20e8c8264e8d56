//! Minimal portal page: the daemon root lists active sessions with links. The full
//! portal (toolbar, tabs, styling) is rendered by a separate front end; this seam only
//! has to be useful enough to reach a terminal from a bare browser.

use common::registry::{DaemonInfo, SessionRecord};

pub fn render(daemon: &DaemonInfo, records: &[SessionRecord], base_path: &str) -> String {
    let mut items = String::new();
    for record in records {
        let href = format!("{base_path}{}/", record.url_path);
        items.push_str(&format!(
            "<li><a href=\"{}\">{}</a> <small>port {}, {}</small></li>\n",
            escape(&href),
            escape(&record.name),
            record.port,
            escape(&record.working_dir),
        ));
    }
    if items.is_empty() {
        items.push_str("<li><em>no active sessions</em></li>\n");
    }
    format!(
        r#"<!DOCTYPE html><html><head><meta charset="utf-8"><title>ttymux</title></head>
<body><h1>ttymux</h1>
<p>daemon pid {} on port {}</p>
<ul>
{}</ul></body></html>"#,
        daemon.pid, daemon.http_port, items
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_sessions_with_full_paths() {
        let daemon = DaemonInfo {
            pid: 77,
            http_port: 7600,
            started_at: chrono::Utc::now(),
        };
        let records = vec![SessionRecord {
            name: "work".into(),
            pid: 1,
            port: 7601,
            url_path: "/work".into(),
            working_dir: "/home/dev/work".into(),
            started_at: chrono::Utc::now(),
        }];
        let html = render(&daemon, &records, "/ttymux");
        assert!(html.contains("href=\"/ttymux/work/\""));
        assert!(html.contains("daemon pid 77"));
    }

    #[test]
    fn escapes_markup_in_names() {
        let daemon = DaemonInfo {
            pid: 1,
            http_port: 7600,
            started_at: chrono::Utc::now(),
        };
        let records = vec![SessionRecord {
            name: "x".into(),
            pid: 1,
            port: 7601,
            url_path: "/x".into(),
            working_dir: "/tmp/<script>".into(),
            started_at: chrono::Utc::now(),
        }];
        let html = render(&daemon, &records, "/ttymux");
        assert!(!html.contains("/tmp/<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
