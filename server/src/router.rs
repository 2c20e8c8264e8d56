//! Request routing: derive the dispatch decision from the registry and base path on
//! every request. Nothing here is cached; mutation visibility comes straight from the
//! registry being the single source of truth.

use common::registry::SessionRecord;

/// Where an inbound request goes. First structurally matching record wins, iterating
/// registry order; overlapping prefixes are not re-ranked by specificity.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    Api,
    Portal,
    Session(SessionRecord),
    NotFound,
}

/// Classify `request_path` against `base_path` and the live session records.
pub fn resolve(records: &[SessionRecord], base_path: &str, request_path: &str) -> RouteDecision {
    let api_prefix = format!("{base_path}/api");
    if request_path == api_prefix || request_path.starts_with(&format!("{api_prefix}/")) {
        return RouteDecision::Api;
    }
    if request_path == base_path || request_path == format!("{base_path}/") {
        return RouteDecision::Portal;
    }
    for record in records {
        let full = format!("{base_path}{}", record.url_path);
        if request_path == full || request_path.starts_with(&format!("{full}/")) {
            return RouteDecision::Session(record.clone());
        }
    }
    RouteDecision::NotFound
}
