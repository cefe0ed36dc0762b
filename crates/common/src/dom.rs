//! DOM and page-state heuristics
//!
//! Operates on raw snapshot HTML with bounded regex searches rather than a
//! parsed DOM tree. This keeps the matching semantics of the recorded
//! snapshots exactly as captured (including false negatives on malformed
//! HTML) and means visibility decisions see inline styles and class/attribute
//! text only; an overlay hidden purely by an external stylesheet rule will
//! not be detected.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::trace::{DomSnapshot, TraceData};

// ============================================================================
// Snapshot selection
// ============================================================================

/// Pick the DOM snapshot nearest to (and not after) `at_ms`.
///
/// Falls back to the most recent snapshot overall when none qualifies,
/// since stale-but-present beats nothing. `None` only when the trace has no
/// HTML-bearing snapshots at all.
pub fn nearest_snapshot(trace: &TraceData, at_ms: f64) -> Option<&DomSnapshot> {
    let with_html = || trace.snapshots.iter().filter(|s| !s.html.is_empty());

    with_html()
        .filter(|s| s.timestamp <= at_ms)
        .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
        .or_else(|| with_html().max_by(|a, b| a.timestamp.total_cmp(&b.timestamp)))
}

// ============================================================================
// Element lookup
// ============================================================================

/// A heuristically located element: its opening tag text and nearby content
#[derive(Debug, Clone)]
pub struct MatchedElement {
    pub tag: String,
    /// The full opening-tag substring, `<` through `>`
    pub opening_tag: String,
    /// Text content immediately following the opening tag, bounded
    pub inner_text: String,
}

/// Longest opening-tag / inner-text excerpt considered when locating elements
const TAG_SCAN_LIMIT: usize = 512;
const TEXT_SCAN_LIMIT: usize = 256;

static BARE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9-]*$").unwrap());
static ATTR_SELECTOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\[\s*([a-zA-Z_][\w-]*)\s*(?:[*^$~|]?=\s*["']?([^"'\]]+?)["']?)?\s*\]"#).unwrap()
});

/// Locate an element in raw HTML by selector-family matching: id, class,
/// attribute, tag, then literal-text containment, in that priority order.
/// Each family uses a bounded text search, not a full parse.
pub fn find_element(html: &str, selector: &str) -> Option<MatchedElement> {
    let selector = selector.trim();
    if selector.is_empty() || html.is_empty() {
        return None;
    }

    let pos = locate(html, selector)?;
    Some(element_at(html, pos))
}

fn locate(html: &str, selector: &str) -> Option<usize> {
    if let Some(rest) = selector.strip_prefix('#') {
        let id: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        return find_attr_value(html, "id", &id);
    }
    if let Some(rest) = selector.strip_prefix('.') {
        let class: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        return find_class_token(html, &class);
    }
    if let Some(caps) = ATTR_SELECTOR.captures(selector) {
        let attr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        return match caps.get(2) {
            Some(value) => find_attr_value(html, attr, value.as_str()),
            None => find_bare_attr(html, attr),
        };
    }
    if BARE_TAG.is_match(selector) {
        return find_tag(html, selector);
    }
    // Literal-text containment, last resort
    html.find(selector)
}

fn find_attr_value(html: &str, attr: &str, value: &str) -> Option<usize> {
    if value.is_empty() {
        return None;
    }
    for quote in ['"', '\''] {
        let needle = format!("{}={}{}{}", attr, quote, value, quote);
        if let Some(pos) = html.find(&needle) {
            return Some(pos);
        }
    }
    None
}

fn find_bare_attr(html: &str, attr: &str) -> Option<usize> {
    let re = Regex::new(&format!(r"\s{}[\s>=]", regex::escape(attr))).ok()?;
    re.find(html).map(|m| m.start())
}

fn find_class_token(html: &str, class: &str) -> Option<usize> {
    if class.is_empty() {
        return None;
    }
    let re = Regex::new(&format!(
        r#"class\s*=\s*["'][^"']*\b{}\b[^"']*["']"#,
        regex::escape(class)
    ))
    .ok()?;
    re.find(html).map(|m| m.start())
}

fn find_tag(html: &str, tag: &str) -> Option<usize> {
    let re = Regex::new(&format!(r"(?i)<{}[\s>/]", regex::escape(tag))).ok()?;
    re.find(html).map(|m| m.start())
}

/// Extract the element surrounding a byte position: scan back to the nearest
/// `<`, forward to the closing `>`, then capture bounded inner text.
fn element_at(html: &str, pos: usize) -> MatchedElement {
    let mut scan_start = pos.saturating_sub(TAG_SCAN_LIMIT);
    while !html.is_char_boundary(scan_start) {
        scan_start -= 1;
    }
    let open = if html[pos..].starts_with('<') {
        pos
    } else {
        html[scan_start..pos]
            .rfind('<')
            .map(|i| scan_start + i)
            .unwrap_or(pos)
    };

    let close = html[open..]
        .char_indices()
        .take(TAG_SCAN_LIMIT)
        .find(|(_, c)| *c == '>')
        .map(|(i, _)| open + i)
        .unwrap_or(open);

    let opening_tag = html[open..=close.min(html.len() - 1)].to_string();
    let tag = opening_tag
        .trim_start_matches('<')
        .trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_lowercase();

    let after = &html[(close + 1).min(html.len())..];
    let inner_text = after
        .chars()
        .take(TEXT_SCAN_LIMIT)
        .take_while(|c| *c != '<')
        .collect::<String>()
        .trim()
        .to_string();

    MatchedElement {
        tag,
        opening_tag,
        inner_text,
    }
}

// ============================================================================
// Visibility
// ============================================================================

/// Existence/visibility verdict for one element lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementVisibility {
    pub exists: bool,
    pub visible: bool,
    pub reason: String,
}

static STYLE_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"style\s*=\s*["']([^"']*)["']"#).unwrap());
static CLASS_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"class\s*=\s*["']([^"']*)["']"#).unwrap());

/// Tags that never render content
const NON_RENDERED_TAGS: &[&str] = &["script", "style", "noscript"];

/// Test element existence and visibility in raw snapshot HTML.
pub fn element_visibility(html: &str, selector: &str) -> ElementVisibility {
    let element = match find_element(html, selector) {
        Some(e) => e,
        None => {
            return ElementVisibility {
                exists: false,
                visible: false,
                reason: "element not found in DOM snapshot".to_string(),
            }
        }
    };

    if NON_RENDERED_TAGS.contains(&element.tag.as_str()) {
        return ElementVisibility {
            exists: true,
            visible: false,
            reason: format!("matched a non-rendered <{}> tag", element.tag),
        };
    }

    if let Some(style_reason) = hidden_by_style(&element.opening_tag) {
        return ElementVisibility {
            exists: true,
            visible: false,
            reason: style_reason,
        };
    }

    if hidden_by_class_or_attr(&element.opening_tag) {
        return ElementVisibility {
            exists: true,
            visible: false,
            reason: "hidden class or attribute present".to_string(),
        };
    }

    ElementVisibility {
        exists: true,
        visible: true,
        reason: "element present and not marked hidden".to_string(),
    }
}

fn hidden_by_style(opening_tag: &str) -> Option<String> {
    let style = STYLE_ATTR.captures(opening_tag)?.get(1)?.as_str();
    let compact: String = style
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    for marker in ["display:none", "visibility:hidden", "opacity:0"] {
        // opacity:0 must not also match opacity:0.9
        if compact.contains(marker)
            && !(marker == "opacity:0" && compact.contains("opacity:0."))
        {
            return Some(format!("hidden via inline style ({})", marker));
        }
    }
    None
}

fn hidden_by_class_or_attr(opening_tag: &str) -> bool {
    if let Some(class) = CLASS_ATTR
        .captures(opening_tag)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
    {
        if class.split_whitespace().any(|t| t.eq_ignore_ascii_case("hidden")) {
            return true;
        }
    }
    let lower = opening_tag.to_lowercase();
    lower.contains(" hidden ")
        || lower.contains(" hidden>")
        || lower.contains(" hidden=")
        || lower.contains(r#"aria-hidden="true""#)
        || lower.contains("aria-hidden='true'")
}

// ============================================================================
// Blocking elements
// ============================================================================

/// Kinds of UI elements that can obstruct a test interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingCategory {
    Modal,
    CookieConsent,
    Spinner,
    ErrorAlert,
    AuthGate,
    Banner,
}

impl BlockingCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingCategory::Modal => "modal",
            BlockingCategory::CookieConsent => "cookie consent",
            BlockingCategory::Spinner => "loading spinner",
            BlockingCategory::ErrorAlert => "error alert",
            BlockingCategory::AuthGate => "auth gate",
            BlockingCategory::Banner => "banner",
        }
    }

    /// Spinners and error alerts are reported regardless of positioning
    fn always_reported(&self) -> bool {
        matches!(self, BlockingCategory::Spinner | BlockingCategory::ErrorAlert)
    }
}

/// A detected obstructing element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingElement {
    pub category: BlockingCategory,
    pub description: String,
}

/// Signature catalogue: tokens looked up in class/id/role/aria text
const BLOCKING_SIGNATURES: &[(BlockingCategory, &[&str])] = &[
    (BlockingCategory::Modal, &["modal", "dialog", "aria-modal"]),
    (BlockingCategory::CookieConsent, &["cookie", "consent", "gdpr"]),
    (BlockingCategory::Spinner, &["spinner", "loading", "loader", "aria-busy"]),
    (BlockingCategory::ErrorAlert, &["error", "alert"]),
    (BlockingCategory::AuthGate, &["login", "signin", "sign-in", "auth"]),
    (BlockingCategory::Banner, &["banner", "overlay", "popup", "toast"]),
];

static OPENING_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<([a-zA-Z][a-zA-Z0-9-]*)((?:[^<>"']|"[^"]*"|'[^']*')*)>"#).unwrap()
});
static Z_INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"z-index\s*:\s*(\d+)").unwrap());

/// Prefix length used when collapsing near-identical findings
const DEDUP_PREFIX: usize = 40;

/// Scan snapshot HTML for the fixed catalogue of obstruction signatures.
pub fn blocking_elements(html: &str) -> Vec<BlockingElement> {
    let mut found = Vec::new();
    let mut seen: HashSet<(BlockingCategory, String)> = HashSet::new();

    for caps in OPENING_TAG.captures_iter(html) {
        let opening = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let attrs = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

        let haystack = signature_text(attrs);
        if haystack.is_empty() {
            continue;
        }

        for (category, tokens) in BLOCKING_SIGNATURES {
            if !tokens.iter().any(|t| haystack.contains(t)) {
                continue;
            }
            if hidden_by_style(opening).is_some() || hidden_by_class_or_attr(opening) {
                continue;
            }
            if !(category.always_reported() || elevated_or_overlaid(opening)) {
                continue;
            }

            let description = format!("{} element {}", category.as_str(), excerpt(opening, tag));
            let key = (
                *category,
                description.chars().take(DEDUP_PREFIX).collect::<String>(),
            );
            if seen.insert(key) {
                found.push(BlockingElement {
                    category: *category,
                    description,
                });
            }
        }
    }

    found
}

/// Only class/id/role/aria-* attribute text participates in signature matching
fn signature_text(attrs: &str) -> String {
    static SIG_ATTRS: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"(?:class|id|role|aria-[\w-]+)\s*=\s*["']([^"']*)["']"#).unwrap()
    });
    let mut out = String::new();
    for caps in SIG_ATTRS.captures_iter(attrs) {
        if let Some(m) = caps.get(0) {
            out.push_str(&m.as_str().to_lowercase());
            out.push(' ');
        }
    }
    out
}

fn elevated_or_overlaid(opening_tag: &str) -> bool {
    let style = STYLE_ATTR
        .captures(opening_tag)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();

    if let Some(caps) = Z_INDEX.captures(&style) {
        if let Ok(z) = caps[1].parse::<i64>() {
            if z >= 100 {
                return true;
            }
        }
    }
    style.contains("position:fixed")
        || style.contains("position: fixed")
        || style.contains("position:absolute")
        || style.contains("position: absolute")
}

fn excerpt(opening_tag: &str, tag: &str) -> String {
    if opening_tag.chars().count() <= 80 {
        opening_tag.to_string()
    } else {
        format!("<{} ...>", tag)
    }
}

// ============================================================================
// Page load state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageState {
    Loaded,
    Loading,
    Failed,
    Timeout,
    Unknown,
}

impl PageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageState::Loaded => "loaded",
            PageState::Loading => "loading",
            PageState::Failed => "failed",
            PageState::Timeout => "timeout",
            PageState::Unknown => "unknown",
        }
    }
}

/// Page-load assessment derived from recorded network and lifecycle activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageLoadState {
    pub state: PageState,
    pub load_time_ms: Option<f64>,
    pub dom_content_loaded_ms: Option<f64>,
    pub network_errors: Vec<String>,
    pub failed_requests: Vec<String>,
}

/// Network activity within this window of the trace end counts as "recent"
const RECENT_ACTIVITY_MS: f64 = 3000.0;

/// Derive page-load state from the decoded trace.
pub fn page_load_state(trace: &TraceData) -> PageLoadState {
    let network_errors: Vec<String> = trace
        .network
        .iter()
        .filter_map(|n| {
            n.failure
                .as_ref()
                .map(|f| format!("{} {}: {}", n.method, n.url, f))
        })
        .collect();

    let failed_requests: Vec<String> = trace
        .network
        .iter()
        .filter(|n| n.failed())
        .map(|n| n.url.clone())
        .collect();

    let main_document_failed = trace
        .network
        .iter()
        .any(|n| n.is_main_document() && n.failed());

    let load_time_ms = lifecycle_time(trace, "load");
    let dom_content_loaded_ms = lifecycle_time(trace, "domcontentloaded");

    let end = trace
        .meta
        .as_ref()
        .map(|m| m.end_time)
        .or_else(|| {
            trace
                .network
                .iter()
                .map(|n| n.timestamp)
                .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))))
        })
        .unwrap_or(0.0);
    let recent_activity = trace
        .network
        .iter()
        .any(|n| n.timestamp >= end - RECENT_ACTIVITY_MS);

    let mut state = if main_document_failed {
        PageState::Failed
    } else if load_time_ms.is_some() || dom_content_loaded_ms.is_some() {
        PageState::Loaded
    } else if recent_activity {
        PageState::Loading
    } else {
        PageState::Unknown
    };

    // A timeout-flavored action error overrides an inconclusive state, but
    // a confirmed loaded/failed signal stands.
    let timed_out = trace.actions.iter().any(|a| {
        a.error
            .as_ref()
            .map(|e| e.to_lowercase().contains("timeout") || e.to_lowercase().contains("timed out"))
            .unwrap_or(false)
    });
    if timed_out && matches!(state, PageState::Loading | PageState::Unknown) {
        state = PageState::Timeout;
    }

    PageLoadState {
        state,
        load_time_ms,
        dom_content_loaded_ms,
        network_errors,
        failed_requests,
    }
}

fn lifecycle_time(trace: &TraceData, event: &str) -> Option<f64> {
    trace
        .actions
        .iter()
        .find(|a| {
            let name = a.name.to_lowercase();
            name == event || name.ends_with(&format!(".{}", event))
        })
        .map(|a| if a.end_ms > 0.0 { a.end_ms } else { a.start_ms })
}

// ============================================================================
// Navigation and redirects
// ============================================================================

/// A recorded navigation-flavored action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationEvent {
    pub kind: String,
    pub url: Option<String>,
    pub timestamp: f64,
}

/// Window after a click in which a main-document request marks it navigating
const NAVIGATING_CLICK_MS: f64 = 1000.0;

/// Extract goto/reload/back/forward and navigating-click events.
pub fn navigation_events(trace: &TraceData) -> Vec<NavigationEvent> {
    let mut events = Vec::new();

    for action in &trace.actions {
        let name = action.name.to_lowercase();
        let kind = if name.contains("goto") {
            Some("goto")
        } else if name.contains("reload") {
            Some("reload")
        } else if name.contains("goback") {
            Some("back")
        } else if name.contains("goforward") {
            Some("forward")
        } else if name.contains("click") {
            let navigated = trace.network.iter().any(|n| {
                n.is_main_document()
                    && n.timestamp >= action.start_ms
                    && n.timestamp <= action.end_ms + NAVIGATING_CLICK_MS
            });
            navigated.then_some("navigating-click")
        } else {
            None
        };

        if let Some(kind) = kind {
            events.push(NavigationEvent {
                kind: kind.to_string(),
                url: action.url.clone(),
                timestamp: action.start_ms,
            });
        }
    }

    events
}

/// A redirect observed in network traffic or snapshot HTML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub from: String,
    pub to: String,
}

static META_REFRESH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]*http-equiv\s*=\s*["']?refresh["']?[^>]*url\s*=\s*([^"'>\s]+)"#)
        .unwrap()
});
static WINDOW_LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"window\.location(?:\.href)?\s*=\s*["']([^"']+)["']"#).unwrap()
});

/// Extract redirects: HTTP 3xx + Location pairs, plus meta-refresh and
/// `window.location =` patterns in snapshot HTML. Deduplicated by (from, to).
pub fn redirects(trace: &TraceData) -> Vec<Redirect> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let mut push = |from: String, to: String, seen: &mut HashSet<(String, String)>,
                    out: &mut Vec<Redirect>| {
        if seen.insert((from.clone(), to.clone())) {
            out.push(Redirect { from, to });
        }
    };

    for n in &trace.network {
        if let (Some(status), Some(location)) = (n.status, n.location.as_ref()) {
            if (300..400).contains(&status) {
                push(n.url.clone(), location.clone(), &mut seen, &mut out);
            }
        }
    }

    for snapshot in &trace.snapshots {
        for caps in META_REFRESH.captures_iter(&snapshot.html) {
            push(
                snapshot.url.clone(),
                caps[1].to_string(),
                &mut seen,
                &mut out,
            );
        }
        for caps in WINDOW_LOCATION.captures_iter(&snapshot.html) {
            push(
                snapshot.url.clone(),
                caps[1].to_string(),
                &mut seen,
                &mut out,
            );
        }
    }

    out
}

// ============================================================================
// Visible text
// ============================================================================

static STRIP_BLOCKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(?:script|style|noscript)>").unwrap());
static STRIP_COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static STRIP_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Cap on the number of extracted text fragments
const VISIBLE_TEXT_LIMIT: usize = 200;

/// Extract visible text fragments from snapshot HTML, in document order.
pub fn visible_text(html: &str) -> Vec<String> {
    let without_blocks = STRIP_BLOCKS.replace_all(html, " ");
    let without_comments = STRIP_COMMENTS.replace_all(&without_blocks, " ");
    let text = STRIP_TAGS.replace_all(&without_comments, "\n");

    let mut seen = HashSet::new();
    let mut fragments = Vec::new();
    for raw in text.split('\n') {
        let fragment = decode_entities(raw.trim());
        if fragment.chars().count() < 2 {
            continue;
        }
        if seen.insert(fragment.clone()) {
            fragments.push(fragment);
            if fragments.len() >= VISIBLE_TEXT_LIMIT {
                break;
            }
        }
    }
    fragments
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_string()
}

// ============================================================================
// Tests
// ============================================================================
