//! Selector extraction and quality analysis
//!
//! Pulls locator expressions out of free-form failure text, scores their
//! robustness, and proposes semantically stronger alternatives against a DOM
//! snapshot. The extraction priority (semantic-locator call patterns, then
//! CSS families, then quoted text) is load-bearing: when a failure's text
//! contains several plausible selector-like substrings, the order decides
//! which candidate the rest of the pipeline sees.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dom::{find_element, MatchedElement};
use crate::types::SelectorQuality;

// ============================================================================
// Extraction
// ============================================================================

/// Locator families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorKind {
    Css,
    SemanticLocator,
    Text,
    Unknown,
}

/// A locator parsed out of free text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedSelector {
    /// The usable selector expression
    pub selector: String,
    pub kind: SelectorKind,
    /// The raw text the extraction matched
    pub matched_text: String,
    pub used_semantic_api: bool,
}

/// Semantic-locator API call patterns, each capturing its string argument.
/// Order within this table is part of the extraction contract.
static SEMANTIC_CALLS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"getByRole\(\s*['"][^'"]+['"](?:\s*,\s*\{[^}]*\})?\s*\)"#,
        r#"getByTestId\(\s*['"][^'"]+['"]\s*\)"#,
        r#"getByLabel\(\s*['"][^'"]+['"]\s*\)"#,
        r#"getByPlaceholder\(\s*['"][^'"]+['"]\s*\)"#,
        r#"getByAltText\(\s*['"][^'"]+['"]\s*\)"#,
        r#"getByTitle\(\s*['"][^'"]+['"]\s*\)"#,
        r#"getByText\(\s*['"][^'"]+['"](?:\s*,\s*\{[^}]*\})?\s*\)"#,
        r#"locator\(\s*['"]([^'"]+)['"]\s*\)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// CSS-family patterns: id, class chain, attribute, combinator expression
static CSS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // combinator expression first: it subsumes the simpler shapes
        r#"[#.\w\[\]"'=^$*|-]+(?:\s*[>+~]\s*[#.\w\[\]"'=^$*|:()-]+)+"#,
        r#"#[A-Za-z_][\w-]*"#,
        r#"\.[A-Za-z_][\w-]*(?:\.[A-Za-z_][\w-]*)*"#,
        r#"[a-zA-Z]*\[[\w-]+\s*[*^$~|]?=?\s*["']?[^"'\]]*["']?\]"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#"["']([^"']+)["']"#).unwrap());

/// Tokens that mark a quoted string as error prose, not a selector
const ERRORISH: &[&str] = &["error", "timeout", "exceeded", "waiting", "failed", "expect"];

/// Longest quoted string accepted as a likely selector before the last-resort
/// pass
const SHORT_QUOTE_LIMIT: usize = 50;

/// Extract a locator expression from free-form failure text.
pub fn extract_selector(text: &str) -> Option<ExtractedSelector> {
    // A "Locator: ..." label narrows the search to the labelled tail
    let haystack = match text.split_once("Locator:") {
        Some((_, rest)) => rest.trim(),
        None => text,
    };

    for re in SEMANTIC_CALLS.iter() {
        if let Some(m) = re.find(haystack) {
            let matched = m.as_str().to_string();
            // locator(...) wraps a raw selector; the getBy* family is the
            // semantic API proper
            if let Some(caps) = re.captures(haystack) {
                if matched.starts_with("locator(") {
                    let inner = caps.get(1).map(|g| g.as_str().to_string());
                    if let Some(inner) = inner {
                        return Some(ExtractedSelector {
                            kind: classify_raw(&inner),
                            selector: inner,
                            matched_text: matched,
                            used_semantic_api: false,
                        });
                    }
                }
            }
            return Some(ExtractedSelector {
                selector: matched.clone(),
                kind: SelectorKind::SemanticLocator,
                matched_text: matched,
                used_semantic_api: true,
            });
        }
    }

    for re in CSS_PATTERNS.iter() {
        if let Some(m) = re.find(haystack) {
            let matched = m.as_str().trim().to_string();
            if matched.len() > 1 {
                return Some(ExtractedSelector {
                    selector: matched.clone(),
                    kind: SelectorKind::Css,
                    matched_text: matched,
                    used_semantic_api: false,
                });
            }
        }
    }

    let mut last_resort = None;
    for caps in QUOTED.captures_iter(haystack) {
        let inner = caps.get(1).map(|g| g.as_str()).unwrap_or_default();
        let lower = inner.to_lowercase();
        if inner.len() <= SHORT_QUOTE_LIMIT && !ERRORISH.iter().any(|t| lower.contains(t)) {
            return Some(ExtractedSelector {
                selector: inner.to_string(),
                kind: SelectorKind::Text,
                matched_text: caps.get(0).map(|g| g.as_str()).unwrap_or(inner).to_string(),
                used_semantic_api: false,
            });
        }
        if last_resort.is_none() {
            last_resort = Some(ExtractedSelector {
                selector: inner.to_string(),
                kind: SelectorKind::Text,
                matched_text: caps.get(0).map(|g| g.as_str()).unwrap_or(inner).to_string(),
                used_semantic_api: false,
            });
        }
    }
    last_resort
}

/// Quick prefix heuristic for selectors recorded on trace actions
pub fn classify_raw(selector: &str) -> SelectorKind {
    let s = selector.trim();
    if s.contains("getBy") || s.starts_with("role=") || s.starts_with("text=") {
        SelectorKind::SemanticLocator
    } else if s.starts_with('#')
        || s.starts_with('.')
        || s.starts_with('[')
        || s.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
    {
        SelectorKind::Css
    } else {
        SelectorKind::Unknown
    }
}

// ============================================================================
// Quality analysis
// ============================================================================

/// Scoring ledger for one selector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityBreakdown {
    /// Clamped to [0, 1]
    pub score: f64,
    pub rating: SelectorQuality,
    pub issues: Vec<String>,
    pub strengths: Vec<String>,
}

static TRAILING_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+$").unwrap());
static DATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{1,4}[-/.]\d{1,2}[-/.]\d{1,4}").unwrap());
static NTH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":(?:nth-child|first-child|last-child)").unwrap());

const GENERIC_TAGS: &[&str] = &[
    "div", "span", "p", "a", "button", "input", "li", "ul", "td", "tr", "img", "section",
];

/// Score a selector's robustness. Starts at 1.0 and applies the penalty and
/// bonus ledger; the DOM, when supplied, contributes a uniqueness check.
pub fn analyze_selector_quality(selector: &str, dom_html: Option<&str>) -> QualityBreakdown {
    let mut score: f64 = 1.0;
    let mut issues = Vec::new();
    let mut strengths = Vec::new();
    let s = selector.trim();

    let semantic = s.contains("getBy");
    if semantic {
        if s.contains("getByRole") {
            strengths.push("role-based locator survives markup changes".to_string());
        }
        if s.contains("getByTestId") {
            strengths.push("test-id locator is purpose-built for testing".to_string());
        }
        if s.contains("getByLabel") {
            strengths.push("label-based locator tracks the accessible name".to_string());
        }
        if s.contains("getByText") {
            score -= 0.25;
            issues.push("text-based locator breaks when copy changes".to_string());
        }
        if s.contains("getByPlaceholder") || s.contains("getByAltText") || s.contains("getByTitle")
        {
            score -= 0.05;
            issues.push("secondary-attribute locator is weaker than role or test id".to_string());
        }
    } else {
        // CSS-family or literal text
        let looks_css = s.starts_with('#')
            || s.starts_with('.')
            || s.starts_with('[')
            || s.contains('>')
            || GENERIC_TAGS.iter().any(|t| s.starts_with(t));

        if looks_css {
            score -= 0.1;
            issues.push("raw CSS selector is coupled to DOM structure".to_string());

            let depth = css_depth(s);
            if depth >= 2 {
                score -= 0.1;
                issues.push(format!("nested {} levels deep", depth));
            }
            if depth >= 3 {
                score -= 0.15;
                issues.push("deep nesting breaks on any layout change".to_string());
            }
            if s.contains('.') {
                score -= 0.1;
                issues.push("class-based selection follows styling churn".to_string());
            }
            if s.starts_with('#') {
                score += 0.1;
                strengths.push("id-based selection".to_string());
            }
            if s.contains("[data-") {
                score += 0.15;
                strengths.push("data-attribute selection is test-stable".to_string());
            }
            if GENERIC_TAGS.contains(&s) {
                score -= 0.3;
                issues.push("bare tag name matches many elements".to_string());
            }
            if s.len() > 100 {
                score -= 0.15;
                issues.push("overly long selector".to_string());
            }
        } else {
            // Literal text selector
            score -= 0.3;
            issues.push("literal text match breaks when copy changes".to_string());
            if s.chars().any(|c| c.is_ascii_digit()) || DATE_PATTERN.is_match(s) {
                score -= 0.15;
                issues.push("text contains digits or dates that look dynamic".to_string());
            }
        }
    }

    let lower = s.to_lowercase();
    if TRAILING_DIGITS.is_match(s)
        || lower.contains("random")
        || lower.contains("uuid")
        || lower.contains("id-")
    {
        score -= 0.2;
        issues.push("likely dynamically generated value".to_string());
    }

    if NTH_PATTERN.is_match(s) {
        score -= 0.2;
        issues.push("position-dependent pseudo-class".to_string());
    }
    if lower.starts_with("body>") || lower.starts_with("body >") || lower.starts_with("html>")
        || lower.starts_with("html >")
    {
        score -= 0.15;
        issues.push("anchored to the document root".to_string());
    }

    if let Some(dom) = dom_html {
        if let Some(tag) = leading_tag(s) {
            let count = tag_count(dom, &tag);
            if count > 10 {
                score -= 0.1;
                issues.push(format!("<{}> appears {} times in the snapshot", tag, count));
            }
        }
    }

    let score = score.clamp(0.0, 1.0);
    QualityBreakdown {
        score,
        rating: SelectorQuality::from_score(score),
        issues,
        strengths,
    }
}

/// Number of combinator steps beyond the first segment
fn css_depth(selector: &str) -> usize {
    static COMBINATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[>+~]\s*|\s+").unwrap());
    COMBINATOR.split(selector.trim()).filter(|p| !p.is_empty()).count().saturating_sub(1)
}

fn leading_tag(selector: &str) -> Option<String> {
    let tag: String = selector
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    (!tag.is_empty() && GENERIC_TAGS.contains(&tag.to_lowercase().as_str()))
        .then(|| tag.to_lowercase())
}

fn tag_count(dom: &str, tag: &str) -> usize {
    let needle = format!("<{}", tag);
    dom.to_lowercase().matches(&needle).count()
}

// ============================================================================
// Suggestion
// ============================================================================

/// A proposed replacement selector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSuggestion {
    pub selector: String,
    pub reason: String,
    pub confidence: f64,
}

static ATTR_CAPTURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([a-zA-Z-]+)\s*=\s*["']([^"']*)["']"#).unwrap());

const FORM_CONTROL_TAGS: &[&str] = &["input", "select", "textarea"];

/// Propose a semantically stronger selector for the element the extracted
/// selector points at. `None` when the element cannot be located in the DOM.
pub fn suggest_selector(
    extracted: &ExtractedSelector,
    dom_html: &str,
) -> Option<SelectorSuggestion> {
    let element = find_element(dom_html, &extracted.selector)?;
    let attrs = parse_attrs(&element.opening_tag);
    let get = |name: &str| attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());

    if let Some(testid) = get("data-testid").or_else(|| get("data-test-id")) {
        return Some(SelectorSuggestion {
            selector: format!("getByTestId('{}')", testid),
            reason: "element carries a dedicated test id".to_string(),
            confidence: 0.95,
        });
    }

    let inferred = inferred_role(&element, &attrs);
    let accessible_name = get("aria-label")
        .map(str::to_string)
        .or_else(|| short_stable_text(&element.inner_text));

    if let Some(role) = get("role") {
        if let Some(name) = accessible_name.as_deref() {
            return Some(SelectorSuggestion {
                selector: format!("getByRole('{}', {{ name: '{}' }})", role, name),
                reason: "explicit role with an accessible name".to_string(),
                confidence: 0.9,
            });
        }
        return Some(SelectorSuggestion {
            selector: format!("getByRole('{}')", role),
            reason: "explicit role attribute".to_string(),
            confidence: 0.75,
        });
    }
    if let (Some(label), Some(role)) = (get("aria-label"), inferred.as_deref()) {
        return Some(SelectorSuggestion {
            selector: format!("getByRole('{}', {{ name: '{}' }})", role, label),
            reason: "aria-label with a role inferred from the tag".to_string(),
            confidence: 0.8,
        });
    }
    if FORM_CONTROL_TAGS.contains(&element.tag.as_str()) {
        if let Some(id) = get("id") {
            if let Some(label) = label_for(dom_html, id) {
                return Some(SelectorSuggestion {
                    selector: format!("getByLabel('{}')", label),
                    reason: "associated <label for> text".to_string(),
                    confidence: 0.8,
                });
            }
        }
        if let Some(placeholder) = get("placeholder") {
            return Some(SelectorSuggestion {
                selector: format!("getByPlaceholder('{}')", placeholder),
                reason: "placeholder text on a form control".to_string(),
                confidence: 0.75,
            });
        }
    }
    if let (Some(text), Some(role)) = (short_stable_text(&element.inner_text), inferred.as_deref()) {
        return Some(SelectorSuggestion {
            selector: format!("getByRole('{}', {{ name: '{}' }})", role, text),
            reason: "short stable text content with an inferred role".to_string(),
            confidence: 0.7,
        });
    }
    if element.tag == "img" {
        if let Some(alt) = get("alt") {
            return Some(SelectorSuggestion {
                selector: format!("getByAltText('{}')", alt),
                reason: "image alt text".to_string(),
                confidence: 0.7,
            });
        }
    }
    if let Some(id) = get("id") {
        return Some(SelectorSuggestion {
            selector: format!("#{}", id),
            reason: "id attribute, as a last resort".to_string(),
            confidence: 0.5,
        });
    }

    None
}

fn parse_attrs(opening_tag: &str) -> Vec<(String, String)> {
    ATTR_CAPTURE
        .captures_iter(opening_tag)
        .map(|c| (c[1].to_lowercase(), c[2].to_string()))
        .collect()
}

/// Role inferred from the element's tag, for elements without an explicit one
fn inferred_role(element: &MatchedElement, attrs: &[(String, String)]) -> Option<String> {
    let input_type = attrs
        .iter()
        .find(|(k, _)| k == "type")
        .map(|(_, v)| v.as_str())
        .unwrap_or("text");
    let role = match element.tag.as_str() {
        "button" => "button",
        "a" => "link",
        "select" => "combobox",
        "textarea" => "textbox",
        "img" => "img",
        "input" => match input_type {
            "button" | "submit" | "reset" => "button",
            "checkbox" => "checkbox",
            "radio" => "radio",
            _ => "textbox",
        },
        _ => return None,
    };
    Some(role.to_string())
}

/// Text usable as an accessible name: short and free of dynamic-looking runs
fn short_stable_text(text: &str) -> Option<String> {
    static LONG_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{3,}").unwrap());
    let trimmed = text.trim();
    (!trimmed.is_empty() && trimmed.chars().count() <= 40 && !LONG_DIGITS.is_match(trimmed))
        .then(|| trimmed.to_string())
}

fn label_for(dom_html: &str, id: &str) -> Option<String> {
    let re = Regex::new(&format!(
        r#"(?i)<label[^>]*for\s*=\s*["']{}["'][^>]*>([^<]+)"#,
        regex::escape(id)
    ))
    .ok()?;
    re.captures(dom_html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

// ============================================================================
// Tests
// ============================================================================
