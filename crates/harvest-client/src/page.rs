//! Small readers over a parsed HTML document.

use scraper::{Html, Selector};

/// Parsed page with lookup helpers for metadata tags.
pub struct Page {
    html: Html,
}

impl Page {
    pub fn parse(source: &str) -> Self {
        Self {
            html: Html::parse_document(source),
        }
    }

    /// `content` of the first `<meta {attr}="{value}">` with a non-blank value.
    pub fn meta(&self, attr: &str, value: &str) -> Option<String> {
        self.attr(&format!(r#"meta[{attr}="{value}"]"#), "content")
    }

    /// First hit over several `(attr, value)` meta lookups.
    pub fn first_meta(&self, candidates: &[(&str, &str)]) -> Option<String> {
        candidates
            .iter()
            .find_map(|(attr, value)| self.meta(attr, value))
    }

    /// Attribute of the first element matching `selector`, trimmed and non-blank.
    pub fn attr(&self, selector: &str, attribute: &str) -> Option<String> {
        let selector = Selector::parse(selector).ok()?;
        self.html
            .select(&selector)
            .filter_map(|el| el.value().attr(attribute))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Text of the first element matching `selector`, whitespace-collapsed.
    pub fn text(&self, selector: &str) -> Option<String> {
        let selector = Selector::parse(selector).ok()?;
        self.html
            .select(&selector)
            .map(|el| el.text().collect::<Vec<_>>().join(" "))
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
            .find(|t| !t.is_empty())
    }

    pub fn title(&self) -> Option<String> {
        self.text("title")
    }

    /// Inline script bodies, in document order.
    pub fn scripts(&self) -> Vec<String> {
        self.script_bodies("script")
    }

    /// Bodies of `<script type="{kind}">` blocks, such as `application/ld+json`.
    pub fn scripts_of_type(&self, kind: &str) -> Vec<String> {
        self.script_bodies(&format!(r#"script[type="{kind}"]"#))
    }

    fn script_bodies(&self, selector: &str) -> Vec<String> {
        let Ok(selector) = Selector::parse(selector) else {
            return Vec::new();
        };
        self.html
            .select(&selector)
            .map(|el| el.text().collect())
            .collect()
    }
}

/// Render seconds as `m:ss`, or `h:mm:ss` from one hour up.
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Seconds in an ISO 8601 time duration such as `PT1H2M3S` or `PT4M`.
pub fn parse_iso8601_duration(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("PT")?;
    if rest.is_empty() {
        return None;
    }
    let mut total = 0u64;
    let mut number = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let n: f64 = number.parse().ok()?;
        number.clear();
        let unit = match c {
            'H' => 3600.0,
            'M' => 60.0,
            'S' => 1.0,
            _ => return None,
        };
        total += (n * unit) as u64;
    }
    number.is_empty().then_some(total)
}

/// Normalise a duration written as plain seconds, ISO 8601 or `m:ss`.
pub fn normalize_duration(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(format_duration(seconds));
    }
    if let Some(seconds) = parse_iso8601_duration(value) {
        return Some(format_duration(seconds));
    }
    value.contains(':').then(|| value.to_string())
}
