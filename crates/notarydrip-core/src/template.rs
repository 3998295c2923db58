//! Template rendering: `{{token}}` substitution for subject lines and bodies.
//!
//! Rendering is a single left-to-right pass: a substituted value is copied
//! literally and never scanned for tokens again. Tokens without a value are
//! left in place so half-configured templates still preview. No escaping is
//! applied; whoever fills the variable bag decides what is trusted.

use std::collections::HashMap;

/// Variables every template may reference.
pub const KNOWN_VARIABLES: [&str; 7] = [
    "first_name",
    "last_name",
    "email",
    "phone_number",
    "form_link",
    "support_email",
    "company_name",
];

/// Tokens reserved for wrapping a rendered body into an HTML layout.
pub const RESERVED_SUBJECT: &str = "subject";
pub const RESERVED_CONTENT: &str = "content";

/// Substitute every `{{name}}` whose name is in `vars`.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            // Unterminated token: keep the remainder verbatim.
            out.push_str(&rest[open..]);
            return out;
        };
        let name = after_open[..close].trim();
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Token names referenced by a template, in order of first appearance.
pub fn tokens(template: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        let name = after_open[..close].trim().to_string();
        if !name.is_empty() && !found.contains(&name) {
            found.push(name);
        }
        rest = &after_open[close + 2..];
    }
    found
}

/// Wrap an already-rendered HTML body into a layout using the reserved
/// `{{subject}}` and `{{content}}` tokens. Other layout tokens are filled from
/// `vars`.
pub fn compose_html(
    layout: &str,
    subject: &str,
    content: &str,
    vars: &HashMap<String, String>,
) -> String {
    let mut merged = vars.clone();
    merged.insert(RESERVED_SUBJECT.to_string(), subject.to_string());
    merged.insert(RESERVED_CONTENT.to_string(), content.to_string());
    render(layout, &merged)
}

/// Result of previewing a template against a variable bag.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Preview {
    pub subject: Option<String>,
    pub body: String,
    /// Tokens that had no value and were left verbatim.
    pub unresolved: Vec<String>,
}

/// Render subject and body and report which tokens stayed unresolved.
pub fn preview(subject: Option<&str>, body: &str, vars: &HashMap<String, String>) -> Preview {
    let mut unresolved: Vec<String> = Vec::new();
    for name in subject
        .map(tokens)
        .unwrap_or_default()
        .into_iter()
        .chain(tokens(body))
    {
        if !vars.contains_key(&name) && !unresolved.contains(&name) {
            unresolved.push(name);
        }
    }
    Preview {
        subject: subject.map(|s| render(s, vars)),
        body: render(body, vars),
        unresolved,
    }
}
