//! Prompt placeholder substitution.
//!
//! Templates may reference a closed set of placeholders. Missing values
//! collapse to empty strings, with one sanitization rule: a dangling
//! `, "memberId": "{{MEMBER_ID}}"` fragment is removed outright when no
//! member id is available, so JSON-ish templates stay well formed.

/// Values available to a prompt template.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub role: Option<String>,
    pub session_id: Option<String>,
    pub member_id: Option<String>,
    pub project_path: Option<String>,
}

const MEMBER_ID_FRAGMENT: &str = r#", "memberId": "{{MEMBER_ID}}""#;

/// Render a template against the context.
pub fn render(template: &str, context: &PromptContext) -> String {
    let mut rendered = template.to_string();
    if context.member_id.is_none() {
        rendered = rendered.replace(MEMBER_ID_FRAGMENT, "");
    }
    let pairs = [
        ("{{ROLE}}", context.role.as_deref().unwrap_or("")),
        ("{{SESSION_ID}}", context.session_id.as_deref().unwrap_or("")),
        ("{{MEMBER_ID}}", context.member_id.as_deref().unwrap_or("")),
        (
            "{{PROJECT_PATH}}",
            context.project_path.as_deref().unwrap_or(""),
        ),
    ];
    for (placeholder, value) in pairs {
        rendered = rendered.replace(placeholder, value);
    }
    rendered
}
