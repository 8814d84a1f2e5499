//! Handlebars-based email template rendering.
//!
//! Templates render on the worker, not at intake: intake stays cheap and
//! template upgrades do not require draining queues. Rendering is recomputed
//! on each retry, which is acceptable because retries are rare.
//!
//! A render failure is never fatal to a job; the worker falls back to a
//! minimal body built from `data.subject` and `data.message`.

use crate::error::{DispatchError, DispatchResult};
use handlebars::Handlebars;
use std::sync::Arc;
use tracing::debug;

const USER_WELCOME_HTML: &str = r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h1>Welcome{{#if name}}, {{name}}{{/if}}!</h1>
    <p>Your account is ready. Please verify your email address to get started:</p>
    {{#if verification_link}}<p><a href="{{verification_link}}">Verify email address</a></p>{{/if}}
    <p>If you didn't create an account, you can safely ignore this email.</p>
  </div>
</body>
</html>"#;

const USER_WELCOME_TEXT: &str = r#"Welcome{{#if name}}, {{name}}{{/if}}!

Your account is ready.
{{#if verification_link}}Verify your email address: {{verification_link}}{{/if}}

If you didn't create an account, you can safely ignore this email."#;

const PASSWORD_RESET_HTML: &str = r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h1>Password reset request</h1>
    <p>We received a request to reset your password.</p>
    {{#if reset_link}}<p><a href="{{reset_link}}">Reset password</a></p>{{/if}}
    <p>This link expires in {{#if expiry_hours}}{{expiry_hours}}{{else}}1{{/if}} hour(s).
       If you didn't request a reset, no action is needed.</p>
  </div>
</body>
</html>"#;

const PASSWORD_RESET_TEXT: &str = r#"Password reset request

We received a request to reset your password.
{{#if reset_link}}Reset it here: {{reset_link}}{{/if}}

If you didn't request a reset, no action is needed."#;

const NOTIFICATION_HTML: &str = r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h1>{{#if subject}}{{subject}}{{else}}Notification{{/if}}</h1>
    <p>{{message}}</p>
  </div>
</body>
</html>"#;

const NOTIFICATION_TEXT: &str = r#"{{#if subject}}{{subject}}{{else}}Notification{{/if}}

{{message}}"#;

/// Rendered email content.
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    /// Email subject line.
    pub subject: String,
    /// HTML body content.
    pub html: String,
    /// Plain text body content.
    pub text: String,
}

impl RenderedEmail {
    /// Minimal body derived from `data.subject` and `data.message`, used
    /// when a template is missing or fails to render.
    pub fn fallback(data: &serde_json::Value) -> Self {
        let subject = subject_from(data).unwrap_or_else(|| "Notification".to_string());
        let message = data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Self {
            html: format!("<h1>{subject}</h1><p>{message}</p>"),
            text: if message.is_empty() {
                subject.clone()
            } else {
                format!("{subject}\n\n{message}")
            },
            subject,
        }
    }
}

fn subject_from(data: &serde_json::Value) -> Option<String> {
    data.get("subject")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Template engine for rendering email bodies.
pub struct TemplateEngine {
    handlebars: Arc<Handlebars<'static>>,
}

impl TemplateEngine {
    /// Create an engine with the built-in transactional templates
    /// registered.
    pub fn new() -> DispatchResult<Self> {
        let mut handlebars = Handlebars::new();

        let builtins = [
            ("user_welcome", USER_WELCOME_HTML, USER_WELCOME_TEXT),
            ("password_reset", PASSWORD_RESET_HTML, PASSWORD_RESET_TEXT),
            ("notification", NOTIFICATION_HTML, NOTIFICATION_TEXT),
        ];

        for (name, html, text) in builtins {
            handlebars
                .register_template_string(&format!("{name}_html"), html)
                .map_err(|e| {
                    DispatchError::Template(format!("failed to register {name}_html: {e}"))
                })?;
            handlebars
                .register_template_string(&format!("{name}_text"), text)
                .map_err(|e| {
                    DispatchError::Template(format!("failed to register {name}_text: {e}"))
                })?;
        }

        Ok(Self {
            handlebars: Arc::new(handlebars),
        })
    }

    /// Register a custom template pair under `name`.
    pub fn register(&mut self, name: &str, html: &str, text: &str) -> DispatchResult<()> {
        let handlebars = Arc::get_mut(&mut self.handlebars).ok_or_else(|| {
            DispatchError::Internal("cannot register templates while the engine is shared".into())
        })?;

        handlebars
            .register_template_string(&format!("{name}_html"), html)
            .map_err(|e| DispatchError::Template(format!("failed to register {name}_html: {e}")))?;
        handlebars
            .register_template_string(&format!("{name}_text"), text)
            .map_err(|e| DispatchError::Template(format!("failed to register {name}_text: {e}")))?;
        Ok(())
    }

    /// Render a template with the given data.
    ///
    /// The subject comes from `data.subject` when present, otherwise from a
    /// per-template default.
    pub fn render(&self, template: &str, data: &serde_json::Value) -> DispatchResult<RenderedEmail> {
        debug!(template = %template, "Rendering email template");

        let html = self
            .handlebars
            .render(&format!("{template}_html"), data)
            .map_err(|e| DispatchError::Template(e.to_string()))?;
        let text = self
            .handlebars
            .render(&format!("{template}_text"), data)
            .map_err(|e| DispatchError::Template(e.to_string()))?;

        let subject = subject_from(data).unwrap_or_else(|| default_subject(template).to_string());

        Ok(RenderedEmail {
            subject,
            html,
            text,
        })
    }
}

fn default_subject(template: &str) -> &'static str {
    match template {
        "user_welcome" => "Welcome!",
        "password_reset" => "Password reset request",
        _ => "Notification",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_welcome() {
        let engine = TemplateEngine::new().unwrap();
        let rendered = engine
            .render(
                "user_welcome",
                &json!({"name": "Ada", "verification_link": "https://example.com/v/abc"}),
            )
            .unwrap();

        assert!(rendered.html.contains("Welcome, Ada!"));
        assert!(rendered.html.contains("https://example.com/v/abc"));
        assert!(rendered.text.contains("https://example.com/v/abc"));
        assert_eq!(rendered.subject, "Welcome!");
    }

    #[test]
    fn test_subject_from_data_wins() {
        let engine = TemplateEngine::new().unwrap();
        let rendered = engine
            .render(
                "notification",
                &json!({"subject": "Build failed", "message": "main is red"}),
            )
            .unwrap();

        assert_eq!(rendered.subject, "Build failed");
        assert!(rendered.html.contains("main is red"));
    }

    #[test]
    fn test_unknown_template_errors() {
        let engine = TemplateEngine::new().unwrap();
        let result = engine.render("no_such_template", &json!({}));
        assert!(matches!(result, Err(DispatchError::Template(_))));
    }

    #[test]
    fn test_register_custom_template() {
        let mut engine = TemplateEngine::new().unwrap();
        engine
            .register("invoice", "<p>Invoice {{number}}</p>", "Invoice {{number}}")
            .unwrap();

        let rendered = engine.render("invoice", &json!({"number": 42})).unwrap();
        assert!(rendered.html.contains("Invoice 42"));
    }

    #[test]
    fn test_fallback_body() {
        let fallback = RenderedEmail::fallback(&json!({
            "subject": "Heads up",
            "message": "Something happened",
        }));
        assert_eq!(fallback.subject, "Heads up");
        assert_eq!(fallback.html, "<h1>Heads up</h1><p>Something happened</p>");
        assert!(fallback.text.contains("Something happened"));
    }

    #[test]
    fn test_fallback_defaults_without_fields() {
        let fallback = RenderedEmail::fallback(&json!({}));
        assert_eq!(fallback.subject, "Notification");
        assert_eq!(fallback.text, "Notification");
    }
}
