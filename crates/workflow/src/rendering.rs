//! Message templates for playbook steps.
//!
//! Bodies are Tera templates rendered against the opportunity's serialized fields plus an
//! `owner_id` shortcut. Rendering is plain text, so autoescaping is off.

use std::collections::HashMap;
use std::error::Error as _;

use tera::{Context, Tera};
use thiserror::Error;

use dealflow_core::domain::opportunity::Opportunity;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template context error: {0}")]
    Context(String),
    #[error("template error: {0}")]
    Template(String),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MessageRenderer;

impl MessageRenderer {
    pub fn render(&self, template: &str, opportunity: &Opportunity) -> Result<String, RenderError> {
        let mut context = Context::from_serialize(opportunity)
            .map_err(|error| RenderError::Context(error.to_string()))?;
        context.insert("owner_id", &opportunity.owner_id().map(|owner| owner.0.clone()));

        let mut tera = Tera::default();
        tera.autoescape_on(Vec::new());
        tera.register_filter("money", money_filter);
        tera.render_str(template, &context).map_err(|error| RenderError::Template(describe(&error)))
    }
}

/// Two-decimal formatting for amounts, which serialize as strings.
fn money_filter(value: &tera::Value, _args: &HashMap<String, tera::Value>) -> tera::Result<tera::Value> {
    let amount = match value {
        tera::Value::Number(number) => number.as_f64(),
        tera::Value::String(text) => text.parse::<f64>().ok(),
        _ => None,
    };
    Ok(tera::Value::String(amount.map(|amount| format!("{amount:.2}")).unwrap_or_default()))
}

fn describe(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
