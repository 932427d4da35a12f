use std::any::type_name;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use strand_core::config::RepairConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::Agent;
use strand_core::types::{AgentRequest, ChatMessage};

use crate::context::ProcessContext;

/// A structured value parsed from an agent response.
#[derive(Debug, Clone)]
pub struct Parsed<T> {
    pub value: T,
    /// The agent response the value was parsed from.
    pub raw: String,
    /// Agent invocations it took, counting the successful one.
    pub attempts: u32,
    /// True when the value came from heuristic cleanup or the repair agent
    /// rather than a strict parse.
    pub repaired: bool,
}

/// Turns agent responses into typed values, re-prompting when they don't
/// parse.
///
/// Each attempt tries a strict parse, then heuristic cleanup, then the
/// repair agent if one is set. A failed attempt appends the raw response
/// and a corrective instruction carrying the target schema to the
/// conversation before trying again.
#[derive(Clone)]
pub struct RepairLoop {
    max_retries: u32,
    heuristic_repair: bool,
    repair_agent: Option<Arc<dyn Agent>>,
}

impl RepairLoop {
    pub fn new() -> Self {
        Self::from_config(&RepairConfig::default())
    }

    pub fn from_config(config: &RepairConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            heuristic_repair: config.heuristic_repair,
            repair_agent: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_heuristics(mut self, enabled: bool) -> Self {
        self.heuristic_repair = enabled;
        self
    }

    /// Agent asked to reformat a response that failed to parse. Its calls
    /// do not count as attempts.
    pub fn with_repair_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.repair_agent = Some(agent);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub async fn run<T>(
        &self,
        ctx: &ProcessContext,
        agent: &dyn Agent,
        request: AgentRequest,
    ) -> Result<Parsed<T>>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let type_name = type_name::<T>();
        let mut request = request;
        // A schema already on the request is more specific than the one
        // derived from `T`.
        let schema = match request.output_schema {
            Some(ref schema) => schema.clone(),
            None => serde_json::to_value(schemars::schema_for!(T))?,
        };
        request.output_schema = Some(schema.clone());

        let max_attempts = self.max_attempts();
        let mut last_response = String::new();

        for attempt in 1..=max_attempts {
            if ctx.is_cancelled() {
                return Err(ctx.cancelled_error());
            }

            let raw = ctx.invoke_agent(agent, request.clone()).await?.text();

            let error = match serde_json::from_str::<T>(raw.trim()) {
                Ok(value) => {
                    return Ok(Parsed {
                        value,
                        raw,
                        attempts: attempt,
                        repaired: false,
                    })
                }
                Err(e) => e,
            };

            if self.heuristic_repair {
                if let Ok(value) = serde_json::from_str::<T>(&heuristic_repair(&raw)) {
                    debug!(node = %ctx.node_path(), type_name, attempt, "Heuristic repair succeeded");
                    return Ok(Parsed {
                        value,
                        raw,
                        attempts: attempt,
                        repaired: true,
                    });
                }
            }

            if let Some(ref repair_agent) = self.repair_agent {
                match self.agent_repair::<T>(ctx, repair_agent.as_ref(), &raw, &schema).await {
                    Ok(Some(value)) => {
                        debug!(node = %ctx.node_path(), type_name, attempt, "Repair agent succeeded");
                        return Ok(Parsed {
                            value,
                            raw,
                            attempts: attempt,
                            repaired: true,
                        });
                    }
                    Ok(None) => {}
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(node = %ctx.node_path(), error = %e, "Repair agent failed");
                    }
                }
            }

            warn!(
                node = %ctx.node_path(),
                type_name,
                attempt,
                max_attempts,
                error = %error,
                "Structured output did not parse"
            );

            if attempt < max_attempts {
                request.push(ChatMessage::assistant_text(raw.clone()));
                request.push(ChatMessage::user(corrective_instruction(
                    type_name, &schema, &error,
                )));
            }
            last_response = raw;
        }

        Err(StrandError::StructuredOutputParse {
            type_name,
            attempts: max_attempts,
            last_response,
        })
    }

    async fn agent_repair<T: DeserializeOwned>(
        &self,
        ctx: &ProcessContext,
        repair_agent: &dyn Agent,
        raw: &str,
        schema: &serde_json::Value,
    ) -> Result<Option<T>> {
        let schema_text = serde_json::to_string_pretty(schema)?;
        let prompt = format!(
            r#"The following output should be a JSON value matching the schema below, but it could not be parsed.

Schema:
{}

Original output:
{}

Fix the output so it matches the schema. Return ONLY the corrected JSON, nothing else."#,
            schema_text, raw
        );

        debug!(node = %ctx.node_path(), agent = %repair_agent.name(), "Running agent output repair");
        let repaired = ctx
            .invoke_agent(repair_agent, AgentRequest::new(prompt))
            .await?
            .text();
        if repaired.trim().is_empty() {
            warn!("Agent repair returned empty response");
            return Ok(None);
        }
        Ok(serde_json::from_str::<T>(&heuristic_repair(&repaired)).ok())
    }
}

impl Default for RepairLoop {
    fn default() -> Self {
        Self::new()
    }
}

fn corrective_instruction(
    type_name: &str,
    schema: &serde_json::Value,
    error: &serde_json::Error,
) -> String {
    let schema_text = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "Your previous response could not be parsed as {}: {}\n\n\
         Respond again with a single JSON value matching this schema and nothing else:\n{}",
        type_name, error, schema_text
    )
}

/// Apply heuristic repairs to output.
/// - Strips markdown code fences
/// - Drops prose before the first `{` or `[` and after its last closer
/// - Balances JSON braces
pub fn heuristic_repair(output: &str) -> String {
    let stripped = strip_code_fences(output);
    let span = json_span(&stripped);
    if span.starts_with('{') || span.starts_with('[') {
        balance_braces(span)
    } else {
        span.to_string()
    }
}

/// Strip markdown code fences from text.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

fn json_span(text: &str) -> &str {
    let Some(start) = text.find(['{', '[']) else {
        return text.trim();
    };
    let text = &text[start..];
    match text.rfind(['}', ']']) {
        Some(end) => &text[..=end],
        None => text.trim_end(),
    }
}

/// Balance JSON braces/brackets by appending missing closers.
fn balance_braces(text: &str) -> String {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    let mut result = text.to_string();
    if in_string {
        result.push('"');
    }
    while let Some(closer) = closers.pop() {
        result.push(closer);
    }
    result
}
