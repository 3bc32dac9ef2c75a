//! Prompt templates.
//!
//! Templates are plain text with `{key}` placeholders. `{{` and `}}` render
//! literal braces; braces that do not form a placeholder (JSON samples, code)
//! are kept as-is.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z0-9_.\-]+)\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Slot(String),
}

/// A parsed prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse template text. Parsing never fails; unmatched braces stay literal.
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            text.push_str(&source[last..whole.start()]);
            last = whole.end();

            match caps.get(1) {
                Some(name) => {
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Slot(name.as_str().to_string()));
                }
                // `{{` or `}}`
                None => text.push_str(&whole.as_str()[..1]),
            }
        }

        text.push_str(&source[last..]);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Self { segments }
    }

    /// Distinct placeholder names, in first-use order.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Slot(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// How many times `name` appears in the template.
    pub fn occurrences(&self, name: &str) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Slot(n) if n == name))
            .count()
    }

    /// Render the template, resolving each placeholder through `lookup`.
    ///
    /// Returns the first placeholder that `lookup` cannot resolve.
    pub fn render<'a, F>(&self, lookup: F) -> Result<String, String>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Slot(name) => match lookup(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(name.clone()),
                },
            }
        }
        Ok(out)
    }
}

/// Escape text so that it renders verbatim inside a template.
pub fn escape(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

/// Instruction describing the expected output format, chosen by artifact extension.
pub fn output_format_instruction(output: Option<&Path>) -> &'static str {
    let ext = output
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("json") => "Your final output must be a single, valid JSON object and nothing else.",
        Some("md") => "Your final output must be formatted in Markdown.",
        _ => "Your final output should be plain text.",
    }
}

/// Descriptive fields of an agent that has an objective instead of a raw prompt.
#[derive(Debug, Clone, Default)]
pub struct Persona<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub objective: &'a str,
    pub responsibilities: &'a [String],
    pub traits: &'a [String],
    pub input_sample: Option<&'a str>,
    pub output_sample: Option<&'a str>,
}

/// Build a structured template for a persona agent.
///
/// The input data section holds one placeholder per key in `inputs`.
pub fn persona_template(persona: &Persona<'_>, inputs: &[String], output: Option<&Path>) -> String {
    let mut t = String::new();

    t.push_str("You are an AI agent with the following characteristics:\n");
    t.push_str(&format!("- Name: {}\n", escape(persona.name)));
    if let Some(description) = persona.description {
        t.push_str(&format!("- Description: {}\n", escape(description.trim())));
    }
    if !persona.traits.is_empty() {
        t.push_str(&format!("- Key Traits: {}\n", escape(&persona.traits.join(", "))));
    }

    t.push_str("\nYour primary objective is:\n");
    t.push_str(&escape(persona.objective.trim()));
    t.push('\n');

    if !persona.responsibilities.is_empty() {
        t.push_str("\nYour core responsibilities are:\n");
        for r in persona.responsibilities {
            t.push_str(&format!("- {}\n", escape(r)));
        }
    }

    if let Some(sample) = persona.input_sample.map(str::trim).filter(|s| !s.is_empty()) {
        t.push_str("\n--- INPUT SAMPLE ---\n");
        t.push_str("Here is an example of the type of input you might receive:\n");
        t.push_str(&escape(sample));
        t.push_str("\n--- END INPUT SAMPLE ---\n");
    }

    if let Some(sample) = persona.output_sample.map(str::trim).filter(|s| !s.is_empty()) {
        t.push_str("\n--- OUTPUT SAMPLE ---\n");
        t.push_str("Here is an example of the expected output format:\n");
        t.push_str(&escape(sample));
        t.push_str("\n--- END OUTPUT SAMPLE ---\n");
    }

    t.push_str("\nBased on the input data below, perform your task and generate the required output.\n");
    t.push_str(&format!(
        "**Output Format Requirement:** {}\n",
        output_format_instruction(output)
    ));

    t.push_str("\n--- INPUT DATA ---\n");
    match inputs {
        [single] => t.push_str(&format!("{{{}}}\n", single)),
        many => {
            for key in many {
                t.push_str(&format!("### {}\n{{{}}}\n\n", key, key));
            }
        }
    }
    t.push_str("--- END INPUT DATA ---\n\nGenerate your response now.\n");

    t
}
