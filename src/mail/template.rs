//! Per-stage plain-text templates with `{{key}}` placeholders.
//!
//! Template files live in one directory as `stage_<n>.txt` (`n` = 0 for the
//! initial email). The first line must be `Subject: ...`; the rest is the
//! body. Templates are loaded once, so rendering is pure.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;

use crate::error::RenderError;
use crate::mail::{RenderedEmail, TemplateRenderer};
use crate::sequence::Attributes;

#[derive(Debug, Clone)]
struct StageTemplate {
    subject: String,
    body: String,
}

/// Renders loaded stage templates against a recipient's attributes.
pub struct FileTemplateRenderer {
    templates: BTreeMap<u8, StageTemplate>,
    placeholder: Regex,
}

impl FileTemplateRenderer {
    /// Load every `stage_<n>.txt` in `dir` for `n < stage_count`.
    /// Missing stages are reported when rendered, not here.
    pub fn load(dir: &Path, stage_count: u8) -> Result<Self, RenderError> {
        let mut sources = BTreeMap::new();
        for stage in 0..stage_count {
            let path = dir.join(format!("stage_{stage}.txt"));
            if !path.exists() {
                tracing::warn!(path = %path.display(), "Stage template not found");
                continue;
            }
            sources.insert(stage, std::fs::read_to_string(&path)?);
        }
        tracing::info!(dir = %dir.display(), loaded = sources.len(), "Templates loaded");
        Self::from_sources(sources)
    }

    /// Build from in-memory template sources keyed by stage index.
    pub fn from_sources(sources: BTreeMap<u8, String>) -> Result<Self, RenderError> {
        let placeholder = Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}")
            .map_err(|e| RenderError::InvalidTemplate(e.to_string()))?;
        let templates = sources
            .into_iter()
            .map(|(stage, source)| (stage, split_subject(&source)))
            .collect();
        Ok(Self {
            templates,
            placeholder,
        })
    }

    pub fn has_stage(&self, stage: u8) -> bool {
        self.templates.contains_key(&stage)
    }

    fn fill(&self, stage: u8, text: &str, attributes: &Attributes) -> Result<String, RenderError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in self.placeholder.captures_iter(text) {
            let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = attributes
                .get(key.as_str())
                .ok_or_else(|| RenderError::MissingAttribute {
                    stage,
                    key: key.as_str().to_string(),
                })?;
            out.push_str(&text[last..whole.start()]);
            out.push_str(&value.to_string());
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}

impl TemplateRenderer for FileTemplateRenderer {
    fn render(
        &self,
        stage_index: u8,
        attributes: &Attributes,
    ) -> Result<RenderedEmail, RenderError> {
        let template = self
            .templates
            .get(&stage_index)
            .ok_or(RenderError::MissingTemplate { stage: stage_index })?;
        Ok(RenderedEmail {
            subject: self.fill(stage_index, &template.subject, attributes)?,
            body: self.fill(stage_index, &template.body, attributes)?,
        })
    }
}

/// Split `Subject: ...` off the first line. Without one, the subject is empty.
fn split_subject(source: &str) -> StageTemplate {
    if let Some(rest) = source.strip_prefix("Subject:") {
        let (subject, body) = rest.split_once('\n').unwrap_or((rest, ""));
        return StageTemplate {
            subject: subject.trim().to_string(),
            body: body.trim_start_matches(['\r', '\n']).to_string(),
        };
    }
    StageTemplate {
        subject: String::new(),
        body: source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::AttributeValue;

    fn attrs() -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("first_name".into(), "Ada".into());
        attributes.insert("company".into(), "Analytical Engines".into());
        attributes.insert("headcount".into(), AttributeValue::Number(42.0));
        attributes
    }

    fn renderer() -> FileTemplateRenderer {
        let mut sources = BTreeMap::new();
        sources.insert(
            0,
            "Subject: Quick question about {{ company }}\n\nHi {{first_name}},\nYou have {{headcount}} people.\n".to_string(),
        );
        sources.insert(1, "Subject: Following up\n\nHi {{first_name}}, {{ missing }}".to_string());
        FileTemplateRenderer::from_sources(sources).unwrap()
    }

    #[test]
    fn renders_subject_and_body() {
        let email = renderer().render(0, &attrs()).unwrap();
        assert_eq!(email.subject, "Quick question about Analytical Engines");
        assert_eq!(email.body, "Hi Ada,\nYou have 42 people.\n");
    }

    #[test]
    fn missing_attribute_is_an_error() {
        let err = renderer().render(1, &attrs()).unwrap_err();
        assert!(matches!(err, RenderError::MissingAttribute { stage: 1, ref key } if key == "missing"));
    }

    #[test]
    fn missing_stage_is_an_error() {
        let err = renderer().render(2, &attrs()).unwrap_err();
        assert!(matches!(err, RenderError::MissingTemplate { stage: 2 }));
    }

    #[test]
    fn template_without_subject_line() {
        let template = split_subject("Just a body");
        assert_eq!(template.subject, "");
        assert_eq!(template.body, "Just a body");
    }

    #[test]
    fn loads_stage_files_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stage_0.txt"), "Subject: Hello\n\nBody {{first_name}}").unwrap();
        std::fs::write(dir.path().join("stage_2.txt"), "Subject: Last\n\nBye").unwrap();

        let renderer = FileTemplateRenderer::load(dir.path(), 3).unwrap();
        assert!(renderer.has_stage(0));
        assert!(!renderer.has_stage(1));
        assert!(renderer.has_stage(2));
        assert_eq!(renderer.render(0, &attrs()).unwrap().body, "Body Ada");
    }
}
