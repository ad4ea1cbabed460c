//! Prompt assembly from versioned templates.
//!
//! Templates are minijinja sources bundled under `templates/<version>/` and
//! may be overridden from a directory at startup. Rendering is pure: no I/O
//! happens after construction.

use std::path::Path;

use minijinja::{Environment, UndefinedBehavior, context};
use serde::Serialize;
use tracing::{debug, error, info};

use medscribe_llm::{CompletionRequest, Message};
use medscribe_types::{ConversationTurn, ReportMetadata, TemplateKind, TurnRole};

use crate::error::{DomainError, Result};

/// Version of the bundled templates.
pub const TEMPLATE_VERSION: &str = "v1";

const CORRECTION: &str = "correction";
const GENERATION: &str = "generation";
const CONDENSE: &str = "condense";

const BUNDLED: [(&str, &str); 3] = [
    (CORRECTION, include_str!("../templates/v1/correction.j2")),
    (GENERATION, include_str!("../templates/v1/generation.j2")),
    (CONDENSE, include_str!("../templates/v1/condense.j2")),
];

/// A fully rendered prompt, ready to send to the text generation service.
///
/// Built per request and consumed once.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptEnvelope {
    pub kind: TemplateKind,
    pub metadata: ReportMetadata,
    pub context: Vec<String>,
    pub instruction: String,
    pub history: Vec<ConversationTurn>,
    /// Rendered system prompt.
    pub system: String,
    pub template_version: String,
}

impl PromptEnvelope {
    /// Conversation history followed by the current instruction.
    pub fn messages(&self) -> Vec<Message> {
        self.history
            .iter()
            .map(|turn| match turn.role {
                TurnRole::User => Message::user(&turn.content),
                TurnRole::Assistant => Message::assistant(&turn.content),
            })
            .chain(std::iter::once(Message::user(&self.instruction)))
            .collect()
    }

    /// Build a streaming completion request.
    pub fn to_request(&self, model: &str, max_tokens: u32, temperature: Option<f32>) -> CompletionRequest {
        let mut request = CompletionRequest::new(model, self.messages(), max_tokens)
            .with_system(&self.system)
            .with_streaming();
        if let Some(t) = temperature {
            request = request.with_temperature(t);
        }
        request
    }
}

/// Metadata as rendered into templates: every field present, missing ones
/// replaced by the "Not specified" placeholder.
#[derive(Debug, Serialize)]
struct RenderedMetadata<'a> {
    patient_name: &'a str,
    age: &'a str,
    file_number: &'a str,
    doctor_name: &'a str,
    department: &'a str,
}

impl<'a> From<&'a ReportMetadata> for RenderedMetadata<'a> {
    fn from(meta: &'a ReportMetadata) -> Self {
        Self {
            patient_name: ReportMetadata::display(&meta.patient_name),
            age: ReportMetadata::display(&meta.age),
            file_number: ReportMetadata::display(&meta.file_number),
            doctor_name: ReportMetadata::display(&meta.doctor_name),
            department: ReportMetadata::display(&meta.department),
        }
    }
}

/// Renders the correction, generation and query-condensing templates.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    env: Environment<'static>,
    version: String,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptAssembler {
    /// Assembler using the bundled templates.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        for (name, source) in BUNDLED {
            // Bundled sources always parse; see tests.
            if let Err(e) = env.add_template(name, source) {
                error!(template = name, error = %e, "Bundled template failed to parse");
            }
        }

        Self {
            env,
            version: TEMPLATE_VERSION.to_string(),
        }
    }

    /// Assembler whose templates are overridden by `<name>.j2` files in `dir`.
    ///
    /// Files that are absent keep the bundled version. A `VERSION` file names
    /// the template set; otherwise it is recorded as `<bundled>+custom`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut assembler = Self::new();
        let mut overridden = Vec::new();

        for (name, _) in BUNDLED {
            let path = dir.join(format!("{}.j2", name));
            if !path.is_file() {
                continue;
            }
            let source = std::fs::read_to_string(&path).map_err(|e| {
                DomainError::Template(format!("reading {}: {}", path.display(), e))
            })?;
            assembler.env.add_template_owned(name, source)?;
            overridden.push(name);
        }

        let version_file = dir.join("VERSION");
        assembler.version = match std::fs::read_to_string(&version_file) {
            Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ if overridden.is_empty() => TEMPLATE_VERSION.to_string(),
            _ => format!("{}+custom", TEMPLATE_VERSION),
        };

        info!(
            dir = %dir.display(),
            overridden = ?overridden,
            version = %assembler.version,
            "Loaded prompt templates"
        );
        Ok(assembler)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Merge context, metadata, history and the instruction into an envelope.
    pub fn assemble(
        &self,
        kind: TemplateKind,
        metadata: &ReportMetadata,
        context: &[String],
        instruction: &str,
        history: &[ConversationTurn],
    ) -> Result<PromptEnvelope> {
        let system = self.render_system(kind, metadata, context)?;

        debug!(
            kind = %kind,
            context_passages = context.len(),
            history_turns = history.len(),
            system_len = system.len(),
            "Assembled prompt"
        );

        Ok(PromptEnvelope {
            kind,
            metadata: metadata.clone(),
            context: context.to_vec(),
            instruction: instruction.to_string(),
            history: history.to_vec(),
            system,
            template_version: self.version.clone(),
        })
    }

    /// Render only the system prompt for a template kind.
    pub fn render_system(
        &self,
        kind: TemplateKind,
        metadata: &ReportMetadata,
        context: &[String],
    ) -> Result<String> {
        let name = match kind {
            TemplateKind::Correction => CORRECTION,
            TemplateKind::Generation => GENERATION,
        };
        let meta = RenderedMetadata::from(metadata);

        let template = self.env.get_template(name)?;
        let rendered = template.render(context! {
            patient_name => meta.patient_name,
            age => meta.age,
            file_number => meta.file_number,
            doctor_name => meta.doctor_name,
            department => meta.department,
            context => context,
        })?;
        Ok(rendered)
    }

    /// Prompt asking the model to rewrite `input` as a standalone search query.
    pub fn render_condense(&self, input: &str, history: &[ConversationTurn]) -> Result<String> {
        let template = self.env.get_template(CONDENSE)?;
        Ok(template.render(context! { input => input, history => history })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medscribe_types::NOT_SPECIFIED;

    fn full_metadata() -> ReportMetadata {
        ReportMetadata::default()
            .with_patient_name("Jane Roe")
            .with_age("54")
            .with_file_number("F-2231")
            .with_doctor_name("Amal Haddad")
            .with_department("Cardiology")
    }

    #[test]
    fn test_correction_renders_banner_and_footer() {
        let assembler = PromptAssembler::new();
        let system = assembler
            .render_system(TemplateKind::Correction, &full_metadata(), &[])
            .unwrap();

        assert!(system.contains("expert medical editor"));
        assert!(system.contains(
            "Patient: Jane Roe | Age: 54 | File No.: F-2231 | Department: Cardiology"
        ));
        assert!(system.contains("Reported by: Dr. Amal Haddad"));
        assert!(system.contains("No related prior reports were found."));
        assert!(!system.contains(NOT_SPECIFIED));
    }

    #[test]
    fn test_generation_lists_sections() {
        let assembler = PromptAssembler::new();
        let system = assembler
            .render_system(TemplateKind::Generation, &full_metadata(), &[])
            .unwrap();

        for section in [
            "Chief Complaint",
            "History of Present Illness",
            "Medical History",
            "Past Surgical History",
            "Personal History",
            "Family History",
            "Review of Systems",
        ] {
            assert!(system.contains(section), "missing section {}", section);
        }
        assert!(system.contains("- Age: 54"));
    }

    #[test]
    fn test_missing_fields_render_not_specified() {
        let assembler = PromptAssembler::new();
        let metadata = ReportMetadata::default().with_patient_name("Jane Roe");

        for kind in [TemplateKind::Correction, TemplateKind::Generation] {
            let system = assembler.render_system(kind, &metadata, &[]).unwrap();
            assert!(system.contains("Jane Roe"));
            assert!(system.contains(&format!("Dr. {}", NOT_SPECIFIED)));
            assert!(!system.contains("Age: \n") && !system.contains("Age:  |"));
        }

        let banner = assembler
            .render_system(TemplateKind::Correction, &metadata, &[])
            .unwrap();
        assert!(banner.contains(
            "Patient: Jane Roe | Age: Not specified | File No.: Not specified | Department: Not specified"
        ));
    }

    #[test]
    fn test_blank_field_is_not_specified() {
        let assembler = PromptAssembler::new();
        let metadata = ReportMetadata::default().with_age("  ");
        let system = assembler
            .render_system(TemplateKind::Generation, &metadata, &[])
            .unwrap();
        assert!(system.contains("- Age: Not specified"));
    }

    #[test]
    fn test_context_passages_are_numbered_in_order() {
        let assembler = PromptAssembler::new();
        let context = vec!["first passage".to_string(), "second passage".to_string()];
        let system = assembler
            .render_system(TemplateKind::Correction, &full_metadata(), &context)
            .unwrap();

        let first = system.find("[1] first passage").unwrap();
        let second = system.find("[2] second passage").unwrap();
        assert!(first < second);
        assert!(!system.contains("No related prior reports"));
    }

    #[test]
    fn test_envelope_messages_append_instruction_after_history() {
        let assembler = PromptAssembler::new();
        let history = vec![
            ConversationTurn::user("draft one"),
            ConversationTurn::assistant("corrected one"),
        ];
        let envelope = assembler
            .assemble(
                TemplateKind::Correction,
                &full_metadata(),
                &[],
                "now shorten it",
                &history,
            )
            .unwrap();

        let messages = envelope.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::user("draft one"));
        assert_eq!(messages[1], Message::assistant("corrected one"));
        assert_eq!(messages[2], Message::user("now shorten it"));
        assert_eq!(envelope.template_version, TEMPLATE_VERSION);

        let request = envelope.to_request("gpt-4o", 512, Some(0.2));
        assert!(request.stream);
        assert_eq!(request.system.as_deref(), Some(envelope.system.as_str()));
        assert_eq!(request.temperature, Some(0.2));
    }

    #[test]
    fn test_condense_includes_history() {
        let assembler = PromptAssembler::new();
        let prompt = assembler
            .render_condense(
                "what about the echo?",
                &[ConversationTurn::user("patient with chest pain")],
            )
            .unwrap();
        assert!(prompt.contains("user: patient with chest pain"));
        assert!(prompt.contains("Follow-up instruction: what about the echo?"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let assembler = PromptAssembler::new();
        let a = assembler
            .render_system(TemplateKind::Generation, &full_metadata(), &["x".into()])
            .unwrap();
        let b = assembler
            .render_system(TemplateKind::Generation, &full_metadata(), &["x".into()])
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_override_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("correction.j2"),
            "Custom editor for {{ patient_name }}. {{ context | length }} passages.",
        )
        .unwrap();

        let assembler = PromptAssembler::from_dir(dir.path()).unwrap();
        assert_eq!(assembler.version(), "v1+custom");

        let system = assembler
            .render_system(TemplateKind::Correction, &ReportMetadata::default(), &[])
            .unwrap();
        assert_eq!(system, "Custom editor for Not specified. 0 passages.");

        // Untouched templates keep the bundled text.
        let generation = assembler
            .render_system(TemplateKind::Generation, &ReportMetadata::default(), &[])
            .unwrap();
        assert!(generation.contains("Chief Complaint"));

        std::fs::write(dir.path().join("VERSION"), "2024-house-style\n").unwrap();
        let versioned = PromptAssembler::from_dir(dir.path()).unwrap();
        assert_eq!(versioned.version(), "2024-house-style");
    }

    #[test]
    fn test_override_with_unknown_variable_fails_at_render() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("generation.j2"), "{{ no_such_field }}").unwrap();

        let assembler = PromptAssembler::from_dir(dir.path()).unwrap();
        let err = assembler
            .render_system(TemplateKind::Generation, &ReportMetadata::default(), &[])
            .unwrap_err();
        assert!(matches!(err, DomainError::Template(_)));
    }
}
