//! Chat prompt rendering.
//!
//! A GGUF file usually carries its own Jinja chat template
//! (`tokenizer.chat_template`); it is rendered with minijinja. When the file
//! has none, or it uses constructs minijinja rejects, the built-in template of
//! the model's prompt family is used instead.

use std::path::Path;

use minijinja::{context, Environment, Error as TemplateError, ErrorKind};
use tracing::warn;

use super::{ChatMessage, EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFamily {
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

impl PromptFamily {
    /// File names win over the architecture tag: Mistral GGUFs report `llama`.
    pub fn detect(architecture: &str, path: &Path) -> Self {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_lowercase();
        if name.contains("mistral") || name.contains("mixtral") {
            return Self::Mistral;
        }
        match architecture {
            "qwen2" | "qwen" => Self::Qwen,
            "llama" => Self::Llama,
            _ if name.contains("qwen") => Self::Qwen,
            _ if name.contains("llama") => Self::Llama,
            _ => Self::Unknown,
        }
    }

    /// End-of-turn markers that can leak into decoded text.
    pub fn stop_markers(self) -> &'static [&'static str] {
        match self {
            Self::Llama => &["<|eot_id|>", "<|end_of_text|>"],
            Self::Qwen => &["<|im_end|>", "<|endoftext|>"],
            Self::Mistral => &["</s>"],
            Self::Unknown => &[],
        }
    }

    fn builtin_template(self) -> &'static str {
        match self {
            Self::Llama => concat!(
                "{{ bos_token }}{% for m in messages %}",
                "<|start_header_id|>{{ m.role }}<|end_header_id|>\n\n{{ m.content }}<|eot_id|>",
                "{% endfor %}",
                "{% if add_generation_prompt %}<|start_header_id|>assistant<|end_header_id|>\n\n{% endif %}",
            ),
            Self::Qwen => concat!(
                "{% for m in messages %}<|im_start|>{{ m.role }}\n{{ m.content }}<|im_end|>\n{% endfor %}",
                "{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}",
            ),
            Self::Mistral => concat!(
                "{{ bos_token }}{% for m in messages %}",
                "{% if m.role == 'assistant' %}{{ m.content }}{{ eos_token }}",
                "{% else %}[INST] {{ m.content }} [/INST]{% endif %}",
                "{% endfor %}",
            ),
            Self::Unknown => concat!(
                "{% for m in messages %}[{{ m.role }}]\n{{ m.content }}\n{% endfor %}",
                "{% if add_generation_prompt %}[assistant]\n{% endif %}",
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatTemplate {
    family: PromptFamily,
    embedded: Option<String>,
    bos_token: String,
    eos_token: String,
}

fn raise_exception(message: String) -> Result<String, TemplateError> {
    Err(TemplateError::new(ErrorKind::InvalidOperation, message))
}

impl ChatTemplate {
    pub fn new(family: PromptFamily, embedded: Option<String>, bos_token: &str, eos_token: &str) -> Self {
        Self {
            family,
            embedded: embedded.filter(|t| !t.trim().is_empty()),
            bos_token: bos_token.to_string(),
            eos_token: eos_token.to_string(),
        }
    }

    pub fn family(&self) -> PromptFamily {
        self.family
    }

    fn render_source(&self, source: &str, messages: &[ChatMessage]) -> Result<String, TemplateError> {
        let mut env = Environment::new();
        env.add_function("raise_exception", raise_exception);
        env.render_str(
            source,
            context! {
                messages => messages,
                add_generation_prompt => true,
                bos_token => self.bos_token.as_str(),
                eos_token => self.eos_token.as_str(),
            },
        )
    }

    /// Renders the conversation followed by the assistant header.
    pub fn render(&self, messages: &[ChatMessage]) -> EngineResult<String> {
        if let Some(source) = &self.embedded {
            match self.render_source(source, messages) {
                Ok(prompt) => return Ok(prompt),
                Err(err) => warn!(error = %err, family = ?self.family, "embedded chat template failed, using built-in"),
            }
        }
        self.render_source(self.family.builtin_template(), messages)
            .map_err(|e| EngineError::Tokenization(format!("chat template: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Role;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(Role::User, "hi"),
            ChatMessage::new(Role::Assistant, "hello"),
            ChatMessage::new(Role::User, "how are you?"),
        ]
    }

    #[test]
    fn family_detection_prefers_file_name_for_mistral() {
        assert_eq!(PromptFamily::detect("llama", Path::new("/m/mistral-7b.Q4.gguf")), PromptFamily::Mistral);
        assert_eq!(PromptFamily::detect("llama", Path::new("/m/model.gguf")), PromptFamily::Llama);
        assert_eq!(PromptFamily::detect("qwen2", Path::new("/m/model.gguf")), PromptFamily::Qwen);
        assert_eq!(PromptFamily::detect("phi3", Path::new("/m/Qwen2.5-0.5B.gguf")), PromptFamily::Qwen);
        assert_eq!(PromptFamily::detect("phi3", Path::new("/m/phi.gguf")), PromptFamily::Unknown);
    }

    #[test]
    fn llama_template_ends_with_assistant_header() {
        let template = ChatTemplate::new(PromptFamily::Llama, None, "<|begin_of_text|>", "<|end_of_text|>");
        let prompt = template.render(&conversation()).expect("render");
        assert!(prompt.starts_with("<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\nhi<|eot_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn qwen_template_is_chatml() {
        let template = ChatTemplate::new(PromptFamily::Qwen, None, "", "<|endoftext|>");
        let prompt = template.render(&conversation()).expect("render");
        assert_eq!(
            prompt,
            "<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\nhello<|im_end|>\n\
             <|im_start|>user\nhow are you?<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn embedded_template_is_preferred_and_broken_one_falls_back() {
        let embedded = "{% for m in messages %}<{{ m.role }}>{{ m.content }}{% endfor %}<assistant>";
        let template = ChatTemplate::new(PromptFamily::Unknown, Some(embedded.into()), "", "");
        assert_eq!(
            template.render(&conversation()).expect("render"),
            "<user>hi<assistant>hello<user>how are you?<assistant>"
        );

        let raising = "{{ raise_exception('roles must alternate') }}";
        let template = ChatTemplate::new(PromptFamily::Unknown, Some(raising.into()), "", "");
        let prompt = template.render(&conversation()).expect("fallback render");
        assert!(prompt.starts_with("[user]\nhi\n"));
        assert!(prompt.ends_with("[assistant]\n"));
    }

    #[test]
    fn stop_markers_follow_family() {
        assert!(PromptFamily::Qwen.stop_markers().contains(&"<|im_end|>"));
        assert!(PromptFamily::Unknown.stop_markers().is_empty());
    }
}
