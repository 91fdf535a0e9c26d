use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

use super::template::PromptFamily;
use super::{EngineError, EngineResult};

/// Looks for `<stem>.tokenizer.json` or `tokenizer.json` next to the model,
/// then in the working directory and `./models`.
pub(super) fn resolve_tokenizer_path(model_path: &Path) -> Option<PathBuf> {
    let parent = model_path.parent().unwrap_or(Path::new("."));
    let mut candidates = Vec::with_capacity(4);
    if let Some(stem) = model_path.file_stem().and_then(|s| s.to_str()) {
        candidates.push(parent.join(format!("{}.tokenizer.json", stem)));
    }
    candidates.push(parent.join("tokenizer.json"));
    candidates.push(PathBuf::from("tokenizer.json"));
    candidates.push(Path::new("models").join("tokenizer.json"));

    candidates.into_iter().find(|p| p.exists())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SpecialTokens {
    pub eos: u32,
    /// End of turn; equals `eos` for families without a dedicated token.
    pub eot: u32,
    pub bos_text: String,
    pub eos_text: String,
}

impl SpecialTokens {
    pub fn is_terminal(&self, token: u32) -> bool {
        token == self.eos || token == self.eot
    }
}

fn require(tokenizer: &Tokenizer, family: PromptFamily, names: &[&str]) -> EngineResult<(u32, String)> {
    names
        .iter()
        .find_map(|name| tokenizer.token_to_id(name).map(|id| (id, name.to_string())))
        .ok_or_else(|| {
            EngineError::ModelLoad(format!(
                "tokenizer/model incompatibility: {:?} needs one of {}",
                family,
                names.join(", ")
            ))
        })
}

fn text_of(tokenizer: &Tokenizer, names: &[&str]) -> String {
    names
        .iter()
        .find(|name| tokenizer.token_to_id(name).is_some())
        .map(|name| name.to_string())
        .unwrap_or_default()
}

pub(super) fn resolve_special_tokens(tokenizer: &Tokenizer, family: PromptFamily) -> EngineResult<SpecialTokens> {
    match family {
        PromptFamily::Llama => {
            let (eos, eos_text) = require(tokenizer, family, &["<|end_of_text|>", "</s>"])?;
            let (eot, _) = require(tokenizer, family, &["<|eot_id|>"])?;
            require(tokenizer, family, &["<|start_header_id|>"])?;
            require(tokenizer, family, &["<|end_header_id|>"])?;
            Ok(SpecialTokens {
                eos,
                eot,
                bos_text: text_of(tokenizer, &["<|begin_of_text|>", "<s>"]),
                eos_text,
            })
        }
        PromptFamily::Qwen => {
            let (eos, eos_text) = require(tokenizer, family, &["<|endoftext|>", "</s>"])?;
            let (eot, _) = require(tokenizer, family, &["<|im_end|>"])?;
            require(tokenizer, family, &["<|im_start|>"])?;
            Ok(SpecialTokens {
                eos,
                eot,
                bos_text: String::new(),
                eos_text,
            })
        }
        PromptFamily::Mistral => {
            let (eos, eos_text) = require(tokenizer, family, &["</s>", "<|end_of_text|>"])?;
            Ok(SpecialTokens {
                eos,
                eot: eos,
                bos_text: text_of(tokenizer, &["<s>"]),
                eos_text,
            })
        }
        PromptFamily::Unknown => {
            let names = ["<|end_of_text|>", "</s>", "<|endoftext|>"];
            let eos_text = text_of(tokenizer, &names);
            let eos = tokenizer.token_to_id(&eos_text).unwrap_or(2);
            Ok(SpecialTokens {
                eos,
                eot: eos,
                bos_text: text_of(tokenizer, &["<|begin_of_text|>", "<s>"]),
                eos_text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let dir = std::env::temp_dir().join(format!("nn-tok-{}-{}", tag, nanos));
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn model_specific_tokenizer_wins_over_shared_one() {
        let dir = scratch_dir("specific");
        let model = dir.join("qwen2-0.5b.gguf");
        fs::write(dir.join("tokenizer.json"), "{}").expect("write");
        assert_eq!(resolve_tokenizer_path(&model), Some(dir.join("tokenizer.json")));

        fs::write(dir.join("qwen2-0.5b.tokenizer.json"), "{}").expect("write");
        assert_eq!(resolve_tokenizer_path(&model), Some(dir.join("qwen2-0.5b.tokenizer.json")));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn terminal_tokens_cover_eos_and_eot() {
        let special = SpecialTokens {
            eos: 2,
            eot: 7,
            bos_text: "<s>".into(),
            eos_text: "</s>".into(),
        };
        assert!(special.is_terminal(2));
        assert!(special.is_terminal(7));
        assert!(!special.is_terminal(3));
    }
}
