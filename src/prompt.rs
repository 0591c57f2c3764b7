//! Prompt registry (SPEC_FULL.md §4.11): atomically-reloadable named prompt
//! templates with an identity (`name`, `version`, `fingerprint`) propagated
//! into request metadata for client-visible cache-busting.
//!
//! The real template renderer is an external collaborator per the distilled
//! spec (§1 Out of scope); this implements the trivial `{{var}}`-substitution
//! engine the spec calls for, since the contract that matters here is
//! identity propagation, not template expressiveness.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// A prompt template plus its version tag, read from a built-in default or a
/// `GATEWAY_PROMPT_DIR` override file named `<name>.txt`.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub version: String,
    pub text: String,
}

/// Rendered prompt text plus the identity carried into `Request.metadata`
/// (SPEC_FULL.md §4.3 step 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub name: String,
    pub version: String,
    pub fingerprint: String,
    pub text: String,
}

fn fingerprint(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Substitutes `{{var}}` placeholders in `template` with values from `data`.
/// Unknown placeholders are left verbatim — the caller decides whether that's
/// an error; this engine only ever substitutes what it's given.
pub fn render(template: &str, data: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let Some(start) = rest.find("{{") else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            break;
        };
        let key = after_open[..end].trim();
        match data.get(key) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(key);
                out.push_str("}}");
            }
        }
        rest = &after_open[end + 2..];
    }
    out
}

/// Read-mostly collection of [`PromptTemplate`]s, swapped atomically on
/// [`PromptRegistry::reload`] so concurrent renders never observe a torn set.
pub struct PromptRegistry {
    templates: ArcSwap<HashMap<String, PromptTemplate>>,
    override_dir: Option<std::path::PathBuf>,
}

impl PromptRegistry {
    pub fn new(override_dir: Option<String>) -> Self {
        let registry = Self {
            templates: ArcSwap::from_pointee(HashMap::new()),
            override_dir: override_dir.map(std::path::PathBuf::from),
        };
        registry.reload();
        registry
    }

    fn builtin_templates() -> HashMap<String, PromptTemplate> {
        HashMap::from([
            (
                "chat_system".to_string(),
                PromptTemplate {
                    name: "chat_system".to_string(),
                    version: "v1".to_string(),
                    text: "You are a helpful assistant with access to tools. \
                        Use them when they would help answer the user accurately."
                        .to_string(),
                },
            ),
            (
                "tool_limit_finalizer".to_string(),
                PromptTemplate {
                    name: "tool_limit_finalizer".to_string(),
                    version: "v1".to_string(),
                    text: "You have used {{limit}} consecutive tool calls without reaching a \
                        final answer. Stop calling tools and respond to the user now with your \
                        best complete answer based on what you have already gathered."
                        .to_string(),
                },
            ),
        ])
    }

    /// Re-reads override files from `override_dir` (if configured) over the
    /// built-in defaults and atomically swaps in the merged set. Readers
    /// observe either the old or the new set consistently per-render — never
    /// a torn mix of the two.
    pub fn reload(&self) {
        let mut templates = Self::builtin_templates();
        if let Some(dir) = &self.override_dir {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                        continue;
                    }
                    let Some(name) = path.file_stem().and_then(|s| s.to_str()) else { continue };
                    if let Ok(text) = std::fs::read_to_string(&path) {
                        templates.insert(
                            name.to_string(),
                            PromptTemplate {
                                name: name.to_string(),
                                version: "override".to_string(),
                                text,
                            },
                        );
                    }
                }
            }
        }
        self.templates.store(Arc::new(templates));
    }

    /// Renders `name` with `data`; an unknown name or an empty template both
    /// produce an empty [`RenderedPrompt`] with empty text — callers (the
    /// request builder) treat empty text as "leave messages unchanged"
    /// (SPEC_FULL.md §4.3 step 3).
    pub fn render(&self, name: &str, data: &HashMap<String, String>) -> RenderedPrompt {
        let templates = self.templates.load();
        match templates.get(name) {
            Some(template) => {
                let text = render(&template.text, data);
                RenderedPrompt {
                    name: template.name.clone(),
                    version: template.version.clone(),
                    fingerprint: fingerprint(&text),
                    text,
                }
            }
            None => RenderedPrompt {
                name: name.to_string(),
                version: String::new(),
                fingerprint: String::new(),
                text: String::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholders() {
        let mut data = HashMap::new();
        data.insert("limit".to_string(), "4".to_string());
        assert_eq!(render("limit is {{limit}}", &data), "limit is 4");
    }

    #[test]
    fn leaves_unknown_placeholders_verbatim() {
        let data = HashMap::new();
        assert_eq!(render("hello {{name}}", &data), "hello {{name}}");
    }

    #[test]
    fn renders_builtin_chat_system_prompt() {
        let registry = PromptRegistry::new(None);
        let rendered = registry.render("chat_system", &HashMap::new());
        assert_eq!(rendered.name, "chat_system");
        assert_eq!(rendered.version, "v1");
        assert!(!rendered.fingerprint.is_empty());
        assert!(!rendered.text.is_empty());
    }

    #[test]
    fn unknown_prompt_renders_empty() {
        let registry = PromptRegistry::new(None);
        let rendered = registry.render("does_not_exist", &HashMap::new());
        assert!(rendered.text.is_empty());
    }

    #[test]
    fn same_text_yields_same_fingerprint() {
        let registry = PromptRegistry::new(None);
        let a = registry.render("chat_system", &HashMap::new());
        let b = registry.render("chat_system", &HashMap::new());
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn override_dir_shadows_builtin_on_reload() {
        let dir = tempfile::tempdir().expect("creating a temp dir for a prompt override");
        std::fs::write(dir.path().join("chat_system.txt"), "overridden prompt text")
            .expect("writing the override file");
        let registry = PromptRegistry::new(Some(dir.path().to_string_lossy().to_string()));
        let rendered = registry.render("chat_system", &HashMap::new());
        assert_eq!(rendered.text, "overridden prompt text");
        assert_eq!(rendered.version, "override");

        std::fs::remove_file(dir.path().join("chat_system.txt")).expect("removing the override file");
        registry.reload();
        let rendered = registry.render("chat_system", &HashMap::new());
        assert_eq!(rendered.version, "v1");
    }
}
