//! `codegen` — deterministic Python scaffolds.
//!
//! Two payload shapes are accepted:
//! - `{lang, spec}` produces a single CLI script artifact (python only)
//! - `{idea, module}` produces a module plus a sanity test

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::tasks::handler::{TaskHandler, optional_text};

const SUPPORTED_LANGS: &[&str] = &["python"];

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9 _\-]").expect("valid pattern"));
static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ _\-]+").expect("valid pattern"));

/// File-name-safe slug; `app` when nothing usable remains.
fn slug(text: &str) -> String {
    let lower = text.to_lowercase();
    let kept = UNSAFE_CHARS.replace_all(&lower, "");
    let dashed = SEPARATORS.replace_all(&kept, "-");
    let trimmed = dashed.trim_matches('-');
    if trimmed.is_empty() {
        "app".to_string()
    } else {
        trimmed.to_string()
    }
}

fn python_cli(spec: &str, app: &str) -> String {
    format!(
        r#"#!/usr/bin/env python3
# hello from codegen: {spec}
from __future__ import annotations

import argparse

def main() -> int:
    parser = argparse.ArgumentParser(prog="{app}", description="{spec}")
    parser.add_argument("--name", default="world", help="Name to greet")
    args = parser.parse_args()
    print(f"Hello, {{args.name}}!")
    return 0

if __name__ == "__main__":
    raise SystemExit(main())
"#
    )
}

pub struct CodegenTask;

impl CodegenTask {
    fn from_spec(lang: &str, payload: &Value) -> Result<Value, TaskError> {
        let lang = lang.trim().to_lowercase();
        if !SUPPORTED_LANGS.contains(&lang.as_str()) {
            return Err(TaskError::InvalidPayload(format!(
                "unsupported lang: {lang} (supported: {})",
                SUPPORTED_LANGS.join(", ")
            )));
        }

        let spec = optional_text(payload, "spec")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "CLI app".to_string());
        let name = slug(&spec);
        let path = format!("generated/{name}.py");
        let code = python_cli(&spec, &name);

        Ok(json!({
            "ok": true,
            "agent": "codegen",
            "artifact": { "path": path, "language": lang, "code": code },
            "files": [{ "path": path, "content": code }],
        }))
    }

    fn from_idea(payload: &Value) -> Value {
        let idea = optional_text(payload, "idea")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "demo".to_string());
        let module = optional_text(payload, "module")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "hello_mod".to_string());

        json!({
            "ok": true,
            "agent": "codegen",
            "files": [
                {
                    "path": format!("src/{module}.py"),
                    "content": format!("def run():\n    return \"{idea} via {module}\"\n"),
                },
                {
                    "path": format!("tests/test_{module}.py"),
                    "content": "def test_sanity():\n    assert True\n",
                },
            ],
        })
    }
}

#[async_trait]
impl TaskHandler for CodegenTask {
    fn name(&self) -> &str {
        "codegen"
    }

    fn description(&self) -> &str {
        "Generate a small Python scaffold from a spec or an idea."
    }

    async fn execute(&self, payload: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
        ctx.checkpoint()?;
        match payload.get("lang") {
            Some(lang) => {
                let lang = lang.as_str().unwrap_or_default().to_string();
                Self::from_spec(&lang, &payload)
            }
            None => Ok(Self::from_idea(&payload)),
        }
    }
}
