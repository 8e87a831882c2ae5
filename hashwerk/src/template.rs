//! Templated artefacts.
//!
//! `template()` renders a mustache-style template (handlebars syntax) over
//! named substitutions, as an ordinary native funsie. The renderers are
//! pre-registered builtins, so workers can execute templates without any
//! user-side registration. The template and the optional env-var
//! indirection map travel as reserved inputs `__template__` and `__env__`.

use std::collections::BTreeMap;

use handlebars::Handlebars;

use crate::errors::Lifted;
use crate::registry::{NativeFn, NativeOutput};
use crate::serdes::Value;

/// Reserved input slot holding the template text.
pub const TEMPLATE_SLOT: &str = "__template__";
/// Reserved input slot holding the env-var indirection map.
pub const ENV_SLOT: &str = "__env__";

/// Registry name of the stripping renderer.
pub const RENDER_STRIPPED: &str = "template:render";
/// Registry name of the verbatim renderer.
pub const RENDER_RAW: &str = "template:render-raw";

fn as_text(value: &Value) -> Result<String, String> {
    match value {
        Value::Bytes(b) => Ok(String::from_utf8_lossy(b).into_owned()),
        Value::Json(serde_json::Value::String(s)) => Ok(s.clone()),
        Value::Json(other) => Err(format!("expected text, found {other}")),
    }
}

fn render(inputs: &BTreeMap<String, Lifted<Value>>, strip: bool) -> NativeOutput {
    let template = match inputs.get(TEMPLATE_SLOT) {
        Some(Ok(value)) => as_text(value)?,
        _ => return Err("template input is missing or errored".to_string()),
    };
    let env: Option<BTreeMap<String, String>> = match inputs.get(ENV_SLOT) {
        Some(Ok(Value::Json(v))) => {
            serde_json::from_value(v.clone()).map_err(|e| e.to_string())?
        }
        Some(Err(e)) => return Err(format!("env input errored: {:?}", e.kind)),
        _ => None,
    };

    let mut data = serde_json::Map::new();
    for (name, value) in inputs {
        if name == TEMPLATE_SLOT || name == ENV_SLOT {
            continue;
        }
        let value = match value {
            Ok(v) => v,
            Err(e) => return Err(format!("input {name} errored: {:?}", e.kind)),
        };
        let rendered = match value {
            Value::Bytes(b) => {
                let text = String::from_utf8_lossy(b).into_owned();
                serde_json::Value::String(if strip {
                    text.trim().to_string()
                } else {
                    text
                })
            }
            Value::Json(serde_json::Value::String(s)) => serde_json::Value::String(if strip {
                s.trim().to_string()
            } else {
                s.clone()
            }),
            Value::Json(other) => other.clone(),
        };
        data.insert(name.clone(), rendered);
    }
    if let Some(env) = env {
        for (name, var) in env {
            let value = std::env::var(&var)
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null);
            data.insert(name, value);
        }
    }

    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    let rendered = registry
        .render_template(&template, &serde_json::Value::Object(data))
        .map_err(|e| e.to_string())?;

    let mut out = BTreeMap::new();
    out.insert("out".to_string(), Value::Bytes(rendered.into_bytes()));
    Ok(out)
}

/// The built-in natives seeded into the registry.
pub(crate) fn builtin_natives() -> Vec<(String, NativeFn)> {
    vec![
        (
            RENDER_STRIPPED.to_string(),
            std::sync::Arc::new(|inputs: &BTreeMap<String, Lifted<Value>>| render(inputs, true))
                as NativeFn,
        ),
        (
            RENDER_RAW.to_string(),
            std::sync::Arc::new(|inputs: &BTreeMap<String, Lifted<Value>>| render(inputs, false))
                as NativeFn,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifted(template: &str, pairs: &[(&str, Value)]) -> BTreeMap<String, Lifted<Value>> {
        let mut map: BTreeMap<String, Lifted<Value>> = BTreeMap::new();
        map.insert(TEMPLATE_SLOT.to_string(), Ok(Value::from(template)));
        for (k, v) in pairs {
            map.insert((*k).to_string(), Ok(v.clone()));
        }
        map
    }

    #[test]
    fn substitutes_and_strips() {
        let inputs = lifted(
            "Hello {{who}}, count={{n}}!",
            &[
                ("who", Value::from("  world \n")),
                ("n", Value::from(3i64)),
            ],
        );
        let out = render(&inputs, true).unwrap();
        assert_eq!(out["out"], Value::Bytes(b"Hello world, count=3!".to_vec()));
    }

    #[test]
    fn raw_renderer_keeps_whitespace() {
        let inputs = lifted("[{{x}}]", &[("x", Value::from(" pad "))]);
        let out = render(&inputs, false).unwrap();
        assert_eq!(out["out"], Value::Bytes(b"[ pad ]".to_vec()));
    }

    #[test]
    fn env_indirection_reads_process_env() {
        std::env::set_var("HASHWERK_TEMPLATE_TEST", "from-env");
        let mut inputs = lifted("v={{v}}", &[]);
        inputs.insert(
            ENV_SLOT.to_string(),
            Ok(Value::Json(serde_json::json!({
                "v": "HASHWERK_TEMPLATE_TEST"
            }))),
        );
        let out = render(&inputs, true).unwrap();
        assert_eq!(out["out"], Value::Bytes(b"v=from-env".to_vec()));
    }

    #[test]
    fn missing_template_is_an_error() {
        let mut inputs: BTreeMap<String, Lifted<Value>> = BTreeMap::new();
        inputs.insert("x".to_string(), Ok(Value::from("y")));
        assert!(render(&inputs, true).is_err());
    }
}
