//! Message templates and rendering.
//!
//! A template body is a JSON object whose string values may contain
//! `{{key}}` placeholders. Rendering substitutes placeholders with the job
//! context layered over the template defaults, then parses the result back
//! into a JSON object.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DomainError, DomainResult};

/// Locale used when a user's locale has no dedicated template.
pub const FALLBACK_LOCALE: &str = "en";

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// A localized message template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub locale: String,
    #[serde(default)]
    pub defaults: Map<String, Value>,
    pub body: Map<String, Value>,
}

impl Template {
    pub fn new(name: impl Into<String>, locale: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            locale: locale.into().to_lowercase(),
            defaults: Map::new(),
            body,
        }
    }

    pub fn with_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Render this template with `context` layered over its defaults.
    pub fn render(&self, context: &Map<String, Value>) -> DomainResult<Map<String, Value>> {
        render(&self.body, &self.defaults, context)
    }
}

/// Templates of a job, indexed by name then locale.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    by_name: HashMap<String, HashMap<String, Template>>,
    names: Vec<String>,
}

impl TemplateCatalog {
    /// Build a catalog for `names` out of the loaded templates.
    ///
    /// Every requested name must have at least one locale.
    pub fn build(names: &[&str], templates: Vec<Template>) -> DomainResult<Self> {
        let mut by_name: HashMap<String, HashMap<String, Template>> = HashMap::new();
        for template in templates {
            by_name
                .entry(template.name.clone())
                .or_default()
                .insert(template.locale.to_lowercase(), template);
        }
        for name in names {
            if by_name.get(*name).is_none_or(HashMap::is_empty) {
                return Err(DomainError::template(format!(
                    "no templates were found with name {name}"
                )));
            }
        }
        Ok(Self {
            by_name,
            names: names.iter().map(|n| n.to_string()).collect(),
        })
    }

    /// Pick one of the catalog's template names at random.
    pub fn pick_name<R: Rng + ?Sized>(&self, rng: &mut R) -> DomainResult<&str> {
        match self.names.len() {
            0 => Err(DomainError::template("no template names configured")),
            1 => Ok(&self.names[0]),
            n => Ok(&self.names[rng.gen_range(0..n)]),
        }
    }

    /// Resolve the template for `locale`, falling back to `en`.
    pub fn for_locale(&self, name: &str, locale: &str) -> DomainResult<&Template> {
        let locales = self
            .by_name
            .get(name)
            .ok_or_else(|| DomainError::template(format!("no templates were found with name {name}")))?;
        locales
            .get(&locale.to_lowercase())
            .or_else(|| locales.get(FALLBACK_LOCALE))
            .ok_or_else(|| {
                DomainError::template(format!(
                    "there is no template {name} for locale '{locale}' or '{FALLBACK_LOCALE}'"
                ))
            })
    }
}

/// Substitute `{{key}}` placeholders in `text`.
///
/// Missing keys render as empty strings. Unterminated placeholders are kept
/// verbatim.
pub fn substitute(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        match after.find(CLOSE) {
            Some(end) => {
                let key = after[..end].trim();
                out.push_str(&lookup(key).unwrap_or_default());
                rest = &after[end + CLOSE.len()..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render a template body with `context` overriding `defaults`.
///
/// Substitution happens on the JSON text of the body, so values are escaped
/// for inclusion inside a JSON string literal.
pub fn render(
    body: &Map<String, Value>,
    defaults: &Map<String, Value>,
    context: &Map<String, Value>,
) -> DomainResult<Map<String, Value>> {
    let text = serde_json::to_string(body)
        .map_err(|e| DomainError::template(format!("failed to serialize body: {e}")))?;

    let rendered = substitute(&text, |key| {
        context
            .get(key)
            .or_else(|| defaults.get(key))
            .map(json_escaped)
    });

    serde_json::from_str(&rendered)
        .map_err(|e| DomainError::template(format!("rendered template is not a json object: {e}")))
}

fn json_escaped(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    let quoted = Value::String(raw).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn context_wins_over_defaults() {
        let body = obj(json!({"alert": "{{user}} has {{count}} gifts"}));
        let defaults = obj(json!({"user": "someone", "count": 1}));
        let context = obj(json!({"user": "Ana"}));

        let rendered = render(&body, &defaults, &context).unwrap();
        assert_eq!(rendered["alert"], "Ana has 1 gifts");
    }

    #[test]
    fn missing_keys_render_empty() {
        let rendered = render(&obj(json!({"alert": "hi {{name}}!"})), &Map::new(), &Map::new()).unwrap();
        assert_eq!(rendered["alert"], "hi !");
    }

    #[test]
    fn substituted_quotes_do_not_break_json() {
        let context = obj(json!({"name": "the \"boss\""}));
        let rendered = render(&obj(json!({"alert": "{{name}}"})), &Map::new(), &context).unwrap();
        assert_eq!(rendered["alert"], "the \"boss\"");
    }

    #[test]
    fn unterminated_placeholder_is_kept() {
        assert_eq!(substitute("a {{b", |_| Some("x".into())), "a {{b");
    }

    #[test]
    fn locale_falls_back_to_en() {
        let en = Template::new("welcome", "en", obj(json!({"alert": "hi"})));
        let pt = Template::new("welcome", "PT", obj(json!({"alert": "oi"})));
        let catalog = TemplateCatalog::build(&["welcome"], vec![en, pt]).unwrap();

        assert_eq!(catalog.for_locale("welcome", "pt").unwrap().body["alert"], "oi");
        assert_eq!(catalog.for_locale("welcome", "fr").unwrap().body["alert"], "hi");
    }

    #[test]
    fn missing_locale_without_fallback_is_an_error() {
        let pt = Template::new("welcome", "pt", obj(json!({"alert": "oi"})));
        let catalog = TemplateCatalog::build(&["welcome"], vec![pt]).unwrap();
        assert!(matches!(
            catalog.for_locale("welcome", "fr"),
            Err(DomainError::Template(_))
        ));
    }

    #[test]
    fn unknown_template_name_fails_the_catalog() {
        let err = TemplateCatalog::build(&["nope"], vec![]).unwrap_err();
        assert_eq!(
            err,
            DomainError::Template("no templates were found with name nope".into())
        );
    }

    #[test]
    fn pick_name_covers_every_template() {
        let a = Template::new("a", "en", Map::new());
        let b = Template::new("b", "en", Map::new());
        let catalog = TemplateCatalog::build(&["a", "b"], vec![a, b]).unwrap();
        let mut rng = rand::thread_rng();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(catalog.pick_name(&mut rng).unwrap().to_string());
        }
        assert_eq!(seen.len(), 2);
    }
}
