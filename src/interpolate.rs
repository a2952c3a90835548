//! Deploy-time substitution of `${VAR}` expressions.
//!
//! Supported forms:
//!
//!  - `${VAR}` and `$VAR`: the value of `VAR`. Unset *or empty* is an error.
//!  - `${VAR:-default}`: `default` when `VAR` is unset or empty.
//!  - `${VAR-default}`: `default` when `VAR` is unset.
//!  - `${VAR:?message}`: error with `message` when `VAR` is unset or empty.
//!  - `${VAR?message}`: error with `message` when `VAR` is unset.
//!  - `$$`: a literal `$`.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::errors::Error;

/// Name of the file deploy parameters are read from, next to the descriptor.
pub const DOTENV_FILE: &str = ".env";

/// A source of substitution variables.
pub trait ParameterSource {
    /// The value of `name`, or `None` when it is unset.
    fn get(&self, name: &str) -> Option<String>;
}

impl ParameterSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

impl ParameterSource for BTreeMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        BTreeMap::get(self, name).cloned()
    }
}

/// Process environment variables.
#[derive(Debug, Copy, Clone, Default)]
pub struct EnvParameters;

impl ParameterSource for EnvParameters {
    fn get(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

/// Several sources consulted in order; the first one that knows a variable wins.
#[derive(Default)]
pub struct Layered<'a> {
    layers: Vec<&'a dyn ParameterSource>,
}

impl<'a> Layered<'a> {
    /// An empty stack of sources.
    pub fn new() -> Self {
        Layered { layers: Vec::new() }
    }

    /// Add a source below the existing ones.
    pub fn with(mut self, source: &'a dyn ParameterSource) -> Self {
        self.layers.push(source);
        self
    }
}

impl fmt::Debug for Layered<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layered")
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl ParameterSource for Layered<'_> {
    fn get(&self, name: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(name))
    }
}

/// Parameters read from a `.env` style file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DotEnv {
    values: BTreeMap<String, String>,
}

impl DotEnv {
    /// Read `dir/.env`. A missing file yields no parameters.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<DotEnv, Error> {
        let path = dir.as_ref().join(DOTENV_FILE);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                debug!("reading deploy parameters from {}", path.display());
                DotEnv::parse(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DotEnv::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse `KEY=value` lines. Blank lines, `#` comments and an `export ` prefix are ignored;
    /// values may be wrapped in single or double quotes.
    pub fn parse(contents: &str) -> Result<DotEnv, Error> {
        let mut values = BTreeMap::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::InvalidParameter {
                    parameter: format!("{DOTENV_FILE}:{}", idx + 1),
                    message: format!("expected KEY=value, found `{line}`"),
                });
            };
            let value = value.trim();
            let value = unquote(value, '"')
                .or_else(|| unquote(value, '\''))
                .unwrap_or_else(|| value.split(" #").next().unwrap_or(value).trim_end());
            values.insert(key.trim().to_owned(), value.to_owned());
        }
        Ok(DotEnv { values })
    }
}

fn unquote(value: &str, quote: char) -> Option<&str> {
    value
        .strip_prefix(quote)
        .and_then(|v| v.strip_suffix(quote))
}

impl ParameterSource for DotEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Substitute every expression in `template`. `field` names the descriptor location for error
/// messages.
pub fn interpolate(
    template: &str,
    field: &str,
    source: &dyn ParameterSource,
) -> Result<String, Error> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = closing_brace(body).ok_or_else(|| Error::InvalidSubstitution {
                field: field.to_owned(),
                message: format!("unterminated `${{` in `{template}`"),
            })?;
            out.push_str(&expand(&body[..end], field, source)?);
            rest = &body[end + 1..];
        } else {
            let len = name_len(after);
            if len == 0 {
                out.push('$');
                rest = after;
            } else {
                out.push_str(&lookup(&after[..len], field, source)?);
                rest = &after[len..];
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

// Position of the `}` closing an expression, skipping nested `${...}` in defaults.
fn closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                depth += 1;
                i += 1;
            }
            b'}' if depth == 0 => return Some(i),
            b'}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    None
}

fn name_len(s: &str) -> usize {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return 0,
    }
    chars
        .find(|(_, c)| !(*c == '_' || c.is_ascii_alphanumeric()))
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

fn lookup(name: &str, field: &str, source: &dyn ParameterSource) -> Result<String, Error> {
    match source.get(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::MissingConfiguration {
            variable: name.to_owned(),
            field: field.to_owned(),
        }),
    }
}

fn expand(expr: &str, field: &str, source: &dyn ParameterSource) -> Result<String, Error> {
    let len = name_len(expr);
    if len == 0 {
        return Err(Error::InvalidSubstitution {
            field: field.to_owned(),
            message: format!("invalid variable name in `${{{expr}}}`"),
        });
    }
    let (name, modifier) = expr.split_at(len);
    let value = source.get(name);

    let (op, arg) = if let Some(arg) = modifier.strip_prefix(":-") {
        (":-", arg)
    } else if let Some(arg) = modifier.strip_prefix(":?") {
        (":?", arg)
    } else if let Some(arg) = modifier.strip_prefix('-') {
        ("-", arg)
    } else if let Some(arg) = modifier.strip_prefix('?') {
        ("?", arg)
    } else if modifier.is_empty() {
        return lookup(name, field, source);
    } else {
        return Err(Error::InvalidSubstitution {
            field: field.to_owned(),
            message: format!("unsupported modifier in `${{{expr}}}`"),
        });
    };

    let missing = match op {
        ":-" | ":?" => value.as_deref().map_or(true, str::is_empty),
        _ => value.is_none(),
    };

    match (op, missing) {
        (_, false) => Ok(value.unwrap_or_default()),
        (":-" | "-", true) => interpolate(arg, field, source),
        (_, true) => Err(Error::MissingConfiguration {
            variable: name.to_owned(),
            field: if arg.is_empty() {
                field.to_owned()
            } else {
                format!("{field}: {arg}")
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_braced_and_bare_names() {
        let p = params(&[("SUBDOMAIN", "flows"), ("DOMAIN_NAME", "example.com")]);
        assert_eq!(
            interpolate("https://${SUBDOMAIN}.$DOMAIN_NAME/", "f", &p).unwrap(),
            "https://flows.example.com/"
        );
    }

    #[test]
    fn unset_and_empty_variables_fail() {
        let p = params(&[("EMPTY", "")]);
        for template in ["${UNSET}", "$UNSET", "${EMPTY}", "x-${EMPTY}-y"] {
            match interpolate(template, "services.n8n.environment.N8N_HOST", &p) {
                Err(Error::MissingConfiguration { field, .. }) => {
                    assert_eq!(field, "services.n8n.environment.N8N_HOST")
                }
                other => panic!("{template}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn defaults_follow_compose_semantics() {
        let p = params(&[("EMPTY", ""), ("TZ", "Europe/Berlin")]);
        assert_eq!(interpolate("${UNSET:-UTC}", "f", &p).unwrap(), "UTC");
        assert_eq!(interpolate("${EMPTY:-UTC}", "f", &p).unwrap(), "UTC");
        assert_eq!(interpolate("${EMPTY-UTC}", "f", &p).unwrap(), "");
        assert_eq!(interpolate("${UNSET-UTC}", "f", &p).unwrap(), "UTC");
        assert_eq!(interpolate("${TZ:-UTC}", "f", &p).unwrap(), "Europe/Berlin");
        assert_eq!(
            interpolate("${UNSET:-${TZ}}", "f", &p).unwrap(),
            "Europe/Berlin"
        );
    }

    #[test]
    fn required_with_message() {
        let p = params(&[]);
        match interpolate("${DOMAIN_NAME:?set the public domain}", "f", &p) {
            Err(Error::MissingConfiguration { variable, field }) => {
                assert_eq!(variable, "DOMAIN_NAME");
                assert_eq!(field, "f: set the public domain");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn escapes_and_literals() {
        let p = params(&[]);
        assert_eq!(interpolate("cost: $$5", "f", &p).unwrap(), "cost: $5");
        assert_eq!(interpolate("a $ b", "f", &p).unwrap(), "a $ b");
        assert_eq!(interpolate("no vars", "f", &p).unwrap(), "no vars");
    }

    #[test]
    fn malformed_expressions() {
        let p = params(&[("A", "1")]);
        assert!(matches!(
            interpolate("${A", "f", &p),
            Err(Error::InvalidSubstitution { .. })
        ));
        assert!(matches!(
            interpolate("${A+x}", "f", &p),
            Err(Error::InvalidSubstitution { .. })
        ));
        assert!(matches!(
            interpolate("${}", "f", &p),
            Err(Error::InvalidSubstitution { .. })
        ));
    }

    #[test]
    fn dotenv_parsing() {
        let env = DotEnv::parse(
            "# deploy\nSUBDOMAIN=flows\nexport DOMAIN_NAME=\"example.com\"\n\nGENERIC_TIMEZONE='Europe/Berlin'\nNOTE=plain # trailing\n",
        )
        .unwrap();
        assert_eq!(env.get("SUBDOMAIN").as_deref(), Some("flows"));
        assert_eq!(env.get("DOMAIN_NAME").as_deref(), Some("example.com"));
        assert_eq!(env.get("GENERIC_TIMEZONE").as_deref(), Some("Europe/Berlin"));
        assert_eq!(env.get("NOTE").as_deref(), Some("plain"));

        assert!(DotEnv::parse("JUSTAKEY\n").is_err());
    }

    #[test]
    fn layered_sources_prefer_the_first() {
        let top = params(&[("A", "top")]);
        let bottom = params(&[("A", "bottom"), ("B", "bottom")]);
        let layered = Layered::new().with(&top).with(&bottom);
        assert_eq!(layered.get("A").as_deref(), Some("top"));
        assert_eq!(layered.get("B").as_deref(), Some("bottom"));
        assert_eq!(layered.get("C"), None);
    }
}
