//! REST path templates.
//!
//! Templates like `/v1/resources/{id}/items/{item-id}` are compiled into
//! anchored regexes with named groups. A [`RouteSet`] keeps compiled routes
//! in insertion order and answers the first method + path match, which is
//! how both the REST dialect and the gateway route tables resolve requests.

use std::collections::HashMap;

use axum::http::Method;
use regex::Regex;

use nimbus_core::EmulatorError;

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    template: String,
    regex: Regex,
    param_names: Vec<String>,
}

impl PathTemplate {
    /// Compile a template. `{name}` matches one segment; `{name+}` matches
    /// greedily across segments (catch-all proxy routes).
    pub fn compile(template: &str) -> Result<Self, EmulatorError> {
        let mut pattern = String::from("^");
        let mut param_names = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let (literal, tail) = rest.split_at(open);
            pattern.push_str(&regex::escape(literal));
            let Some(close) = tail.find('}') else {
                return Err(EmulatorError::Validation(format!(
                    "unclosed template variable in {template}"
                )));
            };
            let raw_name = &tail[1..close];
            let (name, greedy) = match raw_name.strip_suffix('+') {
                Some(name) => (name, true),
                None => (raw_name, false),
            };
            if name.is_empty() {
                return Err(EmulatorError::Validation(format!(
                    "empty template variable in {template}"
                )));
            }
            // Group names must be identifiers; remember the original.
            let group = format!("p{}", param_names.len());
            if greedy {
                pattern.push_str(&format!("(?P<{group}>.+)"));
            } else {
                pattern.push_str(&format!("(?P<{group}>[^/]+)"));
            }
            param_names.push(name.to_string());
            rest = &tail[close + 1..];
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|err| EmulatorError::Validation(format!("bad template {template}: {err}")))?;
        Ok(Self {
            template: template.to_string(),
            regex,
            param_names,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Match a concrete path, returning the extracted variables.
    pub fn captures(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(path)?;
        let mut params = HashMap::with_capacity(self.param_names.len());
        for (i, name) in self.param_names.iter().enumerate() {
            if let Some(m) = caps.name(&format!("p{i}")) {
                params.insert(name.clone(), m.as_str().to_string());
            }
        }
        Some(params)
    }
}

/// Ordered method + template route table carrying an arbitrary payload.
pub struct RouteSet<T> {
    routes: Vec<(Method, PathTemplate, T)>,
}

impl<T> Default for RouteSet<T> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<T> RouteSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        method: Method,
        template: &str,
        payload: T,
    ) -> Result<(), EmulatorError> {
        let compiled = PathTemplate::compile(template)?;
        self.routes.push((method, compiled, payload));
        Ok(())
    }

    /// First route whose method and path match, in insertion order.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<(&T, HashMap<String, String>)> {
        for (route_method, template, payload) in &self.routes {
            if route_method != method {
                continue;
            }
            if let Some(params) = template.captures(path) {
                return Some((payload, params));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Method, &PathTemplate, &T)> {
        self.routes.iter().map(|(m, t, p)| (m, t, p))
    }
}
