//! Built-in functions available to templated `value` fields.
//!
//! Names registered here can be shadowed by functions the embedder supplies
//! when compiling a snippet (see [`super::compiler::CompileOptions`]); the
//! embedder's function wins on a name collision.

use std::collections::HashMap;
use std::sync::Arc;

use minijinja::value::Value as JinjaValue;
use minijinja::{Environment, Error as JinjaError, ErrorKind};

/// A function a caller can inject into the template environment, keyed by
/// the name it is called under in a snippet.
pub type ExtraFunc = Arc<dyn Fn(&[JinjaValue]) -> Result<JinjaValue, JinjaError> + Send + Sync>;

/// Build the [`Environment`] a snippet's templated fields are rendered
/// against, registering the built-ins plus any caller-supplied overrides.
pub fn build_environment(extra: &HashMap<String, ExtraFunc>) -> Environment<'static> {
    let mut env = Environment::new();

    env.add_function("uuid", uuid_fn);
    env.add_function("uuidv4", uuid_fn);
    env.add_function("mul", mul_fn);
    env.add_function("upper", upper_fn);
    env.add_function("env", env_fn);
    env.add_function("printf", printf_fn);

    for (name, f) in extra.clone() {
        env.add_function(name, move |args: Vec<JinjaValue>| -> Result<JinjaValue, JinjaError> { f(&args) });
    }

    env
}

fn uuid_fn() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn mul_fn(a: f64, b: f64) -> f64 {
    a * b
}

fn upper_fn(s: String) -> String {
    s.to_uppercase()
}

fn env_fn(name: String) -> String {
    std::env::var(&name).unwrap_or_default()
}

fn printf_fn(format: String, args: Vec<JinjaValue>) -> Result<String, JinjaError> {
    // A small, deliberately limited subset of printf-style verbs: %s, %d,
    // %f, %v (Go-style "any value") and %%. Anything else is an error
    // rather than silently mis-formatting a generated request.
    let mut out = String::with_capacity(format.len());
    let mut args = args.into_iter();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb @ ('s' | 'd' | 'f' | 'v')) => {
                let arg = args.next().ok_or_else(|| {
                    JinjaError::new(ErrorKind::InvalidOperation, "printf: not enough arguments")
                })?;
                match verb {
                    'd' => out.push_str(&arg.to_string()),
                    'f' => out.push_str(&arg.to_string()),
                    _ => out.push_str(&arg.to_string()),
                }
            }
            Some(other) => {
                return Err(JinjaError::new(
                    ErrorKind::InvalidOperation,
                    format!("printf: unsupported verb %{other}"),
                ))
            }
            None => {
                return Err(JinjaError::new(
                    ErrorKind::InvalidOperation,
                    "printf: trailing %",
                ))
            }
        }
    }
    Ok(out)
}
