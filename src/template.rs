use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("undefined variable in template: {path}")]
    Undefined { path: String },
    #[error("unclosed placeholder starting at byte {at}")]
    Unclosed { at: usize },
    #[error("unknown filter `{name}`")]
    UnknownFilter { name: String },
    #[error("filter `{name}` requires an argument")]
    MissingFilterArg { name: String },
}

/// Render a `{{ path.to.var }}` template against a JSON context.
///
/// Paths are dot-separated object keys and numeric list indices. A small
/// filter whitelist is supported with `|`: `default:"fallback"`, `upper`,
/// `lower`. An undefined reference without a `default` filter is an error.
/// Placeholders never execute code; rendering an already-rendered string is
/// the identity as long as the output contains no `{{`.
pub fn render(template: &str, context: &Value) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        match rest.find("{{") {
            None => {
                output.push_str(rest);
                return Ok(output);
            }
            Some(open) => {
                output.push_str(&rest[..open]);
                let after_open = &rest[open + 2..];
                let close = after_open.find("}}").ok_or(TemplateError::Unclosed {
                    at: template.len() - rest.len() + open,
                })?;
                let expression = &after_open[..close];
                output.push_str(&evaluate(expression, context)?);
                rest = &after_open[close + 2..];
            }
        }
    }
}

fn evaluate(expression: &str, context: &Value) -> Result<String, TemplateError> {
    let mut parts = split_pipeline(expression);
    if parts.is_empty() {
        return Err(TemplateError::Undefined {
            path: expression.trim().to_string(),
        });
    }
    let path = parts.remove(0);
    let mut value = lookup(context, &path).map(value_to_string);

    for filter in parts {
        let (name, arg) = parse_filter(&filter)?;
        match name.as_str() {
            "default" => {
                let fallback = arg.ok_or(TemplateError::MissingFilterArg {
                    name: "default".into(),
                })?;
                if value.is_none() {
                    value = Some(fallback);
                }
            }
            "upper" => value = value.map(|current| current.to_uppercase()),
            "lower" => value = value.map(|current| current.to_lowercase()),
            other => {
                return Err(TemplateError::UnknownFilter {
                    name: other.to_string(),
                })
            }
        }
    }

    value.ok_or(TemplateError::Undefined { path })
}

/// Split `path | filter | filter:"arg"` on pipes outside of quotes.
fn split_pipeline(expression: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in expression.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '|' if !in_quotes => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts.retain(|part| !part.is_empty());
    parts
}

fn parse_filter(filter: &str) -> Result<(String, Option<String>), TemplateError> {
    match filter.split_once(':') {
        None => Ok((filter.trim().to_string(), None)),
        Some((name, raw_arg)) => {
            let arg = raw_arg.trim();
            let unquoted = arg
                .strip_prefix('"')
                .and_then(|inner| inner.strip_suffix('"'))
                .unwrap_or(arg);
            Ok((name.trim().to_string(), Some(unquoted.to_string())))
        }
    }
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    if current.is_null() {
        return None;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_nested_paths_and_indices() {
        let context = json!({
            "server": {"hostname": "web-1", "port": 22},
            "alert": {"labels": {"instance": "web-1:9100"}},
            "disks": ["sda", "sdb"],
        });
        assert_eq!(
            render("ssh {{server.hostname}}:{{server.port}}", &context).unwrap(),
            "ssh web-1:22"
        );
        assert_eq!(
            render("{{alert.labels.instance}}", &context).unwrap(),
            "web-1:9100"
        );
        assert_eq!(render("dev={{disks.1}}", &context).unwrap(), "dev=sdb");
    }

    #[test]
    fn undefined_reference_is_fatal() {
        let context = json!({"server": {"hostname": "web-1"}});
        let err = render("{{server.missing}}", &context).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Undefined {
                path: "server.missing".into()
            }
        );
    }

    #[test]
    fn default_filter_rescues_undefined() {
        let context = json!({});
        assert_eq!(
            render("{{ region | default:\"eu-west-1\" }}", &context).unwrap(),
            "eu-west-1"
        );
    }

    #[test]
    fn upper_and_lower_filters() {
        let context = json!({"name": "Nginx"});
        assert_eq!(render("{{ name | upper }}", &context).unwrap(), "NGINX");
        assert_eq!(render("{{ name | lower }}", &context).unwrap(), "nginx");
        assert_eq!(
            render("{{ missing | default:\"ok\" | upper }}", &context).unwrap(),
            "OK"
        );
    }

    #[test]
    fn unknown_filter_is_rejected() {
        let context = json!({"name": "x"});
        assert!(matches!(
            render("{{ name | shell }}", &context),
            Err(TemplateError::UnknownFilter { .. })
        ));
    }

    #[test]
    fn unclosed_placeholder_is_rejected() {
        let context = json!({});
        assert!(matches!(
            render("echo {{oops", &context),
            Err(TemplateError::Unclosed { .. })
        ));
    }

    #[test]
    fn rendering_is_idempotent_on_rendered_output() {
        let context = json!({"server": {"hostname": "web-1"}});
        let once = render("systemctl restart {{server.hostname}}", &context).unwrap();
        let twice = render(&once, &context).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn null_values_count_as_undefined() {
        let context = json!({"maybe": null});
        assert!(render("{{maybe}}", &context).is_err());
        assert_eq!(
            render("{{maybe | default:\"-\"}}", &context).unwrap(),
            "-"
        );
    }
}
