pub mod assign;
pub mod delay;
pub mod fail;
pub mod log;

/// Replace `{path}` placeholders with context values.
///
/// Unknown paths are left as-is.
pub(crate) fn interpolate(template: &str, ctx: &procflow_core::ExecutionContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let path = &after[..close];
                match ctx.lookup(path) {
                    Some(serde_json::Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(path);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use procflow_core::ExecutionContext;

    #[test]
    fn test_interpolate() {
        let ctx = ExecutionContext::from_json(serde_json::json!({
            "user": {"name": "Ada"},
            "count": 3
        }));
        assert_eq!(
            interpolate("hi {user.name}, {count} new, {missing}", &ctx),
            "hi Ada, 3 new, {missing}"
        );
        assert_eq!(interpolate("unterminated {brace", &ctx), "unterminated {brace");
    }
}
