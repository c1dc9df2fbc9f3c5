/// Parse a positive (`> 0`) u64 env var.
#[must_use]
pub fn positive_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

fn is_var_start(b: u8) -> bool {
    b.is_ascii_uppercase() || b == b'_'
}

fn is_var_cont(b: u8) -> bool {
    b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_'
}

fn is_var_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match bytes.split_first() {
        Some((first, rest)) => is_var_start(*first) && rest.iter().copied().all(is_var_cont),
        None => false,
    }
}

/// Expand `${NAME}` and `$NAME` references in a string using environment
/// variables.
///
/// `NAME` must match `[A-Z_][A-Z0-9_]*`. An unset variable expands to the
/// empty string. Text that does not form a valid reference (lowercase names,
/// an unclosed `${`, a bare `$`) is preserved literally.
#[must_use]
pub fn expand_str(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' {
            // `${NAME}` form.
            if bytes.get(i + 1) == Some(&b'{') {
                if let Some(close) = input[i + 2..].find('}') {
                    let name = &input[i + 2..i + 2 + close];
                    if is_var_name(name) {
                        out.push_str(&std::env::var(name).unwrap_or_default());
                        i += close + 3;
                        continue;
                    }
                }
            } else {
                // Bare `$NAME` form.
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() {
                    let b = bytes[end];
                    let ok = if end == start {
                        is_var_start(b)
                    } else {
                        is_var_cont(b)
                    };
                    if !ok {
                        break;
                    }
                    end += 1;
                }
                if end > start {
                    out.push_str(&std::env::var(&input[start..end]).unwrap_or_default());
                    i = end;
                    continue;
                }
            }
        }

        if let Some(ch) = input[i..].chars().next() {
            out.push(ch);
            i += ch.len_utf8();
        } else {
            break;
        }
    }

    out
}

/// Recursively expand env references in every string leaf of a JSON value.
///
/// Object keys, numbers, booleans, and nulls are preserved byte-for-byte;
/// arrays and nested objects are expanded in place.
#[must_use]
pub fn expand_json(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(expand_str(&s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(expand_json).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter().map(|(k, v)| (k, expand_json(v))).collect(),
        ),
        other => other,
    }
}

pub mod serde_helpers {
    use super::expand_str;
    use serde::{Deserialize, Deserializer};

    /// Deserialize `Option<u64>` that may reference `${ENV}` inside a string.
    ///
    /// Supported JSON forms: `null`, number, or string.
    ///
    /// # Errors
    ///
    /// Returns an error when the value is not a number/string, or when the
    /// expanded string does not parse as `u64`.
    pub fn deserialize_option_u64_env<'de, D>(
        deserializer: D,
    ) -> std::result::Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as DeError;

        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        match value {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| D::Error::custom("expected unsigned integer")),
            Some(serde_json::Value::String(s)) => {
                let expanded = expand_str(&s);
                let expanded = expanded.trim();
                let n = expanded.parse::<u64>().map_err(|e| {
                    D::Error::custom(format!("expected unsigned integer, got '{expanded}': {e}"))
                })?;
                Ok(Some(n))
            }
            Some(other) => Err(D::Error::custom(format!(
                "expected unsigned integer or string, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Env-var mutation is process-global; each test uses a unique name and
    // cleans up after itself.
    fn with_var<T>(name: &str, value: &str, f: impl FnOnce() -> T) -> T {
        unsafe {
            std::env::set_var(name, value);
        }
        let out = f();
        unsafe {
            std::env::remove_var(name);
        }
        out
    }

    #[test]
    fn braced_reference_expands() {
        with_var("MCPHUB_ENV_TEST_BRACED", "ctx7sk-abc", || {
            assert_eq!(expand_str("${MCPHUB_ENV_TEST_BRACED}"), "ctx7sk-abc");
            assert_eq!(expand_str("k=${MCPHUB_ENV_TEST_BRACED}!"), "k=ctx7sk-abc!");
        });
    }

    #[test]
    fn bare_reference_expands() {
        with_var("MCPHUB_ENV_TEST_BARE", "v1", || {
            assert_eq!(expand_str("$MCPHUB_ENV_TEST_BARE"), "v1");
            assert_eq!(expand_str("a/$MCPHUB_ENV_TEST_BARE/b"), "a/v1/b");
        });
    }

    #[test]
    fn unset_variable_expands_to_empty() {
        assert_eq!(expand_str("${MCPHUB_ENV_TEST_DEFINITELY_UNSET}"), "");
        assert_eq!(expand_str("x$MCPHUB_ENV_TEST_DEFINITELY_UNSET-y"), "x-y");
    }

    #[test]
    fn invalid_references_stay_literal() {
        assert_eq!(expand_str("$lower_case"), "$lower_case");
        assert_eq!(expand_str("${not-a-name}"), "${not-a-name}");
        assert_eq!(expand_str("${UNCLOSED"), "${UNCLOSED");
        assert_eq!(expand_str("100$"), "100$");
        assert_eq!(expand_str("$"), "$");
    }

    #[test]
    fn bare_name_stops_at_non_name_byte() {
        with_var("MCPHUB_ENV_TEST_STOP", "end", || {
            assert_eq!(expand_str("$MCPHUB_ENV_TEST_STOP."), "end.");
            assert_eq!(expand_str("$MCPHUB_ENV_TEST_STOPX"), "");
        });
    }

    #[test]
    fn json_expansion_preserves_non_string_leaves() {
        with_var("MCPHUB_ENV_TEST_JSON", "secret", || {
            let value = json!({
                "headers": { "Authorization": "Bearer ${MCPHUB_ENV_TEST_JSON}" },
                "timeout": 30,
                "enabled": true,
                "note": null,
                "args": ["--key", "${MCPHUB_ENV_TEST_JSON}"],
            });
            let expanded = expand_json(value);
            assert_eq!(
                expanded,
                json!({
                    "headers": { "Authorization": "Bearer secret" },
                    "timeout": 30,
                    "enabled": true,
                    "note": null,
                    "args": ["--key", "secret"],
                })
            );
        });
    }
}
