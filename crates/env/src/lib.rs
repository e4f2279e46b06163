/// Parse a positive (`> 0`) u64 env var.
#[must_use]
pub fn positive_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Expand `${VAR}` occurrences in a string using environment variables.
///
/// Missing variables expand to the empty string after a warning, so a config
/// file referencing an unset variable still loads.
#[must_use]
pub fn expand_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut start = 0usize;

    while let Some(dollar_pos) = result[start..].find("${") {
        let abs_pos = start + dollar_pos;
        let Some(end_pos) = result[abs_pos..].find('}') else {
            start = abs_pos + 2;
            continue;
        };
        let var_name = result[abs_pos + 2..abs_pos + end_pos].to_string();
        let var_value = match std::env::var(&var_name) {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    variable = %var_name,
                    "environment variable referenced in config is not set; expanding to empty"
                );
                String::new()
            }
        };
        result = format!(
            "{}{}{}",
            &result[..abs_pos],
            var_value,
            &result[abs_pos + end_pos + 1..]
        );
        start = abs_pos + var_value.len();
    }

    result
}
