//! Shell quoting for rendered step commands.

/// Wrap `value` in double quotes so `${VAR}` references still expand.
///
/// Backslashes, double quotes and backticks are escaped. `$` is left alone
/// since rendered fields carry environment references on purpose.
pub fn dquote(value: &str) -> String {
  let mut out = String::with_capacity(value.len() + 2);
  out.push('"');
  for c in value.chars() {
    if matches!(c, '"' | '\\' | '`') {
      out.push('\\');
    }
    out.push(c);
  }
  out.push('"');
  out
}

/// Wrap `value` in single quotes. Nothing inside is expanded.
pub fn squote(value: &str) -> String {
  format!("'{}'", value.replace('\'', r"'\''"))
}
