//! Best-effort secret redaction for result text bound for an LLM transcript.

/// Redact obvious API-key shaped substrings (`sk-…`).
#[must_use]
pub fn redact_secrets(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == 's' {
            let mut lookahead = chars.clone();
            if lookahead.next() == Some('k') && lookahead.next() == Some('-') {
                chars.next();
                chars.next();
                output.push_str("sk-*******");
                while let Some(&next_ch) = chars.peek() {
                    if next_ch.is_whitespace() {
                        break;
                    }
                    chars.next();
                }
                continue;
            }
        }
        output.push(ch);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::redact_secrets;

    #[test]
    fn redacts_sk_keys() {
        let out = redact_secrets("token sk-proj-abc123 trailing");
        assert_eq!(out, "token sk-******* trailing");
    }

    #[test]
    fn leaves_ordinary_text_alone() {
        assert_eq!(redact_secrets("skim the task list"), "skim the task list");
    }
}
