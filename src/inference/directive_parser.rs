//! Invocation directives embedded in model output.
//!
//! The model asks for a tool by emitting a block like:
//!
//! ```text
//! <function_calls>
//! <invoke name="get_location">
//! <parameter name="employee_id">D0001</parameter>
//! </invoke>
//! </function_calls>
//! ```
//!
//! Parsing is two-stage: a lexer splits the text into the six marker kinds
//! plus plain text, then a small state machine assembles directives. Broken
//! spans are skipped; nothing here fails.

use serde::Serialize;

use crate::mcp_client::types::Arguments;

/// A procedure call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationDirective {
    pub procedure_name: String,
    /// Parameter values exactly as written, never coerced.
    pub arguments: Arguments,
}

// ─── Lexer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Text(&'a str),
    BlockOpen,
    BlockClose,
    InvokeOpen(&'a str),
    InvokeClose,
    ParamOpen(&'a str),
    ParamClose,
}

const BLOCK_OPEN: &str = "<function_calls>";
const BLOCK_CLOSE: &str = "</function_calls>";
const INVOKE_CLOSE: &str = "</invoke>";
const PARAM_CLOSE: &str = "</parameter>";

/// Split `text` into markers and the text between them. A `<` that does
/// not start a marker stays part of the surrounding text.
fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find('<') {
        let at = cursor + offset;
        match marker_at(&text[at..]) {
            Some((token, len)) => {
                if text_start < at {
                    tokens.push(Token::Text(&text[text_start..at]));
                }
                tokens.push(token);
                cursor = at + len;
                text_start = cursor;
            }
            None => cursor = at + 1,
        }
    }

    if text_start < text.len() {
        tokens.push(Token::Text(&text[text_start..]));
    }
    tokens
}

/// Recognise a marker at the start of `s`, returning it and its byte length.
fn marker_at(s: &str) -> Option<(Token<'_>, usize)> {
    for (literal, token) in [
        (BLOCK_OPEN, Token::BlockOpen),
        (BLOCK_CLOSE, Token::BlockClose),
        (INVOKE_CLOSE, Token::InvokeClose),
        (PARAM_CLOSE, Token::ParamClose),
    ] {
        if s.starts_with(literal) {
            return Some((token, literal.len()));
        }
    }

    if let Some((name, len)) = named_marker(s, "<invoke") {
        return Some((Token::InvokeOpen(name), len));
    }
    if let Some((name, len)) = named_marker(s, "<parameter") {
        return Some((Token::ParamOpen(name), len));
    }
    None
}

/// Parse `<tag name="value">`, tolerating extra whitespace and single quotes.
fn named_marker<'a>(s: &'a str, tag: &str) -> Option<(&'a str, usize)> {
    let rest = s.strip_prefix(tag)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start().strip_prefix("name")?;
    let rest = rest.trim_start().strip_prefix('=')?;
    let rest = rest.trim_start();

    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    let name = &rest[..end];
    if name.is_empty() || name.contains(['<', '>', '\n']) {
        return None;
    }

    let after = rest[end + 1..].trim_start().strip_prefix('>')?;
    Some((name, s.len() - after.len()))
}

// ─── Parser ──────────────────────────────────────────────────────────────────

/// Nested open state: a parameter implies an invoke, an invoke implies a
/// block.
#[derive(Default)]
struct Assembler<'a> {
    directives: Vec<InvocationDirective>,
    block: Option<Vec<InvocationDirective>>,
    invoke: Option<InvocationDirective>,
    param: Option<(&'a str, String)>,
}

impl<'a> Assembler<'a> {
    fn feed(&mut self, token: Token<'a>) {
        if let Some((name, mut value)) = self.param.take() {
            match token {
                Token::Text(text) => {
                    value.push_str(text);
                    self.param = Some((name, value));
                    return;
                }
                Token::ParamClose => {
                    if let Some(invoke) = self.invoke.as_mut() {
                        invoke.arguments.insert(name.to_string(), value);
                    }
                    return;
                }
                // Any other marker interrupts the parameter; it is dropped
                // and the marker handled normally.
                _ => tracing::debug!(parameter = name, "dropping unterminated parameter"),
            }
        }

        match token {
            Token::BlockOpen => {
                if self.block.is_some() {
                    tracing::debug!("skipping unclosed directive block");
                }
                self.invoke = None;
                self.block = Some(Vec::new());
            }
            Token::BlockClose => {
                if let Some(mut pending) = self.block.take() {
                    if let Some(open) = self.invoke.take() {
                        tracing::debug!(procedure = %open.procedure_name, "dropping unterminated invoke");
                    }
                    self.directives.append(&mut pending);
                }
            }
            Token::InvokeOpen(name) => {
                if self.block.is_some() {
                    if let Some(open) = self.invoke.take() {
                        tracing::debug!(procedure = %open.procedure_name, "dropping unterminated invoke");
                    }
                    self.invoke = Some(InvocationDirective {
                        procedure_name: name.to_string(),
                        arguments: Arguments::new(),
                    });
                }
            }
            Token::InvokeClose => {
                if let (Some(block), Some(invoke)) = (self.block.as_mut(), self.invoke.take()) {
                    block.push(invoke);
                }
            }
            Token::ParamOpen(name) => {
                if self.invoke.is_some() {
                    self.param = Some((name, String::new()));
                }
            }
            Token::ParamClose | Token::Text(_) => {}
        }
    }

    fn finish(self) -> Vec<InvocationDirective> {
        if self.block.is_some() {
            tracing::debug!("skipping unclosed directive block at end of response");
        }
        self.directives
    }
}

/// Every well-formed directive in `text`, in source order.
///
/// Directives from several blocks are flattened into one sequence. Returns
/// an empty vector when the text carries no markers.
pub fn extract_directives(text: &str) -> Vec<InvocationDirective> {
    let mut assembler = Assembler::default();
    for token in tokenize(text) {
        assembler.feed(token);
    }
    assembler.finish()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> Arguments {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_two_blocks_in_source_order() {
        let text = r#"Let me check both.
<function_calls>
<invoke name="get_weather">
<parameter name="city">Beijing</parameter>
<parameter name="unit">celsius</parameter>
</invoke>
</function_calls>
and then
<function_calls>
<invoke name="get_location">
<parameter name="employee_id">D0001</parameter>
</invoke>
</function_calls>"#;

        let directives = extract_directives(text);
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[0].procedure_name, "get_weather");
        assert_eq!(
            directives[0].arguments,
            args(&[("city", "Beijing"), ("unit", "celsius")])
        );
        assert_eq!(directives[1].procedure_name, "get_location");
        assert_eq!(directives[1].arguments, args(&[("employee_id", "D0001")]));
    }

    #[test]
    fn test_plain_text_has_no_directives() {
        assert!(extract_directives("The weather is fine, no tools needed.").is_empty());
        assert!(extract_directives("a < b and b > c").is_empty());
        assert!(extract_directives("").is_empty());
    }

    #[test]
    fn test_unclosed_block_skipped() {
        let text = r#"<function_calls>
<invoke name="get_weather">
<parameter name="city">Beijing</parameter>
</invoke>"#;
        assert!(extract_directives(text).is_empty());
    }

    #[test]
    fn test_unclosed_block_followed_by_good_block() {
        let text = r#"<function_calls><invoke name="broken">
<function_calls><invoke name="ok"></invoke></function_calls>"#;
        let directives = extract_directives(text);
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].procedure_name, "ok");
    }

    #[test]
    fn test_value_verbatim_with_angle_bracket() {
        let text = r#"<function_calls><invoke name="compare"><parameter name="expr">a < b && c</parameter><parameter name="n"> 42 </parameter></invoke></function_calls>"#;
        let directives = extract_directives(text);
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].arguments["expr"], "a < b && c");
        assert_eq!(directives[0].arguments["n"], " 42 ");
    }

    #[test]
    fn test_multiple_invokes_in_one_block() {
        let text = r#"<function_calls>
<invoke name="first"><parameter name="x">1</parameter></invoke>
<invoke name="second"></invoke>
</function_calls>"#;
        let names: Vec<_> = extract_directives(text)
            .into_iter()
            .map(|d| d.procedure_name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_unterminated_invoke_and_parameter_dropped() {
        let text = r#"<function_calls>
<invoke name="lost"><parameter name="x">1</parameter>
<invoke name="kept"><parameter name="y">2<parameter name="z">3</parameter></invoke>
</function_calls>"#;
        let directives = extract_directives(text);
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].procedure_name, "kept");
        assert_eq!(directives[0].arguments, args(&[("z", "3")]));
    }

    #[test]
    fn test_tolerant_attribute_spacing() {
        let text = "<function_calls><invoke  name = 'get_news' ><parameter name=\"q\">rust</parameter></invoke></function_calls>";
        let directives = extract_directives(text);
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].procedure_name, "get_news");
        assert_eq!(directives[0].arguments["q"], "rust");
    }

    #[test]
    fn test_markers_outside_block_ignored() {
        let text = r#"<invoke name="stray"><parameter name="a">b</parameter></invoke>"#;
        assert!(extract_directives(text).is_empty());
    }

    #[test]
    fn test_tokenize_keeps_non_marker_angle() {
        let tokens = tokenize("x <invoked> y");
        assert_eq!(tokens, vec![Token::Text("x <invoked> y")]);
    }
}
