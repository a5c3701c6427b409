use crate::types::Token;

pub const ESCAPE: u8 = b'^';
pub const QUOTE: u8 = b'"';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
	/// `&&`
	And,
	/// `||`
	Or,
	/// `&`
	Background,
	/// `&!`: background with output captured into process buffers.
	BackgroundBuffered,
	/// `&!!`: background, detached into a session of its own.
	BackgroundDetached,
	/// `|`
	Pipe,
	/// `;`
	Sequence,
}

impl Operator {
	pub fn as_str(self) -> &'static str {
		match self {
			Operator::And => "&&",
			Operator::Or => "||",
			Operator::Background => "&",
			Operator::BackgroundBuffered => "&!",
			Operator::BackgroundDetached => "&!!",
			Operator::Pipe => "|",
			Operator::Sequence => ";",
		}
	}

	pub fn is_background(self) -> bool {
		matches!(self, Operator::Background | Operator::BackgroundBuffered | Operator::BackgroundDetached)
	}

	/// Operators that are meaningless without a stage after them.
	pub fn needs_successor(self) -> bool {
		matches!(self, Operator::And | Operator::Or | Operator::Pipe)
	}
}

/// A sub-line and the operator that ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage<'a> {
	pub text: &'a str,
	pub op: Option<Operator>,
}

struct Parser<'a> {
	line: &'a str,
	i: usize,
}

impl<'a> Parser<'a> {
	fn new(line: &'a str) -> Parser<'a> {
		Parser { line, i: 0 }
	}

	fn bytes(&self) -> &'a [u8] {
		self.line.as_bytes()
	}

	fn peek(&self, offset: usize) -> Option<u8> {
		self.bytes().get(self.i + offset).copied()
	}

	fn proceed_while<F>(&mut self, f: F) where F: Fn(u8) -> bool {
		while let Some(c) = self.peek(0) {
			if !f(c) { break; }
			self.i += 1;
		}
	}

	fn is_whitespace(c: u8) -> bool {
		matches!(c, b' ' | b'\t' | b'\n' | b'\r')
	}

	fn skip_whitespaces(&mut self) {
		self.proceed_while(Parser::is_whitespace);
	}

	/// Steps over one character, which may be multi-byte.
	fn bump_char(&mut self) -> Option<char> {
		let c = self.line[self.i..].chars().next()?;
		self.i += c.len_utf8();
		Some(c)
	}

	fn operator_here(&self) -> Option<Operator> {
		match self.peek(0)? {
			b'&' => {
				// `2>&1` and friends belong to a redirection, not the chain.
				if self.i > 0 && self.bytes()[self.i - 1] == b'>' {
					return None;
				}
				Some(match (self.peek(1), self.peek(2)) {
					(Some(b'&'), _) => Operator::And,
					(Some(b'!'), Some(b'!')) => Operator::BackgroundDetached,
					(Some(b'!'), _) => Operator::BackgroundBuffered,
					_ => Operator::Background,
				})
			},
			b'|' => Some(if self.peek(1) == Some(b'|') { Operator::Or } else { Operator::Pipe }),
			b';' => Some(Operator::Sequence),
			_ => None,
		}
	}

	fn split_stages(&mut self) -> Vec<Stage<'a>> {
		let mut stages = vec![];
		let mut start = 0;
		let mut quoted = false;
		while let Some(c) = self.peek(0) {
			if c == ESCAPE {
				self.i += 1;
				self.bump_char();
				continue;
			}
			if c == QUOTE {
				quoted = !quoted;
				self.i += 1;
				continue;
			}
			if !quoted {
				if let Some(op) = self.operator_here() {
					stages.push(Stage { text: self.line[start..self.i].trim(), op: Some(op) });
					self.i += op.as_str().len();
					start = self.i;
					continue;
				}
			}
			self.bump_char();
		}
		let rest = self.line[start..].trim();
		if !rest.is_empty() {
			stages.push(Stage { text: rest, op: None });
		}
		stages
	}

	fn read_token(&mut self) -> Option<Token> {
		self.skip_whitespaces();
		self.peek(0)?;
		let mut text = String::new();
		let mut quoted = false;
		let mut in_quote = false;
		while let Some(c) = self.peek(0) {
			if c == ESCAPE {
				self.i += 1;
				if let Some(escaped) = self.bump_char() {
					text.push(escaped);
				}
			} else if c == QUOTE {
				self.i += 1;
				in_quote = !in_quote;
				quoted = true;
			} else if !in_quote && Parser::is_whitespace(c) {
				break;
			} else if let Some(ch) = self.bump_char() {
				text.push(ch);
			}
		}
		Some(Token { text, quoted })
	}
}

/// Splits a line at top-level chain operators.
///
/// Operators inside quotes or escaped with `^` are ordinary text. Longer
/// operators win over their one-character prefixes. An empty line yields no
/// stages.
pub fn split_stages(line: &str) -> Vec<Stage<'_>> {
	Parser::new(line).split_stages()
}

pub fn tokenize(subline: &str) -> Vec<Token> {
	let mut parser = Parser::new(subline);
	let mut tokens = vec![];
	while let Some(token) = parser.read_token() {
		tokens.push(token);
	}
	tokens
}

fn needs_escape(c: char, quoted: bool) -> bool {
	match c {
		'^' | '"' => true,
		'&' | '|' | ';' | ' ' | '\t' | '\n' | '\r' => !quoted,
		_ => false,
	}
}

/// Rebuilds a line that tokenizes back to `tokens`.
pub fn build_cmdline(tokens: &[Token]) -> String {
	let mut line = String::new();
	for (n, token) in tokens.iter().enumerate() {
		if n > 0 {
			line.push(' ');
		}
		if token.quoted {
			line.push('"');
		}
		for c in token.text.chars() {
			if needs_escape(c, token.quoted) {
				line.push('^');
			}
			line.push(c);
		}
		if token.quoted {
			line.push('"');
		}
	}
	line
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn ops(line: &str) -> Vec<(&str, Option<Operator>)> {
		split_stages(line).into_iter().map(|s| (s.text, s.op)).collect()
	}

	#[test]
	fn empty_line_has_no_stages() {
		assert!(split_stages("").is_empty());
		assert!(split_stages("   \t").is_empty());
	}

	#[test]
	fn longest_operator_wins() {
		assert_eq!(ops("a && b || c"), vec![
			("a", Some(Operator::And)),
			("b", Some(Operator::Or)),
			("c", None),
		]);
		assert_eq!(ops("a | b & c ; d"), vec![
			("a", Some(Operator::Pipe)),
			("b", Some(Operator::Background)),
			("c", Some(Operator::Sequence)),
			("d", None),
		]);
		assert_eq!(ops("a &! b &!!"), vec![
			("a", Some(Operator::BackgroundBuffered)),
			("b", Some(Operator::BackgroundDetached)),
		]);
	}

	#[test]
	fn quoted_and_escaped_operators_are_text() {
		assert_eq!(ops("echo \"a && b\" | wc"), vec![
			("echo \"a && b\"", Some(Operator::Pipe)),
			("wc", None),
		]);
		assert_eq!(ops("echo a ^&^& b"), vec![("echo a ^&^& b", None)]);
	}

	#[test]
	fn unterminated_quote_runs_to_end() {
		assert_eq!(ops("echo \"a | b"), vec![("echo \"a | b", None)]);
		let tokens = tokenize("echo \"a | b");
		assert_eq!(tokens[1], Token::new("a | b", true));
	}

	#[test]
	fn stderr_to_stdout_is_not_background() {
		assert_eq!(ops("cmd 2>&1 && next"), vec![
			("cmd 2>&1", Some(Operator::And)),
			("next", None),
		]);
	}

	#[test]
	fn tokenize_marks_quoted_arguments() {
		assert_eq!(tokenize("  cp \"my file\" dest^ dir x\"y\"z "), vec![
			Token::new("cp", false),
			Token::new("my file", true),
			Token::new("dest dir", false),
			Token::new("xyz", true),
		]);
	}

	#[test]
	fn rebuilt_line_tokenizes_identically() {
		for line in [
			"echo hello world",
			"cp \"my file\" \"\" dest",
			"echo ^\"quoted^\" ^^caret a^&b \"in ^\" quote\"",
			"grep \"a|b;c\" file^ name",
			"naïve \"ünïcode\" ^é",
		] {
			let tokens = tokenize(line);
			let rebuilt = build_cmdline(&tokens);
			assert_eq!(tokenize(&rebuilt), tokens, "line {:?} rebuilt as {:?}", line, rebuilt);
		}
	}
}
