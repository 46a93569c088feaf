//! Safe expression evaluator for data files and record rules.
//!
//! The language is deliberately tiny: literals, lists, tuples (read as lists),
//! objects, unary minus, names, attribute access, indexing and calls of
//! functions the caller provides. Nothing can mutate state.
//!
//! ```text
//! [("user_id", "=", user.id), ("company_id", "in", company_ids)]
//! [(6, 0, [ref('base.group_user'), ref('group_manager')])]
//! ```

use serde_json::{Map, Value as JsonValue};

use crate::error::{OrmError, OrmResult};

/// Name and function resolution for [`evaluate`].
pub trait EvalScope {
    /// Value bound to `name`, if any.
    fn lookup(&self, name: &str) -> Option<JsonValue>;

    /// Call the function `name`. The default scope knows no functions.
    fn call(&self, name: &str, args: &[JsonValue]) -> OrmResult<JsonValue> {
        let _ = args;
        Err(OrmError::validation(format!("unknown function '{name}'")))
    }
}

/// Scope over a plain JSON object.
impl EvalScope for Map<String, JsonValue> {
    fn lookup(&self, name: &str) -> Option<JsonValue> {
        self.get(name).cloned()
    }
}

/// Scope with no names at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyScope;

impl EvalScope for EmptyScope {
    fn lookup(&self, _name: &str) -> Option<JsonValue> {
        None
    }
}

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(JsonValue),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Name(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Neg(Box<Expr>),
}

/// Parse and evaluate `source` in `scope`.
pub fn evaluate(source: &str, scope: &dyn EvalScope) -> OrmResult<JsonValue> {
    parse(source)?.evaluate(scope)
}

/// Parse `source` into an expression tree.
pub fn parse(source: &str) -> OrmResult<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(syntax(format!(
            "unexpected trailing input in '{source}'"
        )));
    }
    Ok(expr)
}

impl Expr {
    pub fn evaluate(&self, scope: &dyn EvalScope) -> OrmResult<JsonValue> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::List(items) => items
                .iter()
                .map(|e| e.evaluate(scope))
                .collect::<OrmResult<Vec<_>>>()
                .map(JsonValue::Array),
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (k, e) in entries {
                    map.insert(k.clone(), e.evaluate(scope)?);
                }
                Ok(JsonValue::Object(map))
            }
            Expr::Name(name) => scope
                .lookup(name)
                .ok_or_else(|| OrmError::validation(format!("unknown name '{name}'"))),
            Expr::Attr(target, attr) => match target.evaluate(scope)? {
                JsonValue::Object(map) => map.get(attr).cloned().ok_or_else(|| {
                    OrmError::validation(format!("no attribute '{attr}'"))
                }),
                other => Err(OrmError::validation(format!(
                    "cannot read attribute '{attr}' of {other}"
                ))),
            },
            Expr::Index(target, index) => {
                let target = target.evaluate(scope)?;
                let index = index.evaluate(scope)?;
                match (&target, &index) {
                    (JsonValue::Array(items), JsonValue::Number(n)) => {
                        let i = n
                            .as_i64()
                            .ok_or_else(|| OrmError::validation("list index must be an integer"))?;
                        let len = items.len() as i64;
                        let i = if i < 0 { len + i } else { i };
                        usize::try_from(i)
                            .ok()
                            .and_then(|i| items.get(i))
                            .cloned()
                            .ok_or_else(|| OrmError::validation("list index out of range"))
                    }
                    (JsonValue::Object(map), JsonValue::String(key)) => map
                        .get(key)
                        .cloned()
                        .ok_or_else(|| OrmError::validation(format!("no key '{key}'"))),
                    _ => Err(OrmError::validation(format!(
                        "cannot index {target} with {index}"
                    ))),
                }
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|a| a.evaluate(scope))
                    .collect::<OrmResult<Vec<_>>>()?;
                scope.call(name, &args)
            }
            Expr::Neg(inner) => match inner.evaluate(scope)? {
                JsonValue::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(JsonValue::from(-i))
                    } else if let Some(f) = n.as_f64() {
                        Ok(JsonValue::from(-f))
                    } else {
                        Err(OrmError::validation("cannot negate number"))
                    }
                }
                other => Err(OrmError::validation(format!("cannot negate {other}"))),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokenizer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Punct(char),
}

fn syntax(msg: impl Into<String>) -> OrmError {
    OrmError::validation(format!("expression syntax error: {}", msg.into()))
}

fn tokenize(source: &str) -> OrmResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(syntax("unterminated string literal"));
                };
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\\' {
                    let Some(&esc) = chars.get(i) else {
                        return Err(syntax("dangling escape"));
                    };
                    i += 1;
                    text.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                } else {
                    text.push(ch);
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() {
                let ch = chars[i];
                if ch.is_ascii_digit() || ch == '_' {
                    i += 1;
                } else if ch == '.' && !is_float && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                    is_float = true;
                    i += 1;
                } else if (ch == 'e' || ch == 'E') && i > start {
                    is_float = true;
                    i += 1;
                    if matches!(chars.get(i), Some('+') | Some('-')) {
                        i += 1;
                    }
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            if is_float {
                let f = text
                    .parse::<f64>()
                    .map_err(|e| syntax(format!("bad number '{text}': {e}")))?;
                tokens.push(Token::Float(f));
            } else {
                let n = text
                    .parse::<i64>()
                    .map_err(|e| syntax(format!("bad number '{text}': {e}")))?;
                tokens.push(Token::Int(n));
            }
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if "[](){},:.-".contains(c) {
            tokens.push(Token::Punct(c));
            i += 1;
            continue;
        }
        return Err(syntax(format!("unexpected character '{c}'")));
    }

    Ok(tokens)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> OrmResult<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(syntax(format!("expected '{c}'")))
        }
    }

    fn expr(&mut self) -> OrmResult<Expr> {
        if self.eat('-') {
            let inner = self.expr()?;
            return Ok(match inner {
                Expr::Literal(JsonValue::Number(n)) if n.as_i64().is_some() => {
                    Expr::Literal(JsonValue::from(-n.as_i64().unwrap_or_default()))
                }
                other => Expr::Neg(Box::new(other)),
            });
        }
        let mut expr = self.primary()?;
        loop {
            if self.eat('.') {
                match self.next() {
                    Some(Token::Ident(attr)) => expr = Expr::Attr(Box::new(expr), attr),
                    _ => return Err(syntax("expected attribute name after '.'")),
                }
            } else if self.peek() == Some(&Token::Punct('[')) {
                self.pos += 1;
                let index = self.expr()?;
                self.expect(']')?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn sequence(&mut self, close: char) -> OrmResult<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.expr()?);
            if !self.eat(',') {
                self.expect(close)?;
                return Ok(items);
            }
        }
    }

    fn primary(&mut self) -> OrmResult<Expr> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Literal(JsonValue::from(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(JsonValue::from(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(JsonValue::String(s))),
            Some(Token::Punct('[')) => Ok(Expr::List(self.sequence(']')?)),
            Some(Token::Punct('(')) => Ok(Expr::List(self.sequence(')')?)),
            Some(Token::Punct('{')) => {
                let mut entries = Vec::new();
                loop {
                    if self.eat('}') {
                        break;
                    }
                    let key = match self.next() {
                        Some(Token::Str(s)) | Some(Token::Ident(s)) => s,
                        _ => return Err(syntax("object keys must be strings")),
                    };
                    self.expect(':')?;
                    entries.push((key, self.expr()?));
                    if !self.eat(',') {
                        self.expect('}')?;
                        break;
                    }
                }
                Ok(Expr::Object(entries))
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "True" => Ok(Expr::Literal(JsonValue::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(JsonValue::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(JsonValue::Null)),
                _ => {
                    if self.eat('(') {
                        Ok(Expr::Call(name, self.sequence(')')?))
                    } else {
                        Ok(Expr::Name(name))
                    }
                }
            },
            Some(Token::Punct(c)) => Err(syntax(format!("unexpected '{c}'"))),
            None => Err(syntax("unexpected end of expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    struct RefScope;

    impl EvalScope for RefScope {
        fn lookup(&self, name: &str) -> Option<JsonValue> {
            match name {
                "uid" => Some(json!(7)),
                "user" => Some(json!({"id": 7, "company_ids": [1, 2]})),
                _ => None,
            }
        }

        fn call(&self, name: &str, args: &[JsonValue]) -> OrmResult<JsonValue> {
            match (name, args) {
                ("ref", [JsonValue::String(xml_id)]) if xml_id == "base.group_user" => Ok(json!(3)),
                _ => Err(OrmError::validation(format!("bad call {name}"))),
            }
        }
    }

    #[test]
    fn rule_domains_evaluate_with_user_attributes() {
        let v = evaluate(
            "[('user_id', '=', user.id), ('company_id', 'in', user.company_ids)]",
            &RefScope,
        )
        .unwrap();
        assert_eq!(
            v,
            json!([["user_id", "=", 7], ["company_id", "in", [1, 2]]])
        );
    }

    #[test]
    fn commands_with_refs_evaluate() {
        let v = evaluate("[(6, 0, [ref('base.group_user')])]", &RefScope).unwrap();
        assert_eq!(v, json!([[6, 0, [3]]]));
    }

    #[test]
    fn literals_cover_both_spellings_of_booleans() {
        assert_eq!(evaluate("True", &EmptyScope).unwrap(), json!(true));
        assert_eq!(evaluate("false", &EmptyScope).unwrap(), json!(false));
        assert_eq!(evaluate("None", &EmptyScope).unwrap(), JsonValue::Null);
        assert_eq!(evaluate("-2.5", &EmptyScope).unwrap(), json!(-2.5));
        assert_eq!(evaluate("{'a': [1, 2,]}", &EmptyScope).unwrap(), json!({"a": [1, 2]}));
    }

    #[test]
    fn unknown_names_and_functions_fail() {
        assert!(evaluate("os", &EmptyScope).is_err());
        assert!(evaluate("eval('1')", &EmptyScope).is_err());
    }

    #[test]
    fn malformed_input_is_a_syntax_error() {
        assert!(parse("[1, 2").is_err());
        assert!(parse("1 2").is_err());
        assert!(parse("'open").is_err());
        assert!(parse("1 + 2").is_err());
    }

    proptest! {
        #[test]
        fn integer_literals_evaluate_to_themselves(n in any::<i64>().prop_filter("negatable", |n| *n != i64::MIN)) {
            let v = evaluate(&n.to_string(), &EmptyScope).unwrap();
            prop_assert_eq!(v, json!(n));
        }

        #[test]
        fn quoted_strings_evaluate_to_their_text(s in "[a-zA-Z0-9 _.,:-]{0,24}") {
            let v = evaluate(&format!("'{s}'"), &EmptyScope).unwrap();
            prop_assert_eq!(v, json!(s));
        }
    }
}
