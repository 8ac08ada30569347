//! Hand-written recursive descent parser with inline macro expansion.
//!
//! The standard macros (`has`, `all`, `exists`, `exists_one`, `filter`,
//! `map`) are expanded during parsing into `Select{test_only}` and
//! `Comprehension` nodes, so downstream passes only ever see the core
//! expression forms.

use crate::ast::{operators, AstBuilder, Comprehension, Expr, ExprFactory, ExprKind, Literal,
    MapEntry, StructField};
use crate::lexer::{lex, Span, SpannedToken, Token};

/// Parse error with span information.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}..{}", self.message, self.span.start, self.span.end)
    }
}

impl std::error::Error for ParseError {}

/// Name of the synthetic accumulator variable used by macro expansions.
pub const ACCUMULATOR_VAR: &str = "__result__";

/// Parse a source string into an expression tree.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let tokens = lex(source).map_err(|span| ParseError {
        message: "unrecognized input".to_string(),
        span,
    })?;

    let mut parser = Parser::new(&tokens);
    let expr = parser.parse_expr()?;
    if !parser.at_end() {
        return Err(ParseError {
            message: format!("unexpected trailing input: {:?}", parser.peek()),
            span: parser.peek_span(),
        });
    }
    Ok(expr)
}

/// Recursive descent parser over a token stream.
struct Parser<'a> {
    tokens: &'a [SpannedToken],
    pos: usize,
    factory: ExprFactory,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [SpannedToken]) -> Self {
        Self {
            tokens,
            pos: 0,
            factory: ExprFactory::new(),
        }
    }

    // === Utility Methods ===

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.eof_span())
    }

    fn eof_span(&self) -> Span {
        let end = self.tokens.last().map(|(_, s)| s.end).unwrap_or(0);
        end..end
    }

    fn advance(&mut self) -> Option<&SpannedToken> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek().map_or(false, |t| t == token)
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found {:?}", token, self.peek())))
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            span: self.peek_span(),
        }
    }

    // === Expression Parsing ===

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_ternary()
    }

    /// Ternary conditional: `cond ? then : else`.
    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if self.match_token(&Token::Question) {
            let then_expr = self.parse_ternary()?;
            self.expect(&Token::Colon)?;
            let else_expr = self.parse_ternary()?;
            return Ok(self
                .factory
                .global_call(operators::CONDITIONAL, vec![cond, then_expr, else_expr]));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.match_token(&Token::Or) {
            let right = self.parse_and()?;
            left = self
                .factory
                .global_call(operators::LOGICAL_OR, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_relation()?;
        while self.match_token(&Token::And) {
            let right = self.parse_relation()?;
            left = self
                .factory
                .global_call(operators::LOGICAL_AND, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_relation(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_addition()?;
        while let Some(op) = self.peek_relop() {
            self.advance();
            let right = self.parse_addition()?;
            left = self.factory.global_call(op, vec![left, right]);
        }
        Ok(left)
    }

    fn peek_relop(&self) -> Option<&'static str> {
        match self.peek()? {
            Token::EqEq => Some(operators::EQUALS),
            Token::Ne => Some(operators::NOT_EQUALS),
            Token::Lt => Some(operators::LESS),
            Token::Le => Some(operators::LESS_EQUALS),
            Token::Gt => Some(operators::GREATER),
            Token::Ge => Some(operators::GREATER_EQUALS),
            Token::In => Some(operators::IN),
            _ => None,
        }
    }

    fn parse_addition(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_mult()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => operators::ADD,
                Some(Token::Minus) => operators::SUBTRACT,
                _ => break,
            };
            self.advance();
            let right = self.parse_mult()?;
            left = self.factory.global_call(op, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_mult(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => operators::MULTIPLY,
                Some(Token::Slash) => operators::DIVIDE,
                Some(Token::Percent) => operators::MODULO,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = self.factory.global_call(op, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.match_token(&Token::Not) {
            let operand = self.parse_unary()?;
            return Ok(self
                .factory
                .global_call(operators::LOGICAL_NOT, vec![operand]));
        }
        if self.match_token(&Token::Minus) {
            // Fold negation into numeric literals so `-1` is a constant.
            if let Some(Token::Int(n)) = self.peek() {
                let n = *n;
                self.advance();
                return Ok(self.factory.literal(Literal::Int(-n)));
            }
            if let Some(Token::Double(n)) = self.peek() {
                let n = *n;
                self.advance();
                return Ok(self.factory.literal(Literal::Double(-n)));
            }
            let operand = self.parse_unary()?;
            return Ok(self.factory.global_call(operators::NEGATE, vec![operand]));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_atom()?;
        loop {
            if self.match_token(&Token::Dot) {
                expr = self.parse_member(expr)?;
            } else if self.match_token(&Token::LBracket) {
                let index = self.parse_expr()?;
                self.expect(&Token::RBracket)?;
                expr = self
                    .factory
                    .global_call(operators::INDEX, vec![expr, index]);
            } else if self.check(&Token::LBrace) {
                match type_name_of(&expr) {
                    Some(type_name) => {
                        self.advance();
                        expr = self.parse_struct_body(type_name)?;
                    }
                    None => break,
                }
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// Parse the tail of `operand.field` or `operand.method(args)`.
    fn parse_member(&mut self, operand: Expr) -> Result<Expr, ParseError> {
        let field = match self.peek() {
            Some(Token::Ident(name)) => name.clone(),
            _ => return Err(self.error("expected field or method name after '.'".to_string())),
        };
        self.advance();

        if self.match_token(&Token::LParen) {
            let args = self.parse_call_args()?;
            if let Some(expanded) = self.try_expand_member_macro(&operand, &field, &args)? {
                return Ok(expanded);
            }
            return Ok(self.factory.member_call(operand, field, args));
        }

        Ok(self.factory.select(operand, field, false))
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.match_token(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.match_token(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen)?;
            break;
        }
        Ok(args)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let token = match self.peek() {
            Some(t) => t.clone(),
            None => return Err(self.error("unexpected end of expression".to_string())),
        };

        match token {
            Token::Int(n) => {
                self.advance();
                Ok(self.factory.literal(Literal::Int(n)))
            }
            Token::UInt(n) => {
                self.advance();
                Ok(self.factory.literal(Literal::UInt(n)))
            }
            Token::Double(n) => {
                self.advance();
                Ok(self.factory.literal(Literal::Double(n)))
            }
            Token::String(s) => {
                self.advance();
                Ok(self.factory.literal(Literal::String(s)))
            }
            Token::Bytes(b) => {
                self.advance();
                Ok(self.factory.literal(Literal::Bytes(b)))
            }
            Token::True => {
                self.advance();
                Ok(self.factory.literal(Literal::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(self.factory.literal(Literal::Bool(false)))
            }
            Token::Null => {
                self.advance();
                Ok(self.factory.literal(Literal::Null))
            }
            Token::Ident(name) => {
                self.advance();
                if self.match_token(&Token::LParen) {
                    let args = self.parse_call_args()?;
                    if let Some(expanded) = self.try_expand_global_macro(&name, &args)? {
                        return Ok(expanded);
                    }
                    return Ok(self.factory.global_call(name, args));
                }
                Ok(self.factory.ident(name))
            }
            Token::Reserved(word) => {
                Err(self.error(format!("'{}' is a reserved word", word)))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => self.parse_list(),
            Token::LBrace => self.parse_map(),
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_list(&mut self) -> Result<Expr, ParseError> {
        self.expect(&Token::LBracket)?;
        let mut elements = Vec::new();
        if self.match_token(&Token::RBracket) {
            return Ok(self.factory.list(elements));
        }
        loop {
            elements.push(self.parse_expr()?);
            if self.match_token(&Token::Comma) {
                // Trailing comma before the closing bracket is allowed.
                if self.check(&Token::RBracket) {
                    break;
                }
                continue;
            }
            break;
        }
        self.expect(&Token::RBracket)?;
        Ok(self.factory.list(elements))
    }

    fn parse_map(&mut self) -> Result<Expr, ParseError> {
        self.expect(&Token::LBrace)?;
        let mut entries = Vec::new();
        if self.match_token(&Token::RBrace) {
            return Ok(self.factory.map_literal(entries));
        }
        loop {
            let key = self.parse_expr()?;
            self.expect(&Token::Colon)?;
            let value = self.parse_expr()?;
            entries.push(MapEntry { key, value });
            if self.match_token(&Token::Comma) {
                if self.check(&Token::RBrace) {
                    break;
                }
                continue;
            }
            break;
        }
        self.expect(&Token::RBrace)?;
        Ok(self.factory.map_literal(entries))
    }

    fn parse_struct_body(&mut self, type_name: String) -> Result<Expr, ParseError> {
        let mut fields = Vec::new();
        if self.match_token(&Token::RBrace) {
            return Ok(self.factory.struct_literal(type_name, fields));
        }
        loop {
            let name = match self.peek() {
                Some(Token::Ident(name)) => name.clone(),
                _ => return Err(self.error("expected field name in struct literal".to_string())),
            };
            self.advance();
            self.expect(&Token::Colon)?;
            let value = self.parse_expr()?;
            fields.push(StructField { name, value });
            if self.match_token(&Token::Comma) {
                if self.check(&Token::RBrace) {
                    break;
                }
                continue;
            }
            break;
        }
        self.expect(&Token::RBrace)?;
        Ok(self.factory.struct_literal(type_name, fields))
    }

    // === Macro Expansion ===

    fn try_expand_global_macro(
        &mut self,
        name: &str,
        args: &[Expr],
    ) -> Result<Option<Expr>, ParseError> {
        if name != "has" {
            return Ok(None);
        }
        if args.len() != 1 {
            return Err(self.error("has() takes exactly one argument".to_string()));
        }
        match &args[0].kind {
            ExprKind::Select {
                operand, field, ..
            } => {
                let operand = (**operand).clone();
                let field = field.clone();
                Ok(Some(self.factory.select(operand, field, true)))
            }
            _ => Err(self.error("has() argument must be a field selection".to_string())),
        }
    }

    fn try_expand_member_macro(
        &mut self,
        receiver: &Expr,
        name: &str,
        args: &[Expr],
    ) -> Result<Option<Expr>, ParseError> {
        let expected_args: usize = match name {
            "all" | "exists" | "exists_one" | "filter" | "map" => 2,
            _ => return Ok(None),
        };
        if args.len() != expected_args {
            return Err(self.error(format!(
                "{}() takes {} arguments, got {}",
                name,
                expected_args,
                args.len()
            )));
        }
        let iter_var = match &args[0].kind {
            ExprKind::Ident(name) => name.clone(),
            _ => {
                return Err(
                    self.error(format!("{}() iteration variable must be an identifier", name))
                )
            }
        };
        let body = args[1].clone();
        let range = receiver.clone();
        let f = &mut self.factory;

        let comprehension = match name {
            "all" => {
                // accu starts true, loop while accu, accu = accu && body
                let accu = f.ident(ACCUMULATOR_VAR);
                let step_accu = f.ident(ACCUMULATOR_VAR);
                let init = f.literal(Literal::Bool(true));
                let step = f.global_call(operators::LOGICAL_AND, vec![step_accu, body]);
                let result = f.ident(ACCUMULATOR_VAR);
                Comprehension {
                    iter_var,
                    iter_range: range,
                    accu_var: ACCUMULATOR_VAR.to_string(),
                    accu_init: init,
                    loop_condition: accu,
                    loop_step: step,
                    result,
                }
            }
            "exists" => {
                // accu starts false, loop while !accu, accu = accu || body
                let accu = f.ident(ACCUMULATOR_VAR);
                let cond = f.global_call(operators::LOGICAL_NOT, vec![accu]);
                let step_accu = f.ident(ACCUMULATOR_VAR);
                let init = f.literal(Literal::Bool(false));
                let step = f.global_call(operators::LOGICAL_OR, vec![step_accu, body]);
                let result = f.ident(ACCUMULATOR_VAR);
                Comprehension {
                    iter_var,
                    iter_range: range,
                    accu_var: ACCUMULATOR_VAR.to_string(),
                    accu_init: init,
                    loop_condition: cond,
                    loop_step: step,
                    result,
                }
            }
            "exists_one" => {
                // accu counts matches; result is accu == 1
                let init = f.literal(Literal::Int(0));
                let cond = f.literal(Literal::Bool(true));
                let accu = f.ident(ACCUMULATOR_VAR);
                let one = f.literal(Literal::Int(1));
                let incremented = f.global_call(operators::ADD, vec![accu, one]);
                let unchanged = f.ident(ACCUMULATOR_VAR);
                let step =
                    f.global_call(operators::CONDITIONAL, vec![body, incremented, unchanged]);
                let result_accu = f.ident(ACCUMULATOR_VAR);
                let result_one = f.literal(Literal::Int(1));
                let result = f.global_call(operators::EQUALS, vec![result_accu, result_one]);
                Comprehension {
                    iter_var,
                    iter_range: range,
                    accu_var: ACCUMULATOR_VAR.to_string(),
                    accu_init: init,
                    loop_condition: cond,
                    loop_step: step,
                    result,
                }
            }
            "filter" => {
                // accu accumulates elements for which body holds
                let init = f.list(Vec::new());
                let cond = f.literal(Literal::Bool(true));
                let accu = f.ident(ACCUMULATOR_VAR);
                let elem = f.ident(&iter_var);
                let singleton = f.list(vec![elem]);
                let appended = f.global_call(operators::ADD, vec![accu, singleton]);
                let unchanged = f.ident(ACCUMULATOR_VAR);
                let step =
                    f.global_call(operators::CONDITIONAL, vec![body, appended, unchanged]);
                let result = f.ident(ACCUMULATOR_VAR);
                Comprehension {
                    iter_var,
                    iter_range: range,
                    accu_var: ACCUMULATOR_VAR.to_string(),
                    accu_init: init,
                    loop_condition: cond,
                    loop_step: step,
                    result,
                }
            }
            "map" => {
                // accu accumulates the transformed elements
                let init = f.list(Vec::new());
                let cond = f.literal(Literal::Bool(true));
                let accu = f.ident(ACCUMULATOR_VAR);
                let singleton = f.list(vec![body]);
                let step = f.global_call(operators::ADD, vec![accu, singleton]);
                let result = f.ident(ACCUMULATOR_VAR);
                Comprehension {
                    iter_var,
                    iter_range: range,
                    accu_var: ACCUMULATOR_VAR.to_string(),
                    accu_init: init,
                    loop_condition: cond,
                    loop_step: step,
                    result,
                }
            }
            _ => unreachable!(),
        };

        Ok(Some(self.factory.comprehension(comprehension)))
    }
}

/// Extract a dotted type name from an ident/select chain, if the
/// expression is one. Used to disambiguate `Name{...}` struct literals.
fn type_name_of(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Select {
            operand,
            field,
            test_only: false,
        } => type_name_of(operand).map(|prefix| format!("{}.{}", prefix, field)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Expr {
        parse(source).unwrap()
    }

    #[test]
    fn parses_binary_precedence() {
        let expr = parse_ok("1 + 2 * 3");
        match &expr.kind {
            ExprKind::Call { function, args, .. } => {
                assert_eq!(function, operators::ADD);
                assert!(matches!(args[0].kind, ExprKind::Literal(Literal::Int(1))));
                assert_eq!(args[1].call_function(), Some(operators::MULTIPLY));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn parses_ternary() {
        let expr = parse_ok("a ? 1 : 2");
        assert_eq!(expr.call_function(), Some(operators::CONDITIONAL));
    }

    #[test]
    fn parses_member_call_and_select() {
        let expr = parse_ok("request.name.startsWith('a')");
        match &expr.kind {
            ExprKind::Call {
                target, function, ..
            } => {
                assert_eq!(function, "startsWith");
                assert!(matches!(
                    target.as_deref().unwrap().kind,
                    ExprKind::Select { .. }
                ));
            }
            other => panic!("expected member call, got {:?}", other),
        }
    }

    #[test]
    fn parses_in_operator() {
        let expr = parse_ok("'x' in headers");
        assert_eq!(expr.call_function(), Some(operators::IN));
    }

    #[test]
    fn expands_has_macro() {
        let expr = parse_ok("has(request.name)");
        match &expr.kind {
            ExprKind::Select {
                field, test_only, ..
            } => {
                assert_eq!(field, "name");
                assert!(test_only);
            }
            other => panic!("expected test-only select, got {:?}", other),
        }
    }

    #[test]
    fn has_requires_selection() {
        assert!(parse("has(request)").is_err());
    }

    #[test]
    fn expands_all_macro_to_comprehension() {
        let expr = parse_ok("names.all(s, s != '')");
        match &expr.kind {
            ExprKind::Comprehension(c) => {
                assert_eq!(c.iter_var, "s");
                assert_eq!(c.accu_var, ACCUMULATOR_VAR);
            }
            other => panic!("expected comprehension, got {:?}", other),
        }
    }

    #[test]
    fn macro_iter_var_must_be_ident() {
        assert!(parse("names.all(1, true)").is_err());
    }

    #[test]
    fn parses_list_and_map_literals() {
        assert!(matches!(parse_ok("[1, 2, 3]").kind, ExprKind::List { .. }));
        assert!(matches!(parse_ok("{'a': 1}").kind, ExprKind::Map { .. }));
    }

    #[test]
    fn parses_struct_literal() {
        let expr = parse_ok("pkg.Msg{name: 'x'}");
        match &expr.kind {
            ExprKind::Struct { type_name, fields } => {
                assert_eq!(type_name, "pkg.Msg");
                assert_eq!(fields.len(), 1);
            }
            other => panic!("expected struct literal, got {:?}", other),
        }
    }

    #[test]
    fn parses_index() {
        let expr = parse_ok("headers['key']");
        assert_eq!(expr.call_function(), Some(operators::INDEX));
    }

    #[test]
    fn negative_literal_folds() {
        assert!(matches!(
            parse_ok("-5").kind,
            ExprKind::Literal(Literal::Int(-5))
        ));
    }

    #[test]
    fn rejects_trailing_input() {
        assert!(parse("1 1").is_err());
        assert!(parse("1 +").is_err());
    }

    #[test]
    fn rejects_reserved_words() {
        assert!(parse("if").is_err());
    }

    #[test]
    fn node_ids_are_unique() {
        let expr = parse_ok("a.b(c, [d, e]) + {f: g}");
        let mut ids = Vec::new();
        expr.visit(&mut |e| ids.push(e.id));
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len());
    }
}
