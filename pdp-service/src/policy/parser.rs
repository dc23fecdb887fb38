//! Recursive-descent parser for the policy language

use super::ast::*;
use super::lexer::{tokenize, SyntaxError, Token, TokenKind};

/// Parse a full script
pub fn parse(source: &str) -> Result<Script, SyntaxError> {
    let tokens = tokenize(source)?;
    Parser { tokens, pos: 0 }.script()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn script(mut self) -> Result<Script, SyntaxError> {
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::Eof) {
            if self.eat(&TokenKind::Newline) {
                continue;
            }
            stmts.push(self.statement()?);
        }
        Ok(Script { stmts })
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        match &self.current().kind {
            TokenKind::Def => self.def_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::For => self.for_statement(),
            _ => {
                let stmt = self.simple_statement()?;
                self.expect(TokenKind::Newline)?;
                Ok(stmt)
            }
        }
    }

    fn def_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.expect(TokenKind::Def)?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            params.push(self.expect_ident()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Colon)?;
        let body = self.block()?;
        Ok(Stmt::Def {
            name,
            params,
            body,
            line,
        })
    }

    fn if_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.expect(TokenKind::If)?;
        let mut branches = Vec::new();
        let cond = self.expression()?;
        self.expect(TokenKind::Colon)?;
        branches.push((cond, self.block()?));

        let mut orelse = Vec::new();
        loop {
            if self.eat(&TokenKind::Elif) {
                let cond = self.expression()?;
                self.expect(TokenKind::Colon)?;
                branches.push((cond, self.block()?));
            } else if self.eat(&TokenKind::Else) {
                self.expect(TokenKind::Colon)?;
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If {
            branches,
            orelse,
            line,
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.expect(TokenKind::For)?;
        let var = self.expect_ident()?;
        self.expect(TokenKind::In)?;
        let iter = self.expression()?;
        self.expect(TokenKind::Colon)?;
        let body = self.block()?;
        Ok(Stmt::For {
            var,
            iter,
            body,
            line,
        })
    }

    fn simple_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        match &self.current().kind {
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Newline) {
                    None
                } else {
                    Some(self.expression()?)
                };
                Ok(Stmt::Return { value, line })
            }
            TokenKind::Break => {
                self.advance();
                Ok(Stmt::Break { line })
            }
            TokenKind::Continue => {
                self.advance();
                Ok(Stmt::Continue { line })
            }
            TokenKind::Pass => {
                self.advance();
                Ok(Stmt::Pass)
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&TokenKind::Assign) {
                    let ExprKind::Name(name) = expr.kind else {
                        return Err(SyntaxError::new(
                            "assignment target must be a simple name",
                            line,
                        ));
                    };
                    let value = self.expression()?;
                    Ok(Stmt::Assign { name, value, line })
                } else {
                    Ok(Stmt::Expr { expr, line })
                }
            }
        }
    }

    /// An indented statement block
    fn block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect(TokenKind::Newline)?;
        self.expect(TokenKind::Indent)?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::Dedent) {
            if self.eat(&TokenKind::Newline) {
                continue;
            }
            stmts.push(self.statement()?);
        }
        self.expect(TokenKind::Dedent)?;
        if stmts.is_empty() {
            return Err(SyntaxError::new("empty block", self.line()));
        }
        Ok(stmts)
    }

    // ------------------------------------------------------------------
    // Expressions, loosest binding first
    // ------------------------------------------------------------------

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let body = self.or_expr()?;
        if self.eat(&TokenKind::If) {
            let test = self.or_expr()?;
            self.expect(TokenKind::Else)?;
            let orelse = self.expression()?;
            return Ok(Expr::new(
                ExprKind::Cond {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            ));
        }
        Ok(body)
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.and_expr()?;
        while self.check(&TokenKind::Or) {
            let line = self.line();
            self.advance();
            let right = self.and_expr()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.not_expr()?;
        while self.check(&TokenKind::And) {
            let line = self.line();
            self.advance();
            let right = self.not_expr()?;
            left = Expr::new(
                ExprKind::BoolOp {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, SyntaxError> {
        if self.check(&TokenKind::Not) {
            let line = self.line();
            self.advance();
            let operand = self.not_expr()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let left = self.arith()?;
        let mut ops = Vec::new();
        loop {
            let op = match &self.current().kind {
                TokenKind::Eq => CmpOp::Eq,
                TokenKind::Ne => CmpOp::Ne,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::Le => CmpOp::Le,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::Ge => CmpOp::Ge,
                TokenKind::In => CmpOp::In,
                TokenKind::Not if self.peek_kind(1) == Some(&TokenKind::In) => {
                    self.advance();
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.advance();
            ops.push((op, self.arith()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::new(
                ExprKind::Compare {
                    left: Box::new(left),
                    ops,
                },
                line,
            ))
        }
    }

    fn arith(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.term()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.term()?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.factor()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::SlashSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.factor()?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, SyntaxError> {
        if self.check(&TokenKind::Minus) {
            let line = self.line();
            self.advance();
            let operand = self.factor()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        if self.check(&TokenKind::Plus) {
            self.advance();
            return self.factor();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        loop {
            let line = self.line();
            if self.eat(&TokenKind::LParen) {
                let mut args = Vec::new();
                while !self.check(&TokenKind::RParen) {
                    args.push(self.expression()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen)?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                    },
                    line,
                );
            } else if self.eat(&TokenKind::Dot) {
                let name = self.expect_ident()?;
                expr = Expr::new(
                    ExprKind::Attr {
                        object: Box::new(expr),
                        name,
                    },
                    line,
                );
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.expression()?;
                self.expect(TokenKind::RBracket)?;
                expr = Expr::new(
                    ExprKind::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let kind = match self.current().kind.clone() {
            TokenKind::NoneLit => {
                self.advance();
                ExprKind::NoneLit
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::Int(n) => {
                self.advance();
                ExprKind::Int(n)
            }
            TokenKind::Float(x) => {
                self.advance();
                ExprKind::Float(x)
            }
            TokenKind::Str(s) => {
                self.advance();
                ExprKind::Str(s)
            }
            TokenKind::Ident(name) => {
                self.advance();
                ExprKind::Name(name)
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(TokenKind::RParen)?;
                return Ok(inner);
            }
            TokenKind::LBracket => return self.list_or_comprehension(),
            TokenKind::LBrace => return self.dict_literal(),
            other => {
                return Err(SyntaxError::new(
                    format!("unexpected {other} in expression"),
                    line,
                ));
            }
        };
        Ok(Expr::new(kind, line))
    }

    fn list_or_comprehension(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        self.expect(TokenKind::LBracket)?;
        if self.eat(&TokenKind::RBracket) {
            return Ok(Expr::new(ExprKind::List(Vec::new()), line));
        }

        let first = self.expression()?;
        if self.eat(&TokenKind::For) {
            let var = self.expect_ident()?;
            self.expect(TokenKind::In)?;
            let iter = self.or_expr()?;
            let cond = if self.eat(&TokenKind::If) {
                Some(Box::new(self.or_expr()?))
            } else {
                None
            };
            self.expect(TokenKind::RBracket)?;
            return Ok(Expr::new(
                ExprKind::ListComp {
                    expr: Box::new(first),
                    var,
                    iter: Box::new(iter),
                    cond,
                },
                line,
            ));
        }

        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.check(&TokenKind::RBracket) {
                break;
            }
            items.push(self.expression()?);
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::new(ExprKind::List(items), line))
    }

    fn dict_literal(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        self.expect(TokenKind::LBrace)?;
        let mut entries = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let key = self.expression()?;
            self.expect(TokenKind::Colon)?;
            let value = self.expression()?;
            entries.push((key, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::Dict(entries), line))
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self, ahead: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + ahead).map(|t| &t.kind)
    }

    fn line(&self) -> u32 {
        self.current().line
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), SyntaxError> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(SyntaxError::new(
                format!("expected {kind}, found {}", self.current().kind),
                self.line(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<String, SyntaxError> {
        if let TokenKind::Ident(name) = self.current().kind.clone() {
            self.advance();
            Ok(name)
        } else {
            Err(SyntaxError::new(
                format!("expected identifier, found {}", self.current().kind),
                self.line(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_policy() {
        let script = parse("def authorize():\n    return input.user.isOwner\n").unwrap();
        assert_eq!(script.stmts.len(), 1);
        let Stmt::Def { name, params, body, .. } = &script.stmts[0] else {
            panic!("expected def");
        };
        assert_eq!(name, "authorize");
        assert!(params.is_empty());
        assert_eq!(body.len(), 1);
        assert!(matches!(body[0], Stmt::Return { .. }));
    }

    #[test]
    fn test_parse_if_elif_else() {
        let src = "\
def authorize():
    if input.request.action == 'READ':
        return True
    elif input.user.isLEAR:
        return True
    else:
        return False
";
        let script = parse(src).unwrap();
        let Stmt::Def { body, .. } = &script.stmts[0] else {
            panic!()
        };
        let Stmt::If { branches, orelse, .. } = &body[0] else {
            panic!("expected if")
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(orelse.len(), 1);
    }

    #[test]
    fn test_parse_for_and_membership() {
        let src = "\
def authorize():
    for party in input.tmf.relatedParty:
        if party.role in ['Seller', 'Buyer']:
            return True
    return False
";
        parse(src).unwrap();
    }

    #[test]
    fn test_parse_not_in() {
        let script = parse("x = 'a' not in ['b']\n").unwrap();
        let Stmt::Assign { value, .. } = &script.stmts[0] else {
            panic!()
        };
        let ExprKind::Compare { ops, .. } = &value.kind else {
            panic!("expected comparison")
        };
        assert_eq!(ops[0].0, CmpOp::NotIn);
    }

    #[test]
    fn test_parse_list_comprehension() {
        let script =
            parse("names = [p.name for p in parties if p.role == 'Seller']\n").unwrap();
        let Stmt::Assign { value, .. } = &script.stmts[0] else {
            panic!()
        };
        assert!(matches!(value.kind, ExprKind::ListComp { .. }));
    }

    #[test]
    fn test_parse_conditional_expression() {
        let script = parse("x = 1 if ok else 2\n").unwrap();
        let Stmt::Assign { value, .. } = &script.stmts[0] else {
            panic!()
        };
        assert!(matches!(value.kind, ExprKind::Cond { .. }));
    }

    #[test]
    fn test_parse_dict_and_calls() {
        parse("cfg = {'a': 1, 'b': [2, 3]}\nn = len(cfg.keys())\n").unwrap();
    }

    #[test]
    fn test_assignment_target_must_be_name() {
        assert!(parse("a.b = 1\n").is_err());
    }

    #[test]
    fn test_empty_block_is_error() {
        assert!(parse("def f():\npass\n").is_err());
    }

    #[test]
    fn test_precedence_and_chaining() {
        let script = parse("x = 1 + 2 * 3 < 10 and not done\n").unwrap();
        let Stmt::Assign { value, .. } = &script.stmts[0] else {
            panic!()
        };
        // Outermost node is the `and`.
        assert!(matches!(
            value.kind,
            ExprKind::BoolOp { op: BoolOp::And, .. }
        ));
    }
}
