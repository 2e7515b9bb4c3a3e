//! Recursive-descent parser producing evaluator nodes.
//!
//! The parser walks the lexer's cursor API and keeps a registry of classes
//! declared so far: `X(args)` resolves to an instantiation node holding the
//! runtime class, and `class B(A):` resolves its parent, at parse time.

use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Result, anyhow, bail};

use crate::ast::{Comparator, Statement};
use crate::lexer::{Lexer, Token};
use crate::runtime::{Class, Method};

pub fn parse_program(lexer: &mut Lexer) -> Result<Statement> {
    Parser::new(lexer).parse_program()
}

pub struct Parser<'a> {
    lexer: &'a mut Lexer,
    classes: HashMap<String, Rc<Class>>,
}

impl<'a> Parser<'a> {
    pub fn new(lexer: &'a mut Lexer) -> Self {
        Self {
            lexer,
            classes: HashMap::new(),
        }
    }

    pub fn parse_program(mut self) -> Result<Statement> {
        let mut statements = Vec::new();
        while !matches!(self.lexer.current(), Token::Eof) {
            statements.push(self.parse_statement()?);
        }
        Ok(Statement::Compound(statements))
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.lexer.current() {
            Token::Class => self.parse_class_definition(),
            Token::If => self.parse_if_else(),
            Token::Print => self.parse_print(),
            Token::Return => self.parse_return(),
            _ => self.parse_expression_statement(),
        }
    }

    fn parse_class_definition(&mut self) -> Result<Statement> {
        self.advance(); // class
        let name = self.consume_id()?;
        let parent = if matches!(self.lexer.current(), Token::Char(b'(')) {
            self.advance();
            let parent_name = self.consume_id()?;
            self.consume(&Token::Char(b')'))?;
            let class = self
                .classes
                .get(&parent_name)
                .cloned()
                .ok_or_else(|| anyhow!("Unknown base class '{parent_name}'"))?;
            Some(class)
        } else {
            None
        };
        self.consume(&Token::Char(b':'))?;
        self.consume(&Token::Newline)?;
        self.consume(&Token::Indent)?;

        let mut methods = Vec::new();
        while !matches!(self.lexer.current(), Token::Dedent | Token::Eof) {
            methods.push(self.parse_method()?);
        }
        self.consume_dedent();

        let class = Rc::new(Class::new(name.clone(), methods, parent)?);
        self.classes.insert(name, Rc::clone(&class));
        Ok(Statement::ClassDefinition(class))
    }

    fn parse_method(&mut self) -> Result<Method> {
        self.consume(&Token::Def)?;
        let name = self.consume_id()?;
        self.consume(&Token::Char(b'('))?;
        let mut formal_params = Vec::new();
        if !matches!(self.lexer.current(), Token::Char(b')')) {
            loop {
                formal_params.push(self.consume_id()?);
                if matches!(self.lexer.current(), Token::Char(b',')) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.consume(&Token::Char(b')'))?;
        self.consume(&Token::Char(b':'))?;
        let body = self.parse_suite()?;
        Ok(Method {
            name,
            formal_params,
            body: Statement::MethodBody(Box::new(body)),
        })
    }

    /// An indented block: newline, indent, statements, dedent.
    fn parse_suite(&mut self) -> Result<Statement> {
        self.consume(&Token::Newline)?;
        self.consume(&Token::Indent)?;
        let mut statements = Vec::new();
        while !matches!(self.lexer.current(), Token::Dedent | Token::Eof) {
            statements.push(self.parse_statement()?);
        }
        self.consume_dedent();
        Ok(Statement::Compound(statements))
    }

    fn parse_if_else(&mut self) -> Result<Statement> {
        self.advance(); // if
        let condition = self.parse_expression()?;
        self.consume(&Token::Char(b':'))?;
        let if_body = self.parse_suite()?;
        let else_body = if matches!(self.lexer.current(), Token::Else) {
            self.advance();
            self.consume(&Token::Char(b':'))?;
            Some(Box::new(self.parse_suite()?))
        } else {
            None
        };
        // The condition may evaluate to any value; the truth cast makes it
        // the Bool the evaluator requires.
        Ok(Statement::IfElse {
            condition: Box::new(Statement::Truthy(Box::new(condition))),
            if_body: Box::new(if_body),
            else_body,
        })
    }

    fn parse_print(&mut self) -> Result<Statement> {
        self.advance(); // print
        let mut args = Vec::new();
        if !self.at_statement_end() {
            loop {
                args.push(self.parse_expression()?);
                if matches!(self.lexer.current(), Token::Char(b',')) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.end_statement()?;
        Ok(Statement::Print { args })
    }

    fn parse_return(&mut self) -> Result<Statement> {
        self.advance(); // return
        if self.at_statement_end() {
            self.end_statement()?;
            return Ok(Statement::Return(Box::new(Statement::NoneLiteral)));
        }
        let value = self.parse_expression()?;
        self.end_statement()?;
        Ok(Statement::Return(Box::new(value)))
    }

    fn parse_expression_statement(&mut self) -> Result<Statement> {
        let expr = self.parse_expression()?;
        if !matches!(self.lexer.current(), Token::Char(b'=')) {
            self.end_statement()?;
            return Ok(expr);
        }

        // `lhs = rhs`: the left side must have been a plain dotted chain.
        let Statement::VariableValue { mut dotted_ids } = expr else {
            bail!("Assignment target must be a variable or a field");
        };
        self.advance();
        let value = self.parse_expression()?;
        self.end_statement()?;

        let field = match dotted_ids.pop() {
            Some(name) => name,
            None => bail!("Assignment target must be a variable or a field"),
        };
        if dotted_ids.is_empty() {
            Ok(Statement::Assignment {
                var: field,
                expr: Box::new(value),
            })
        } else {
            Ok(Statement::FieldAssignment {
                object: Box::new(Statement::VariableValue { dotted_ids }),
                field,
                expr: Box::new(value),
            })
        }
    }

    fn parse_expression(&mut self) -> Result<Statement> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Statement> {
        let mut expr = self.parse_and()?;
        while matches!(self.lexer.current(), Token::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            expr = Statement::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Statement> {
        let mut expr = self.parse_not()?;
        while matches!(self.lexer.current(), Token::And) {
            self.advance();
            let rhs = self.parse_not()?;
            expr = Statement::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Statement> {
        if matches!(self.lexer.current(), Token::Not) {
            self.advance();
            let arg = self.parse_not()?;
            return Ok(Statement::Not(Box::new(arg)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Statement> {
        let lhs = self.parse_additive()?;
        let op = match self.lexer.current() {
            Token::Eq => Comparator::Equal,
            Token::NotEq => Comparator::NotEqual,
            Token::Char(b'<') => Comparator::Less,
            Token::Char(b'>') => Comparator::Greater,
            Token::LessOrEq => Comparator::LessOrEqual,
            Token::GreaterOrEq => Comparator::GreaterOrEqual,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Statement::Comparison {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_additive(&mut self) -> Result<Statement> {
        let mut expr = self.parse_term()?;
        loop {
            match self.lexer.current() {
                Token::Char(b'+') => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    expr = Statement::Add(Box::new(expr), Box::new(rhs));
                }
                Token::Char(b'-') => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    expr = Statement::Sub(Box::new(expr), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Statement> {
        let mut expr = self.parse_unary()?;
        loop {
            match self.lexer.current() {
                Token::Char(b'*') => {
                    self.advance();
                    let rhs = self.parse_unary()?;
                    expr = Statement::Mult(Box::new(expr), Box::new(rhs));
                }
                Token::Char(b'/') => {
                    self.advance();
                    let rhs = self.parse_unary()?;
                    expr = Statement::Div(Box::new(expr), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Statement> {
        if matches!(self.lexer.current(), Token::Char(b'-')) {
            self.advance();
            let operand = self.parse_unary()?;
            let negated = match operand {
                Statement::NumberLiteral(value) => Statement::NumberLiteral(-value),
                other => Statement::Sub(
                    Box::new(Statement::NumberLiteral(0)),
                    Box::new(other),
                ),
            };
            return Ok(negated);
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Statement> {
        match self.lexer.current() {
            Token::Number(value) => {
                let value = *value;
                self.advance();
                Ok(Statement::NumberLiteral(value))
            }
            Token::String(text) => {
                let text = text.clone();
                self.advance();
                Ok(Statement::StringLiteral(text))
            }
            Token::True => {
                self.advance();
                Ok(Statement::BoolLiteral(true))
            }
            Token::False => {
                self.advance();
                Ok(Statement::BoolLiteral(false))
            }
            Token::None => {
                self.advance();
                Ok(Statement::NoneLiteral)
            }
            Token::Char(b'(') => {
                self.advance();
                let expr = self.parse_expression()?;
                self.consume(&Token::Char(b')'))?;
                Ok(expr)
            }
            Token::Id(_) => self.parse_name_chain(),
            other => bail!("Expected an expression, got '{other}'"),
        }
    }

    fn parse_name_chain(&mut self) -> Result<Statement> {
        let mut dotted_ids = vec![self.consume_id()?];
        while matches!(self.lexer.current(), Token::Char(b'.')) {
            self.advance();
            dotted_ids.push(self.consume_id()?);
        }
        if !matches!(self.lexer.current(), Token::Char(b'(')) {
            return Ok(Statement::VariableValue { dotted_ids });
        }

        let mut args = self.parse_call_args()?;
        match dotted_ids.pop() {
            Some(method) if !dotted_ids.is_empty() => Ok(Statement::MethodCall {
                object: Box::new(Statement::VariableValue { dotted_ids }),
                method,
                args,
            }),
            Some(name) => {
                // A bare call is an instantiation or the str builtin.
                if let Some(class) = self.classes.get(&name) {
                    return Ok(Statement::NewInstance {
                        class: Rc::clone(class),
                        args,
                    });
                }
                if name == "str" {
                    return match args.pop() {
                        Some(arg) if args.is_empty() => {
                            Ok(Statement::Stringify(Box::new(arg)))
                        }
                        _ => bail!("str() takes exactly one argument"),
                    };
                }
                bail!("'{name}' is not a known class")
            }
            None => bail!("Expected a name before '('"),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Statement>> {
        self.consume(&Token::Char(b'('))?;
        let mut args = Vec::new();
        if !matches!(self.lexer.current(), Token::Char(b')')) {
            loop {
                args.push(self.parse_expression()?);
                if matches!(self.lexer.current(), Token::Char(b',')) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.consume(&Token::Char(b')'))?;
        Ok(args)
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.lexer.current(),
            Token::Newline | Token::Eof | Token::Dedent
        )
    }

    fn end_statement(&mut self) -> Result<()> {
        match self.lexer.current() {
            Token::Newline => {
                self.advance();
                Ok(())
            }
            Token::Eof | Token::Dedent => Ok(()),
            other => bail!("Expected the end of a statement, got '{other}'"),
        }
    }

    fn advance(&mut self) {
        self.lexer.next_token();
    }

    /// Consumes the current token, requiring it to equal `expected`.
    fn consume(&mut self, expected: &Token) -> Result<()> {
        self.lexer.expect(expected)?;
        self.advance();
        Ok(())
    }

    /// Consumes a trailing `Dedent`. The lexer flushes dedents before `Eof`,
    /// so at end of input the block may already be closed.
    fn consume_dedent(&mut self) {
        if matches!(self.lexer.current(), Token::Dedent) {
            self.advance();
        }
    }

    fn consume_id(&mut self) -> Result<String> {
        let name = self.lexer.expect_id()?.to_string();
        self.advance();
        Ok(name)
    }
}
