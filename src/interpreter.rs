//! AST execution.
//!
//! Every node evaluates to a value handle. `return` travels as the
//! dedicated `Unwind::Return` signal: it short-circuits every node between
//! the `return` statement and the enclosing method body, and nothing but
//! `MethodBody` consumes it, so it can never be mistaken for an error.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use anyhow::Result;

use crate::ast::{Comparator, Statement};
use crate::lexer::Lexer;
use crate::parser;
use crate::runtime::{
    self, ADD_METHOD, Closure, Context, ExecResult, INIT_METHOD, Instance, RuntimeError,
    SimpleContext, Unwind, Value, call_method, is_true, render_value,
};

impl Statement {
    pub fn execute(&self, closure: &mut Closure, context: &mut dyn Context) -> ExecResult {
        match self {
            Statement::NumberLiteral(value) => Ok(Value::Number(*value)),
            Statement::StringLiteral(text) => Ok(Value::string(text.clone())),
            Statement::BoolLiteral(value) => Ok(Value::Bool(*value)),
            Statement::NoneLiteral => Ok(Value::None),

            Statement::Assignment { var, expr } => {
                let value = expr.execute(closure, context)?;
                closure.insert(var.clone(), value.clone());
                Ok(value)
            }

            Statement::VariableValue { dotted_ids } => lookup_dotted(dotted_ids, closure),

            Statement::FieldAssignment {
                object,
                field,
                expr,
            } => {
                let target = object.execute(closure, context)?;
                let Value::Instance(instance) = &target else {
                    return Err(RuntimeError::ExpectedInstance {
                        type_name: target.type_name(),
                    }
                    .into());
                };
                let value = expr.execute(closure, context)?;
                instance
                    .borrow_mut()
                    .fields_mut()
                    .insert(field.clone(), value.clone());
                Ok(value)
            }

            Statement::Print { args } => {
                let mut rendered = Vec::with_capacity(args.len());
                for arg in args {
                    let value = arg.execute(closure, context)?;
                    rendered.push(render_value(&value, context)?);
                }
                let line = rendered.join(" ") + "\n";
                write_output(context, &line)?;
                Ok(Value::None)
            }

            Statement::MethodCall {
                object,
                method,
                args,
            } => {
                let receiver = object.execute(closure, context)?;
                let Value::Instance(instance) = &receiver else {
                    return Err(RuntimeError::ExpectedInstance {
                        type_name: receiver.type_name(),
                    }
                    .into());
                };
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.execute(closure, context)?);
                }
                call_method(instance, method, values, context)
            }

            Statement::NewInstance { class, args } => {
                let receiver = Rc::new(RefCell::new(Instance::new(Rc::clone(class))));
                // Without an __init__ of matching arity the arguments stay
                // unevaluated and the bare instance is returned.
                if receiver.borrow().has_method(INIT_METHOD, args.len()) {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(arg.execute(closure, context)?);
                    }
                    call_method(&receiver, INIT_METHOD, values, context)?;
                }
                Ok(Value::Instance(receiver))
            }

            Statement::Stringify(arg) => {
                let value = arg.execute(closure, context)?;
                Ok(Value::string(render_value(&value, context)?))
            }

            Statement::Add(lhs, rhs) => {
                let left = lhs.execute(closure, context)?;
                let right = rhs.execute(closure, context)?;
                match (&left, &right) {
                    (Value::Number(a), Value::Number(b)) => {
                        let sum = a
                            .checked_add(*b)
                            .ok_or(RuntimeError::IntegerOverflow { op: '+' })?;
                        Ok(Value::Number(sum))
                    }
                    (Value::String(a), Value::String(b)) => Ok(Value::string(format!("{a}{b}"))),
                    (Value::Instance(instance), _)
                        if instance.borrow().has_method(ADD_METHOD, 1) =>
                    {
                        call_method(instance, ADD_METHOD, vec![right.clone()], context)
                    }
                    _ => Err(RuntimeError::UnsupportedOperands {
                        op: '+',
                        lhs: left.type_name(),
                        rhs: right.type_name(),
                    }
                    .into()),
                }
            }

            Statement::Sub(lhs, rhs) => {
                numeric_op('-', lhs, rhs, closure, context, i64::checked_sub)
            }
            Statement::Mult(lhs, rhs) => {
                numeric_op('*', lhs, rhs, closure, context, i64::checked_mul)
            }
            Statement::Div(lhs, rhs) => {
                numeric_op('/', lhs, rhs, closure, context, i64::checked_div)
            }

            Statement::Or(lhs, rhs) => {
                let left = lhs.execute(closure, context)?;
                let Value::Bool(flag) = &left else {
                    return Err(RuntimeError::ExpectedBool {
                        type_name: left.type_name(),
                    }
                    .into());
                };
                if *flag {
                    Ok(left)
                } else {
                    rhs.execute(closure, context)
                }
            }

            Statement::And(lhs, rhs) => {
                let left = lhs.execute(closure, context)?;
                let Value::Bool(flag) = &left else {
                    return Err(RuntimeError::ExpectedBool {
                        type_name: left.type_name(),
                    }
                    .into());
                };
                if *flag {
                    rhs.execute(closure, context)
                } else {
                    Ok(left)
                }
            }

            Statement::Not(arg) => {
                let value = arg.execute(closure, context)?;
                match value {
                    Value::Bool(flag) => Ok(Value::Bool(!flag)),
                    other => Err(RuntimeError::ExpectedBool {
                        type_name: other.type_name(),
                    }
                    .into()),
                }
            }

            Statement::Comparison { op, lhs, rhs } => {
                let left = lhs.execute(closure, context)?;
                let right = rhs.execute(closure, context)?;
                let outcome = match op {
                    Comparator::Equal => runtime::equal(&left, &right, context)?,
                    Comparator::NotEqual => runtime::not_equal(&left, &right, context)?,
                    Comparator::Less => runtime::less(&left, &right, context)?,
                    Comparator::Greater => runtime::greater(&left, &right, context)?,
                    Comparator::LessOrEqual => runtime::less_or_equal(&left, &right, context)?,
                    Comparator::GreaterOrEqual => {
                        runtime::greater_or_equal(&left, &right, context)?
                    }
                };
                Ok(Value::Bool(outcome))
            }

            Statement::Truthy(arg) => {
                let value = arg.execute(closure, context)?;
                Ok(Value::Bool(is_true(&value)))
            }

            Statement::Compound(statements) => {
                for statement in statements {
                    statement.execute(closure, context)?;
                }
                Ok(Value::None)
            }

            Statement::IfElse {
                condition,
                if_body,
                else_body,
            } => {
                let cond = condition.execute(closure, context)?;
                let Value::Bool(flag) = &cond else {
                    return Err(RuntimeError::ExpectedBool {
                        type_name: cond.type_name(),
                    }
                    .into());
                };
                if *flag {
                    if_body.execute(closure, context)
                } else if let Some(else_body) = else_body {
                    else_body.execute(closure, context)
                } else {
                    Ok(Value::None)
                }
            }

            Statement::ClassDefinition(class) => {
                closure.insert(class.name().to_string(), Value::Class(Rc::clone(class)));
                Ok(Value::Class(Rc::clone(class)))
            }

            Statement::MethodBody(body) => match body.execute(closure, context) {
                Ok(_) => Ok(Value::None),
                Err(Unwind::Return(value)) => Ok(value),
                Err(Unwind::Error(error)) => Err(Unwind::Error(error)),
            },

            Statement::Return(expr) => {
                let value = expr.execute(closure, context)?;
                Err(Unwind::Return(value))
            }
        }
    }
}

fn lookup_dotted(dotted_ids: &[String], closure: &Closure) -> ExecResult {
    let (first, rest) = dotted_ids
        .split_first()
        .expect("a dotted chain is never empty");
    let mut value = closure
        .get(first)
        .cloned()
        .ok_or_else(|| RuntimeError::UndefinedVariable {
            name: first.clone(),
        })?;
    for field in rest {
        let Value::Instance(instance) = &value else {
            return Err(RuntimeError::ExpectedInstance {
                type_name: value.type_name(),
            }
            .into());
        };
        let next = instance
            .borrow()
            .fields()
            .get(field)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownField {
                field: field.clone(),
            })?;
        value = next;
    }
    Ok(value)
}

fn numeric_op(
    op: char,
    lhs: &Statement,
    rhs: &Statement,
    closure: &mut Closure,
    context: &mut dyn Context,
    apply: fn(i64, i64) -> Option<i64>,
) -> ExecResult {
    let left = lhs.execute(closure, context)?;
    let right = rhs.execute(closure, context)?;
    match (&left, &right) {
        (Value::Number(a), Value::Number(b)) => {
            if op == '/' && *b == 0 {
                return Err(RuntimeError::DivisionByZero.into());
            }
            let result = apply(*a, *b).ok_or(RuntimeError::IntegerOverflow { op })?;
            Ok(Value::Number(result))
        }
        _ => Err(RuntimeError::UnsupportedOperands {
            op,
            lhs: left.type_name(),
            rhs: right.type_name(),
        }
        .into()),
    }
}

fn write_output(context: &mut dyn Context, text: &str) -> Result<(), Unwind> {
    context
        .output()
        .write_all(text.as_bytes())
        .map_err(|error| RuntimeError::Output(error.to_string()).into())
}

/// Runs a complete Mython program: lex, parse, execute against `output`.
pub fn run_program<W: Write>(source: &str, output: W) -> Result<()> {
    let mut lexer = Lexer::new(source)?;
    let program = parser::parse_program(&mut lexer)?;
    let mut closure = Closure::new();
    let mut context = SimpleContext::new(output);
    match program.execute(&mut closure, &mut context) {
        Ok(_) => Ok(()),
        Err(Unwind::Return(_)) => Err(RuntimeError::ReturnOutsideMethod.into()),
        Err(Unwind::Error(error)) => Err(error.into()),
    }
}
